//! The transfer engine: executes the redistribution a decomposition
//! describes.
//!
//! Elements are treated as opaque byte blocks of a fixed size, so one
//! implementation serves every scalar type. The whole exchange is a
//! single all-to-all driven by the decomposition's per-peer tables.

use crate::decomp::Decomp;
use crate::error::{Error, Result};
use crate::transport::Comm;

/// Which way [`transfer_field`] moves elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// From compute buffers to I/O slabs (write path).
    CompToIo,
    /// From I/O slabs to compute buffers (read path).
    IoToComp,
}

/// Move fixed-size elements between compute buffers and I/O slabs.
///
/// For [`Direction::CompToIo`], `src` is this rank's (possibly
/// aggregated) compute buffer and `dst` its I/O slab; for
/// [`Direction::IoToComp`] the roles are reversed. Collective over the
/// decomposition's communicator.
pub fn transfer_field(
    decomp: &Decomp,
    direction: Direction,
    elem_size: usize,
    src: &[u8],
    dst: &mut [u8],
) -> Result<()> {
    let size = decomp.comm.size() as usize;

    let mut comp_counts = vec![0i32; size];
    for p in &decomp.comp_list {
        comp_counts[p.task as usize] = p.indices.len() as i32;
    }
    let mut io_counts = vec![0i32; size];
    for p in &decomp.io_list {
        io_counts[p.task as usize] = p.offsets.len() as i32;
    }

    let (sendcounts, recvcounts) = match direction {
        Direction::CompToIo => (comp_counts, io_counts),
        Direction::IoToComp => (io_counts, comp_counts),
    };

    let mut sdispls = vec![0i32; size];
    let mut rdispls = vec![0i32; size];
    for i in 1..size {
        sdispls[i] = sdispls[i - 1] + sendcounts[i - 1];
        rdispls[i] = rdispls[i - 1] + recvcounts[i - 1];
    }
    let n_send: i32 = sendcounts.iter().sum();
    let n_recv: i32 = recvcounts.iter().sum();

    check_len(src.len(), n_send as usize, elem_size)?;
    check_len(dst.len(), n_recv as usize, elem_size)?;

    // pack in peer order; the tables are already sorted by peer
    let mut send_buf = vec![0u8; n_send as usize * elem_size];
    let mut at = 0usize;
    match direction {
        Direction::CompToIo => {
            for p in &decomp.comp_list {
                for &idx in &p.indices {
                    send_buf[at..at + elem_size]
                        .copy_from_slice(&src[idx * elem_size..(idx + 1) * elem_size]);
                    at += elem_size;
                }
            }
        }
        Direction::IoToComp => {
            for p in &decomp.io_list {
                for &off in &p.offsets {
                    send_buf[at..at + elem_size]
                        .copy_from_slice(&src[off * elem_size..(off + 1) * elem_size]);
                    at += elem_size;
                }
            }
        }
    }

    let mut recv_buf = vec![0u8; n_recv as usize * elem_size];
    decomp.comm.alltoallv_bytes(
        &send_buf,
        &sendcounts,
        &sdispls,
        &mut recv_buf,
        &recvcounts,
        &rdispls,
        elem_size,
    )?;

    // scatter received elements to their table positions
    match direction {
        Direction::CompToIo => {
            for p in &decomp.io_list {
                let base = rdispls[p.task as usize] as usize * elem_size;
                for (k, &off) in p.offsets.iter().enumerate() {
                    let from = base + k * elem_size;
                    dst[off * elem_size..(off + 1) * elem_size]
                        .copy_from_slice(&recv_buf[from..from + elem_size]);
                }
            }
        }
        Direction::IoToComp => {
            for p in &decomp.comp_list {
                let base = rdispls[p.task as usize] as usize * elem_size;
                for (k, &idx) in p.indices.iter().enumerate() {
                    let from = base + k * elem_size;
                    dst[idx * elem_size..(idx + 1) * elem_size]
                        .copy_from_slice(&recv_buf[from..from + elem_size]);
                }
            }
        }
    }

    Ok(())
}

fn check_len(have_bytes: usize, needed_elems: usize, elem_size: usize) -> Result<()> {
    if have_bytes < needed_elems * elem_size {
        return Err(Error::InsufficientArg {
            needed: needed_elems,
            have: have_bytes / elem_size.max(1),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::transport::{CommRef, LocalComm};
    use std::thread;

    fn run_ranks<T, F>(n: usize, f: F) -> Vec<T>
    where
        T: Send + 'static,
        F: Fn(CommRef) -> T + Send + Sync + Clone + 'static,
    {
        let comms = LocalComm::universe(n);
        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| {
                let f = f.clone();
                thread::spawn(move || f(comm))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    fn f64s(vals: &[f64]) -> Vec<u8> {
        vals.iter().flat_map(|v| v.to_ne_bytes()).collect()
    }

    fn from_bytes(bytes: &[u8]) -> Vec<f64> {
        bytes
            .chunks_exact(8)
            .map(|c| f64::from_ne_bytes(c.try_into().unwrap()))
            .collect()
    }

    #[test]
    fn slabs_assemble_in_global_order() {
        // 4 ranks, 2 I/O tasks; rank r computes elements r and r+4 with
        // value = 10 * global index
        let results = run_ranks(4, |comm| {
            let ctx = Context::new(comm, 2, 2).unwrap();
            let rank = ctx.rank();
            let gids = [i64::from(rank), i64::from(rank) + 4];
            let d = ctx.create_decomp(&gids).unwrap();

            let vals: Vec<f64> = gids.iter().map(|&g| g as f64 * 10.0).collect();
            let mut slab = vec![0u8; d.io_count() * 8];
            transfer_field(&d, Direction::CompToIo, 8, &f64s(&vals), &mut slab).unwrap();
            (rank, d.io_start(), from_bytes(&slab))
        });

        for (rank, io_start, slab) in results {
            if rank % 2 == 0 {
                let expect: Vec<f64> = (io_start..io_start + 4).map(|g| g as f64 * 10.0).collect();
                assert_eq!(slab, expect, "rank {rank}");
            } else {
                assert!(slab.is_empty());
            }
        }
    }

    #[test]
    fn round_trip_is_identity() {
        let ok = run_ranks(4, |comm| {
            let ctx = Context::new(comm, 2, 2).unwrap();
            let rank = ctx.rank();
            // a deliberately scrambled layout
            let gids = [i64::from(3 - rank) * 2, i64::from(3 - rank) * 2 + 1];
            let d = ctx.create_decomp(&gids).unwrap();

            let vals: Vec<f64> = gids.iter().map(|&g| 1000.0 + g as f64).collect();
            let mut slab = vec![0u8; d.io_count() * 8];
            transfer_field(&d, Direction::CompToIo, 8, &f64s(&vals), &mut slab).unwrap();

            let mut back = vec![0u8; vals.len() * 8];
            transfer_field(&d, Direction::IoToComp, 8, &slab, &mut back).unwrap();
            from_bytes(&back) == vals
        });
        assert!(ok.into_iter().all(|x| x));
    }

    #[test]
    fn element_size_is_opaque() {
        // 12-byte elements (three i32 per element) survive the exchange
        let ok = run_ranks(2, |comm| {
            let ctx = Context::new(comm, 2, 1).unwrap();
            let rank = ctx.rank();
            let gids = [i64::from(rank * 2), i64::from(rank * 2 + 1)];
            let d = ctx.create_decomp(&gids).unwrap();

            let mut bytes = Vec::new();
            for &g in &gids {
                for k in 0..3i32 {
                    bytes.extend_from_slice(&(g as i32 * 10 + k).to_ne_bytes());
                }
            }
            let mut slab = vec![0u8; d.io_count() * 12];
            transfer_field(&d, Direction::CompToIo, 12, &bytes, &mut slab).unwrap();

            let mut back = vec![0u8; bytes.len()];
            transfer_field(&d, Direction::IoToComp, 12, &slab, &mut back).unwrap();
            back == bytes
        });
        assert!(ok.into_iter().all(|x| x));
    }

    #[test]
    fn short_buffers_are_rejected() {
        let results = run_ranks(1, |comm| {
            let ctx = Context::new(comm, 1, 1).unwrap();
            let d = ctx.create_decomp(&[0, 1]).unwrap();
            let src = vec![0u8; 8]; // one element short
            let mut dst = vec![0u8; 16];
            transfer_field(&d, Direction::CompToIo, 8, &src, &mut dst)
        });
        assert!(matches!(
            results.into_iter().next().unwrap(),
            Err(Error::InsufficientArg { needed: 2, have: 1 })
        ));
    }
}
