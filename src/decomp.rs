//! Decompositions: how compute ranks' elements map onto I/O slabs.
//!
//! A [`Decomp`] is an immutable plan for one element layout. Each I/O
//! task owns a contiguous, nearly-equal block of the global element
//! index space; the exchange tables record, per peer, which local
//! buffer positions feed which slab offsets, so that a later
//! [`transfer_field`](crate::transfer::transfer_field) is a single
//! all-to-all regardless of element size.
//!
//! With aggregation enabled ([`Config::agg_factor`](crate::Config) of 2
//! or more), the parent communicator is split into sub-groups of that
//! many ranks; each group gathers its members' elements onto the group
//! leader first, and only leaders take part in the compute-to-I/O
//! exchange. The variant is carried on the decomposition itself, so the
//! write and read paths branch on data, not on build flags.

use crate::context::Context;
use crate::error::{Error, Result};
use crate::transport::{Comm, CommRef};

/// Per-peer table on the compute side: which positions of the (possibly
/// aggregated) compute buffer travel to `task`, in send order.
pub(crate) struct CompPeer {
    pub task: i32,
    pub indices: Vec<usize>,
}

/// Per-peer table on the I/O side: which slab offsets the elements
/// arriving from `task` land in, in receive order.
pub(crate) struct IoPeer {
    pub task: i32,
    pub offsets: Vec<usize>,
}

/// Intra-group aggregation plan of a decomposition.
pub(crate) enum Aggregation {
    /// Every compute rank exchanges directly with the I/O ranks.
    Disabled,
    /// Ranks are grouped; members gather onto the group leader before
    /// the exchange, and scatter after it on the read path.
    Grouped {
        comm: CommRef,
        /// Aggregated element count; non-zero only on the group leader.
        n_compute_agg: usize,
        /// Per-member element counts, significant on the leader.
        counts: Vec<i32>,
        /// Per-member displacements, significant on the leader.
        displs: Vec<i32>,
    },
}

/// An immutable mapping between compute elements and I/O slabs.
///
/// Built collectively by [`Context::create_decomp`]; dropped resources
/// (exchange tables, the aggregation communicator) are released when the
/// value goes out of scope.
pub struct Decomp {
    pub(crate) comm: CommRef,
    pub(crate) comp_list: Vec<CompPeer>,
    pub(crate) io_list: Vec<IoPeer>,
    io_start: i64,
    io_count: usize,
    n_compute: usize,
    pub(crate) agg: Aggregation,
}

impl Decomp {
    /// First global element index of this rank's I/O slab.
    pub fn io_start(&self) -> i64 {
        self.io_start
    }

    /// Number of elements in this rank's I/O slab; zero on non-I/O
    /// ranks.
    pub fn io_count(&self) -> usize {
        self.io_count
    }

    /// Number of compute elements this rank contributed.
    pub fn n_compute(&self) -> usize {
        self.n_compute
    }
}

/// Contiguous range `[start, start + count)` of the global element list
/// owned by `rank`, with the first `num_io_tasks` strided ranks
/// partitioning `[0, n_global)` into nearly-equal blocks. Non-I/O ranks
/// get an empty range.
pub(crate) fn io_range(rank: i32, num_io_tasks: i32, io_stride: i32, n_global: i64) -> (i64, i64) {
    if rank % io_stride != 0 {
        return (0, 0);
    }
    let task = (rank / io_stride) as i64;
    let ntasks = num_io_tasks as i64;
    if task >= ntasks {
        return (0, 0);
    }
    let per = n_global / ntasks;
    let rem = n_global % ntasks;
    let start = task * per + task.min(rem);
    let count = per + i64::from(task < rem);
    (start, count)
}

/// I/O task index owning global element `gid`; inverse of [`io_range`].
fn owner_io_task(gid: i64, num_io_tasks: i32, n_global: i64) -> i64 {
    let ntasks = num_io_tasks as i64;
    let per = n_global / ntasks;
    let rem = n_global % ntasks;
    let boundary = rem * (per + 1);
    if gid < boundary {
        gid / (per + 1)
    } else {
        rem + (gid - boundary) / per
    }
}

fn i64s_to_bytes(vals: &[i64]) -> Vec<u8> {
    vals.iter().flat_map(|v| v.to_ne_bytes()).collect()
}

fn bytes_to_i64s(bytes: &[u8]) -> Vec<i64> {
    bytes
        .chunks_exact(8)
        .map(|c| i64::from_ne_bytes(c.try_into().unwrap()))
        .collect()
}

impl Context {
    /// Build the mapping between compute elements and I/O elements.
    ///
    /// `compute_elements` holds the global indices this rank computes;
    /// indices must lie in `[0, total)` where `total` is the sum of all
    /// ranks' element counts. Collective over the context's
    /// communicator.
    pub fn create_decomp(&self, compute_elements: &[i64]) -> Result<Decomp> {
        let comm = self.comm().clone();
        let n_compute = compute_elements.len();

        let n_global = comm.allreduce_i64(n_compute as i64, crate::transport::ReduceOp::Sum)?;
        let (io_start, io_count) = io_range(
            self.rank(),
            self.num_io_tasks(),
            self.io_stride(),
            n_global,
        );

        // Optional intra-group aggregation: gather members' element
        // lists onto the group leader; only leaders enter the exchange.
        let agg_factor = self.config().agg_factor;
        let (agg, exchange_elems) = if agg_factor >= 2 {
            let agg_comm = comm.split(self.rank() / agg_factor, self.rank())?;
            let gathered = agg_comm.gather_i32(n_compute as i32, 0)?;
            let (counts, displs, total) = match gathered {
                Some(counts) => {
                    let mut displs = vec![0i32; counts.len()];
                    for i in 1..counts.len() {
                        displs[i] = displs[i - 1] + counts[i - 1];
                    }
                    let total: i32 = counts.iter().sum();
                    (counts, displs, total as usize)
                }
                None => (Vec::new(), Vec::new(), 0),
            };

            let mut agg_bytes = vec![0u8; total * 8];
            agg_comm.gatherv_bytes(
                &i64s_to_bytes(compute_elements),
                8,
                &counts,
                &displs,
                0,
                &mut agg_bytes,
            )?;

            (
                Aggregation::Grouped {
                    comm: agg_comm,
                    n_compute_agg: total,
                    counts,
                    displs,
                },
                bytes_to_i64s(&agg_bytes),
            )
        } else {
            (Aggregation::Disabled, compute_elements.to_vec())
        };

        let (comp_list, io_list) = build_exchange(
            &comm,
            &exchange_elems,
            self.num_io_tasks(),
            self.io_stride(),
            n_global,
            io_start,
            io_count,
        )?;

        log::debug!(
            "decomp: rank {} holds {} compute elements, slab [{}, {})",
            self.rank(),
            n_compute,
            io_start,
            io_start + io_count
        );

        Ok(Decomp {
            comm,
            comp_list,
            io_list,
            io_start,
            io_count: io_count as usize,
            n_compute,
            agg,
        })
    }
}

/// Determine per-peer exchange tables: who sends which elements where.
///
/// Each element's owning I/O task follows from the global partitioning
/// alone, so one all-to-all of counts plus one all-to-all of element
/// indices fixes both sides of the table.
fn build_exchange(
    comm: &CommRef,
    elems: &[i64],
    num_io_tasks: i32,
    io_stride: i32,
    n_global: i64,
    io_start: i64,
    io_count: i64,
) -> Result<(Vec<CompPeer>, Vec<IoPeer>)> {
    let size = comm.size() as usize;

    let mut targets = Vec::with_capacity(elems.len());
    for &gid in elems {
        if gid < 0 || gid >= n_global {
            return Err(Error::InvalidArgument(
                "compute element index outside the global element range",
            ));
        }
        let task = owner_io_task(gid, num_io_tasks, n_global);
        targets.push((task * io_stride as i64) as i32);
    }

    // group local elements by destination rank, stable within a peer
    let mut order: Vec<usize> = (0..elems.len()).collect();
    order.sort_by_key(|&i| (targets[i], i));

    let mut sendcounts = vec![0i32; size];
    for &t in &targets {
        sendcounts[t as usize] += 1;
    }
    let recvcounts = comm.alltoall_i32(&sendcounts)?;

    let mut sdispls = vec![0i32; size];
    let mut rdispls = vec![0i32; size];
    for i in 1..size {
        sdispls[i] = sdispls[i - 1] + sendcounts[i - 1];
        rdispls[i] = rdispls[i - 1] + recvcounts[i - 1];
    }

    let send_gids: Vec<i64> = order.iter().map(|&i| elems[i]).collect();
    let total_recv: i32 = recvcounts.iter().sum();
    let mut recv_bytes = vec![0u8; total_recv as usize * 8];
    comm.alltoallv_bytes(
        &i64s_to_bytes(&send_gids),
        &sendcounts,
        &sdispls,
        &mut recv_bytes,
        &recvcounts,
        &rdispls,
        8,
    )?;
    let recv_gids = bytes_to_i64s(&recv_bytes);

    let mut comp_list = Vec::new();
    let mut at = 0usize;
    while at < order.len() {
        let task = targets[order[at]];
        let mut indices = Vec::new();
        while at < order.len() && targets[order[at]] == task {
            indices.push(order[at]);
            at += 1;
        }
        comp_list.push(CompPeer { task, indices });
    }

    let mut io_list = Vec::new();
    for (peer, &rc) in recvcounts.iter().enumerate() {
        if rc == 0 {
            continue;
        }
        let lo = rdispls[peer] as usize;
        let mut offsets = Vec::with_capacity(rc as usize);
        for &gid in &recv_gids[lo..lo + rc as usize] {
            let off = gid - io_start;
            if off < 0 || off >= io_count {
                return Err(Error::InvalidArgument(
                    "received element index outside this rank's I/O slab",
                ));
            }
            offsets.push(off as usize);
        }
        io_list.push(IoPeer {
            task: peer as i32,
            offsets,
        });
    }

    Ok((comp_list, io_list))
}
