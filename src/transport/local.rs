//! In-process transport: a universe of ranks backed by threads.
//!
//! [`LocalComm::universe`] hands out one endpoint per rank; each rank is
//! driven by its own thread. Collectives are built on a single rendezvous
//! primitive — an allgather of byte payloads through a shared hub — which
//! keeps the semantics honest: every collective blocks until all ranks of
//! the communicator arrive, calls must be issued in the same order on
//! every rank, and mismatched orders deadlock just as they would on a
//! real transport.
//!
//! Split and duplicate derive sub-hubs deterministically, so contexts,
//! decompositions and the async writer all run unmodified on this
//! transport. This is the execution mode used by the crate's test suite
//! and by single-node runs without an MPI installation.

use super::{Comm, CommError, CommRef, CommResult, ReduceOp};
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

fn err(message: impl Into<String>) -> CommError {
    CommError {
        code: -1,
        message: message.into(),
    }
}

/// Per-round allgather result, kept until every member has read it.
struct RoundResult {
    data: Arc<Vec<Vec<u8>>>,
    readers_left: usize,
}

struct HubState {
    /// Index of the round currently accepting deposits.
    round: u64,
    /// Deposits received for the current round.
    pending: usize,
    slots: Vec<Option<Vec<u8>>>,
    results: HashMap<u64, RoundResult>,
}

/// Rendezvous point shared by all ranks of one communicator.
struct Hub {
    size: usize,
    state: Mutex<HubState>,
    cond: Condvar,
    /// Sub-hubs under construction, keyed by (round of the split
    /// exchange, color); the last member to claim its handle removes
    /// the entry.
    groups: Mutex<HashMap<(u64, i32), (Arc<Hub>, usize)>>,
}

impl Hub {
    fn new(size: usize) -> Self {
        Hub {
            size,
            state: Mutex::new(HubState {
                round: 0,
                pending: 0,
                slots: vec![None; size],
                results: HashMap::new(),
            }),
            cond: Condvar::new(),
            groups: Mutex::new(HashMap::new()),
        }
    }

    /// Allgather of byte payloads. Blocks until all `size` ranks have
    /// deposited, then every rank receives every payload in rank order.
    /// Returns the round index, which is unique per collective call.
    fn exchange(&self, rank: usize, payload: Vec<u8>) -> (u64, Arc<Vec<Vec<u8>>>) {
        let mut st = self.state.lock().expect("hub mutex poisoned");
        let my_round = st.round;
        debug_assert!(st.slots[rank].is_none(), "rank deposited twice in one round");
        st.slots[rank] = Some(payload);
        st.pending += 1;

        if st.pending == self.size {
            let all: Vec<Vec<u8>> = st.slots.iter_mut().map(|s| s.take().unwrap()).collect();
            st.results.insert(
                my_round,
                RoundResult {
                    data: Arc::new(all),
                    readers_left: self.size,
                },
            );
            st.round += 1;
            st.pending = 0;
            self.cond.notify_all();
        } else {
            while !st.results.contains_key(&my_round) {
                st = self.cond.wait(st).expect("hub mutex poisoned");
            }
        }

        let entry = st.results.get_mut(&my_round).unwrap();
        let data = entry.data.clone();
        entry.readers_left -= 1;
        if entry.readers_left == 0 {
            st.results.remove(&my_round);
        }
        (my_round, data)
    }

    /// Fetch (or create) the shared sub-hub for one split group.
    fn group_hub(&self, round: u64, color: i32, group_size: usize) -> Arc<Hub> {
        let mut groups = self.groups.lock().expect("hub group map poisoned");
        let entry = groups
            .entry((round, color))
            .or_insert_with(|| (Arc::new(Hub::new(group_size)), group_size));
        let hub = entry.0.clone();
        entry.1 -= 1;
        if entry.1 == 0 {
            groups.remove(&(round, color));
        }
        hub
    }
}

/// One rank's endpoint into an in-process communicator.
///
/// # Example
///
/// ```
/// use smiol::transport::{Comm, LocalComm, ReduceOp};
/// use std::thread;
///
/// let comms = LocalComm::universe(4);
/// let handles: Vec<_> = comms
///     .into_iter()
///     .map(|comm| {
///         thread::spawn(move || comm.allreduce_i32(comm.rank(), ReduceOp::Sum).unwrap())
///     })
///     .collect();
/// for h in handles {
///     assert_eq!(h.join().unwrap(), 6);
/// }
/// ```
pub struct LocalComm {
    rank: i32,
    size: i32,
    hub: Arc<Hub>,
}

impl LocalComm {
    /// Create an `n`-rank universe and return one endpoint per rank.
    ///
    /// Each endpoint must be driven by its own thread; collectives block
    /// until all ranks participate.
    pub fn universe(n: usize) -> Vec<CommRef> {
        assert!(n > 0, "universe must hold at least one rank");
        let hub = Arc::new(Hub::new(n));
        (0..n)
            .map(|rank| {
                Arc::new(LocalComm {
                    rank: rank as i32,
                    size: n as i32,
                    hub: hub.clone(),
                }) as CommRef
            })
            .collect()
    }

    fn exchange(&self, payload: Vec<u8>) -> (u64, Arc<Vec<Vec<u8>>>) {
        self.hub.exchange(self.rank as usize, payload)
    }
}

/// Extract the per-destination segment layout used by the v-collectives:
/// a header of one u32 byte-length per peer, then the segments.
fn parse_segmented(payload: &[u8], nranks: usize, dest: usize) -> CommResult<&[u8]> {
    let header = 4 * nranks;
    if payload.len() < header {
        return Err(err("malformed segmented payload"));
    }
    let len_of = |i: usize| {
        u32::from_le_bytes(payload[4 * i..4 * i + 4].try_into().unwrap()) as usize
    };
    let mut offset = header;
    for i in 0..dest {
        offset += len_of(i);
    }
    let len = len_of(dest);
    if offset + len > payload.len() {
        return Err(err("segmented payload shorter than its header claims"));
    }
    Ok(&payload[offset..offset + len])
}

impl Comm for LocalComm {
    fn rank(&self) -> i32 {
        self.rank
    }

    fn size(&self) -> i32 {
        self.size
    }

    fn duplicate(&self) -> CommResult<CommRef> {
        // A duplicate is a split where everyone shares one color and
        // keeps its rank order.
        self.split(0, self.rank)
    }

    fn split(&self, color: i32, key: i32) -> CommResult<CommRef> {
        let mut payload = Vec::with_capacity(8);
        payload.extend_from_slice(&color.to_le_bytes());
        payload.extend_from_slice(&key.to_le_bytes());
        let (round, all) = self.exchange(payload);

        let mut members: Vec<(i32, usize)> = Vec::new();
        for (idx, p) in all.iter().enumerate() {
            if p.len() != 8 {
                return Err(err("malformed split payload"));
            }
            let c = i32::from_le_bytes(p[0..4].try_into().unwrap());
            let k = i32::from_le_bytes(p[4..8].try_into().unwrap());
            if c == color {
                members.push((k, idx));
            }
        }
        members.sort_unstable();

        let new_rank = members
            .iter()
            .position(|&(_, idx)| idx == self.rank as usize)
            .expect("split member list is missing the caller");
        let group_size = members.len();
        let hub = self.hub.group_hub(round, color, group_size);

        Ok(Arc::new(LocalComm {
            rank: new_rank as i32,
            size: group_size as i32,
            hub,
        }))
    }

    fn barrier(&self) -> CommResult<()> {
        self.exchange(Vec::new());
        Ok(())
    }

    fn allreduce_i64(&self, value: i64, op: ReduceOp) -> CommResult<i64> {
        let (_, all) = self.exchange(value.to_le_bytes().to_vec());
        let mut acc: Option<i64> = None;
        for p in all.iter() {
            let v = i64::from_le_bytes(
                p.as_slice()
                    .try_into()
                    .map_err(|_| err("malformed allreduce payload"))?,
            );
            acc = Some(match (acc, op) {
                (None, _) => v,
                (Some(a), ReduceOp::Sum) => a + v,
                (Some(a), ReduceOp::Max) => a.max(v),
            });
        }
        Ok(acc.unwrap())
    }

    fn allreduce_i32(&self, value: i32, op: ReduceOp) -> CommResult<i32> {
        let v = self.allreduce_i64(i64::from(value), op)?;
        Ok(v as i32)
    }

    fn bcast_i32(&self, value: i32, root: i32) -> CommResult<i32> {
        let payload = if self.rank == root {
            value.to_le_bytes().to_vec()
        } else {
            Vec::new()
        };
        let (_, all) = self.exchange(payload);
        let p = &all[root as usize];
        Ok(i32::from_le_bytes(
            p.as_slice()
                .try_into()
                .map_err(|_| err("malformed bcast payload"))?,
        ))
    }

    fn bcast_bytes(&self, buf: &mut [u8], root: i32) -> CommResult<()> {
        let payload = if self.rank == root {
            buf.to_vec()
        } else {
            Vec::new()
        };
        let (_, all) = self.exchange(payload);
        let p = &all[root as usize];
        if p.len() != buf.len() {
            return Err(err("bcast buffer length mismatch across ranks"));
        }
        buf.copy_from_slice(p);
        Ok(())
    }

    fn gather_i32(&self, value: i32, root: i32) -> CommResult<Option<Vec<i32>>> {
        let (_, all) = self.exchange(value.to_le_bytes().to_vec());
        if self.rank != root {
            return Ok(None);
        }
        let mut out = Vec::with_capacity(all.len());
        for p in all.iter() {
            out.push(i32::from_le_bytes(
                p.as_slice()
                    .try_into()
                    .map_err(|_| err("malformed gather payload"))?,
            ));
        }
        Ok(Some(out))
    }

    fn gatherv_bytes(
        &self,
        send: &[u8],
        elem_size: usize,
        counts: &[i32],
        displs: &[i32],
        root: i32,
        recv: &mut [u8],
    ) -> CommResult<()> {
        let (_, all) = self.exchange(send.to_vec());
        if self.rank != root {
            return Ok(());
        }
        if counts.len() != all.len() || displs.len() != all.len() {
            return Err(err("gatherv counts/displs length mismatch"));
        }
        for (i, p) in all.iter().enumerate() {
            let nbytes = counts[i] as usize * elem_size;
            if p.len() != nbytes {
                return Err(err("gatherv contribution does not match its count"));
            }
            let offset = displs[i] as usize * elem_size;
            recv.get_mut(offset..offset + nbytes)
                .ok_or_else(|| err("gatherv receive buffer too small"))?
                .copy_from_slice(p);
        }
        Ok(())
    }

    fn scatterv_bytes(
        &self,
        send: &[u8],
        elem_size: usize,
        counts: &[i32],
        displs: &[i32],
        root: i32,
        recv: &mut [u8],
    ) -> CommResult<()> {
        let nranks = self.size as usize;
        let payload = if self.rank == root {
            if counts.len() != nranks || displs.len() != nranks {
                return Err(err("scatterv counts/displs length mismatch"));
            }
            let mut p = Vec::new();
            for i in 0..nranks {
                p.extend_from_slice(&((counts[i] as u32) * elem_size as u32).to_le_bytes());
            }
            for i in 0..nranks {
                let offset = displs[i] as usize * elem_size;
                let nbytes = counts[i] as usize * elem_size;
                let seg = send
                    .get(offset..offset + nbytes)
                    .ok_or_else(|| err("scatterv send buffer too small"))?;
                p.extend_from_slice(seg);
            }
            p
        } else {
            Vec::new()
        };

        let (_, all) = self.exchange(payload);
        let seg = parse_segmented(&all[root as usize], nranks, self.rank as usize)?;
        if seg.len() != recv.len() {
            return Err(err("scatterv receive count mismatch"));
        }
        recv.copy_from_slice(seg);
        Ok(())
    }

    fn alltoall_i32(&self, send: &[i32]) -> CommResult<Vec<i32>> {
        let nranks = self.size as usize;
        if send.len() != nranks {
            return Err(err("alltoall send buffer must hold one value per peer"));
        }
        let mut payload = Vec::with_capacity(4 * nranks);
        for v in send {
            payload.extend_from_slice(&v.to_le_bytes());
        }
        let (_, all) = self.exchange(payload);
        let me = 4 * self.rank as usize;
        let mut out = Vec::with_capacity(nranks);
        for p in all.iter() {
            if p.len() != 4 * nranks {
                return Err(err("malformed alltoall payload"));
            }
            out.push(i32::from_le_bytes(p[me..me + 4].try_into().unwrap()));
        }
        Ok(out)
    }

    fn alltoallv_bytes(
        &self,
        send: &[u8],
        sendcounts: &[i32],
        sdispls: &[i32],
        recv: &mut [u8],
        recvcounts: &[i32],
        rdispls: &[i32],
        elem_size: usize,
    ) -> CommResult<()> {
        let nranks = self.size as usize;
        if sendcounts.len() != nranks || sdispls.len() != nranks {
            return Err(err("alltoallv send counts/displs length mismatch"));
        }
        if recvcounts.len() != nranks || rdispls.len() != nranks {
            return Err(err("alltoallv recv counts/displs length mismatch"));
        }

        let mut payload = Vec::new();
        for d in 0..nranks {
            payload.extend_from_slice(&((sendcounts[d] as u32) * elem_size as u32).to_le_bytes());
        }
        for d in 0..nranks {
            let offset = sdispls[d] as usize * elem_size;
            let nbytes = sendcounts[d] as usize * elem_size;
            let seg = send
                .get(offset..offset + nbytes)
                .ok_or_else(|| err("alltoallv send buffer too small"))?;
            payload.extend_from_slice(seg);
        }

        let (_, all) = self.exchange(payload);
        for (s, p) in all.iter().enumerate() {
            let seg = parse_segmented(p, nranks, self.rank as usize)?;
            let nbytes = recvcounts[s] as usize * elem_size;
            if seg.len() != nbytes {
                return Err(err("alltoallv sender/receiver count disagreement"));
            }
            let offset = rdispls[s] as usize * elem_size;
            recv.get_mut(offset..offset + nbytes)
                .ok_or_else(|| err("alltoallv receive buffer too small"))?
                .copy_from_slice(seg);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    /// Run one closure per rank on its own thread and collect results.
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

    #[test]
    fn allreduce_sum_and_max() {
        let sums = run_ranks(4, |c| c.allreduce_i64(i64::from(c.rank()) + 1, ReduceOp::Sum));
        for s in sums {
            assert_eq!(s.unwrap(), 10);
        }
        let maxes = run_ranks(3, |c| c.allreduce_i32(c.rank() * 7, ReduceOp::Max));
        for m in maxes {
            assert_eq!(m.unwrap(), 14);
        }
    }

    #[test]
    fn bcast_from_nonzero_root() {
        let vals = run_ranks(4, |c| {
            let v = if c.rank() == 2 { 99 } else { 0 };
            c.bcast_i32(v, 2).unwrap()
        });
        assert_eq!(vals, vec![99; 4]);
    }

    #[test]
    fn bcast_bytes_fills_all_ranks() {
        let vals = run_ranks(3, |c| {
            let mut buf = if c.rank() == 0 {
                vec![7u8, 8, 9]
            } else {
                vec![0u8; 3]
            };
            c.bcast_bytes(&mut buf, 0).unwrap();
            buf
        });
        for v in vals {
            assert_eq!(v, vec![7, 8, 9]);
        }
    }

    #[test]
    fn gather_collects_in_rank_order() {
        let vals = run_ranks(4, |c| c.gather_i32(c.rank() * 10, 1).unwrap());
        assert_eq!(vals[1], Some(vec![0, 10, 20, 30]));
        assert_eq!(vals[0], None);
        assert_eq!(vals[3], None);
    }

    #[test]
    fn gatherv_scatterv_round_trip() {
        // Rank r holds r+1 values of 4 bytes each; rank 0 gathers then
        // scatters them back.
        let out = run_ranks(3, |c| {
            let r = c.rank();
            let mine: Vec<u8> = (0..(r + 1) * 4).map(|i| (r * 100 + i) as u8).collect();
            let counts = [1, 2, 3];
            let displs = [0, 1, 3];
            let mut gathered = vec![0u8; if r == 0 { 24 } else { 0 }];
            c.gatherv_bytes(&mine, 4, &counts, &displs, 0, &mut gathered)
                .unwrap();

            let mut back = vec![0u8; mine.len()];
            c.scatterv_bytes(&gathered, 4, &counts, &displs, 0, &mut back)
                .unwrap();
            back == mine
        });
        assert!(out.into_iter().all(|ok| ok));
    }

    #[test]
    fn alltoall_exchanges_values() {
        let vals = run_ranks(3, |c| {
            let send: Vec<i32> = (0..3).map(|d| c.rank() * 10 + d).collect();
            c.alltoall_i32(&send).unwrap()
        });
        // Rank r receives s*10 + r from each sender s.
        for (r, got) in vals.iter().enumerate() {
            let expect: Vec<i32> = (0..3).map(|s| s * 10 + r as i32).collect();
            assert_eq!(*got, expect);
        }
    }

    #[test]
    fn alltoallv_moves_element_runs() {
        // Two ranks swap unequal element runs of 8-byte elements.
        let ok = run_ranks(2, |c| {
            let r = c.rank();
            let nsend = [2usize, 1][r as usize];
            let send: Vec<u8> = (0..nsend * 8).map(|i| (r * 50 + i as i32) as u8).collect();
            let (sc, sd) = if r == 0 {
                // keep nothing local: both elements go to rank 1
                (vec![0, 2], vec![0, 0])
            } else {
                (vec![1, 0], vec![0, 1])
            };
            let nrecv = [1usize, 2][r as usize];
            let mut recv = vec![0u8; nrecv * 8];
            let (rc, rd) = if r == 0 {
                (vec![0, 1], vec![0, 0])
            } else {
                (vec![2, 0], vec![0, 2])
            };
            c.alltoallv_bytes(&send, &sc, &sd, &mut recv, &rc, &rd, 8)
                .unwrap();
            if r == 0 {
                // rank 1's single element
                recv == (0..8).map(|i| (50 + i) as u8).collect::<Vec<_>>()
            } else {
                recv == (0..16).map(|i| i as u8).collect::<Vec<_>>()
            }
        });
        assert!(ok.into_iter().all(|x| x));
    }

    #[test]
    fn split_builds_working_subgroups() {
        let vals = run_ranks(6, |c| {
            // groups of two: {0,1} {2,3} {4,5}
            let sub = c.split(c.rank() / 2, c.rank()).unwrap();
            assert_eq!(sub.size(), 2);
            assert_eq!(sub.rank(), c.rank() % 2);
            sub.allreduce_i32(c.rank(), ReduceOp::Sum).unwrap()
        });
        assert_eq!(vals, vec![1, 1, 5, 5, 9, 9]);
    }

    #[test]
    fn duplicate_preserves_rank_and_size() {
        let ok = run_ranks(3, |c| {
            let dup = c.duplicate().unwrap();
            dup.rank() == c.rank()
                && dup.size() == c.size()
                && dup.allreduce_i32(1, ReduceOp::Sum).unwrap() == 3
        });
        assert!(ok.into_iter().all(|x| x));
    }

    #[test]
    fn successive_collectives_stay_in_step() {
        let vals = run_ranks(4, |c| {
            let mut acc = 0;
            for i in 0..50 {
                acc += c.allreduce_i32(i, ReduceOp::Sum).unwrap();
            }
            acc
        });
        let expect: i32 = (0..50).map(|i| i * 4).sum();
        assert_eq!(vals, vec![expect; 4]);
    }

    #[test]
    fn single_rank_universe_is_trivial() {
        let comms = LocalComm::universe(1);
        let c = &comms[0];
        assert_eq!(c.size(), 1);
        assert_eq!(c.allreduce_i64(42, ReduceOp::Max).unwrap(), 42);
        assert_eq!(c.bcast_i32(7, 0).unwrap(), 7);
        let sub = c.split(0, 0).unwrap();
        assert_eq!(sub.size(), 1);
    }
}
