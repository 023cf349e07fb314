//! The per-file background writer.
//!
//! One thread per file drains the write queue and posts buffered
//! non-blocking puts to the backend. Because backend calls are
//! collective across the I/O ranks, the writers on different ranks must
//! stay in lock-step even though their local queues fill at different
//! speeds. The protocol, per iteration:
//!
//! 1. take the file's ticket lock and all-reduce (SUM) the local
//!    queue-emptiness flag over the writer communicator;
//! 2. unless the result is unanimous — `0` (no queue is empty) or the
//!    writer count (every queue is empty) — release the lock and retry:
//!    no collective backend call may be issued this round;
//! 3. on unanimous-empty with no outstanding requests, clear the
//!    file's `active` flag and exit; this is the only safe exit, since
//!    leaving while a peer still holds requests would strand its next
//!    collective `wait_all`;
//! 4. otherwise pop one descriptor, all-reduce (MAX) the would-be
//!    attached-buffer usage, flush with a collective `wait_all` when
//!    the maximum exceeds the buffer budget or the request table is
//!    full, then post the buffered put.
//!
//! The usage reduction exists because each rank's attached buffer is
//! private but the decision to flush must be collective. Faults inside
//! the writer have no caller to return to; they latch into the shared
//! fault slot and surface on the next `sync`, `close` or `get_var`.

use crate::backend::BackendFile;
use crate::queue::{AsyncQueue, TicketLock};
use crate::transport::{Comm, CommError, CommRef, ReduceOp};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

/// A failure the writer could not report in line.
pub(crate) enum WriterFault {
    /// A backend call failed with this status code.
    Backend(i32),
    /// A transport collective failed; the writers' lock-step is lost.
    Transport(CommError),
}

/// State shared between a file's API side and its writer thread.
pub(crate) struct WriterShared {
    pub queue: AsyncQueue,
    pub ticket: TicketLock,
    pub active: AtomicBool,
    /// Dedicated duplicate of the I/O-task communicator; no other
    /// collective ever runs on it, so writers of different files cannot
    /// interleave.
    pub writer_comm: CommRef,
    pub backend: Option<Arc<dyn BackendFile>>,
    pub n_reqs_cap: usize,
    pub buf_size: i64,
    pub fault: Mutex<Option<WriterFault>>,
    #[cfg_attr(not(feature = "affinity"), allow(dead_code))]
    pub writer_cores: Vec<usize>,
}

impl WriterShared {
    /// Latch the first fault; later ones are dropped.
    fn fail(&self, fault: WriterFault) {
        let mut slot = self.fault.lock().expect("fault mutex poisoned");
        if slot.is_none() {
            match &fault {
                WriterFault::Backend(e) => log::warn!("writer: backend call failed ({e})"),
                WriterFault::Transport(e) => log::warn!("writer: transport failed: {e}"),
            }
            *slot = Some(fault);
        }
    }
}

/// Spawn the writer thread for a file.
pub(crate) fn launch(shared: Arc<WriterShared>) -> std::io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("smiol-writer".into())
        .spawn(move || run(shared))
}

#[cfg(feature = "affinity")]
fn pin_writer(cores: &[usize]) {
    if cores.is_empty() {
        return;
    }
    if let Some(ids) = core_affinity::get_core_ids() {
        if let Some(id) = ids.into_iter().find(|id| cores.contains(&id.id)) {
            core_affinity::set_for_current(id);
        }
    }
}

fn run(shared: Arc<WriterShared>) {
    #[cfg(feature = "affinity")]
    pin_writer(&shared.writer_cores);

    let backend = match &shared.backend {
        Some(b) => b.clone(),
        None => {
            // writers are only launched on I/O ranks
            shared.active.store(false, Ordering::Release);
            return;
        }
    };
    let n_writers = shared.writer_comm.size();
    let mut reqs: Vec<i32> = Vec::with_capacity(shared.n_reqs_cap);
    log::trace!("writer: started ({n_writers} peers)");

    loop {
        let ticket = shared.ticket.lock();
        let empty = shared.queue.is_empty();
        let sum = match shared.writer_comm.allreduce_i32(i32::from(empty), ReduceOp::Sum) {
            Ok(s) => s,
            Err(e) => {
                shared.fail(WriterFault::Transport(e));
                shared.active.store(false, Ordering::Release);
                drop(ticket);
                break;
            }
        };

        // the flag is 0 or 1 per rank, so the sum is unanimous only at
        // 0 or n_writers
        let unanimous = sum == 0 || sum == n_writers;
        let mut desc = None;
        if unanimous {
            desc = shared.queue.remove();
            if desc.is_none() && reqs.is_empty() {
                shared.active.store(false, Ordering::Release);
                drop(ticket);
                break;
            }
        }
        drop(ticket);

        if !unanimous {
            continue;
        }

        match desc {
            Some(d) => {
                let usage = match backend.buffer_usage() {
                    Ok(u) => u,
                    Err(e) => {
                        shared.fail(WriterFault::Backend(e));
                        0
                    }
                };
                let max_usage =
                    match shared.writer_comm.allreduce_i64(usage + d.bufsize, ReduceOp::Max) {
                        Ok(m) => m,
                        Err(e) => {
                            shared.fail(WriterFault::Transport(e));
                            shared.active.store(false, Ordering::Release);
                            break;
                        }
                    };

                if max_usage > shared.buf_size || reqs.len() >= shared.n_reqs_cap {
                    log::debug!(
                        "writer: flushing {} requests, {} bytes pending at the fullest rank",
                        reqs.len(),
                        max_usage
                    );
                    if let Err(e) = backend.wait_all(&mut reqs) {
                        shared.fail(WriterFault::Backend(e));
                    }
                    reqs.clear();
                }

                match backend.bput_vara(d.var_id, &d.start, &d.count, &d.buf) {
                    Ok(req) => reqs.push(req),
                    Err(e) => shared.fail(WriterFault::Backend(e)),
                }
                // the buffered put copied d.buf into the attached
                // buffer; the descriptor and its buffer die here
            }
            None => {
                if !reqs.is_empty() {
                    if let Err(e) = backend.wait_all(&mut reqs) {
                        shared.fail(WriterFault::Backend(e));
                    }
                    reqs.clear();
                }
            }
        }
    }

    log::trace!("writer: exiting");
}
