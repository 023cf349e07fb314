//! The process-wide I/O context.
//!
//! A [`Context`] duplicates the application's communicator (the library
//! never communicates through an application-owned communicator) and
//! derives the two split communicators the pipeline runs on:
//!
//! - the **I/O-task communicator**: ranks where `rank % io_stride == 0`
//!   form the I/O side, everyone else the non-I/O side;
//! - the **I/O-group communicator**: one group per `rank / io_stride`,
//!   keyed by rank so the group's I/O rank is always group rank 0.
//!
//! The context also carries the latched `(backend, errno)` pair behind
//! [`Context::lib_error_string`]. Apart from that pair it is immutable
//! after construction and may be shared by any number of files and
//! decompositions.

use crate::backend::BackendKind;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::transport::{Comm, CommRef};
use std::sync::atomic::{AtomicI32, Ordering};

/// Process-wide handle for opening files and building decompositions.
///
/// # Example
///
/// ```
/// use smiol::transport::LocalComm;
/// use smiol::Context;
///
/// let comm = LocalComm::universe(1).remove(0);
/// let ctx = Context::new(comm, 1, 1).unwrap();
/// assert!(ctx.is_io_task());
/// ```
pub struct Context {
    comm: CommRef,
    io_comm: CommRef,
    group_comm: CommRef,
    rank: i32,
    size: i32,
    num_io_tasks: i32,
    io_stride: i32,
    config: Config,
    lib_kind: AtomicI32,
    lib_errno: AtomicI32,
}

impl Context {
    /// Create a context with default [`Config`].
    ///
    /// `num_io_tasks` I/O ranks are taken from `comm` at every
    /// `io_stride`-th rank. Collective over `comm`.
    pub fn new(comm: CommRef, num_io_tasks: i32, io_stride: i32) -> Result<Self> {
        Self::with_config(comm, num_io_tasks, io_stride, Config::default())
    }

    /// Create a context with explicit tunables. Collective over `comm`.
    pub fn with_config(
        comm: CommRef,
        num_io_tasks: i32,
        io_stride: i32,
        config: Config,
    ) -> Result<Self> {
        if num_io_tasks < 1 {
            return Err(Error::InvalidArgument("num_io_tasks must be at least 1"));
        }
        if io_stride < 1 {
            return Err(Error::InvalidArgument("io_stride must be at least 1"));
        }

        let comm = comm.duplicate()?;
        let rank = comm.rank();
        let size = comm.size();
        if (num_io_tasks - 1) * io_stride >= size {
            return Err(Error::InvalidArgument(
                "num_io_tasks * io_stride exceeds the communicator size",
            ));
        }

        let io_task = rank % io_stride == 0;
        let io_comm = comm.split(i32::from(io_task), rank)?;
        let group_comm = comm.split(rank / io_stride, rank)?;

        log::debug!(
            "context: rank {rank}/{size}, {num_io_tasks} I/O tasks at stride {io_stride}, \
             io_task={io_task}"
        );

        Ok(Context {
            comm,
            io_comm,
            group_comm,
            rank,
            size,
            num_io_tasks,
            io_stride,
            config,
            lib_kind: AtomicI32::new(BackendKind::Unknown as i32),
            lib_errno: AtomicI32::new(0),
        })
    }

    /// Create a context from a Fortran integer communicator handle
    /// (`MPI_Fint`), for callers whose communicator crosses a foreign
    /// function boundary.
    #[cfg(feature = "mpi")]
    pub fn from_fortran(
        fcomm: i32,
        num_io_tasks: i32,
        io_stride: i32,
        config: Config,
    ) -> Result<Self> {
        let comm =
            crate::transport::mpi::MpiComm::from_fortran(fcomm).map_err(|_| Error::Fortran)?;
        Self::with_config(comm, num_io_tasks, io_stride, config)
    }

    /// Release the context. Communicators are freed on drop; this method
    /// exists for callers that want the release to be explicit.
    pub fn finalize(self) -> Result<()> {
        Ok(())
    }

    /// Rank of this process in the context's communicator.
    pub fn rank(&self) -> i32 {
        self.rank
    }

    /// Number of ranks in the context's communicator.
    pub fn size(&self) -> i32 {
        self.size
    }

    /// Total number of I/O tasks.
    pub fn num_io_tasks(&self) -> i32 {
        self.num_io_tasks
    }

    /// Stride between I/O tasks in the communicator.
    pub fn io_stride(&self) -> i32 {
        self.io_stride
    }

    /// Whether this rank performs backend I/O for its group.
    pub fn is_io_task(&self) -> bool {
        self.rank % self.io_stride == 0
    }

    pub(crate) fn comm(&self) -> &CommRef {
        &self.comm
    }

    pub(crate) fn io_comm(&self) -> &CommRef {
        &self.io_comm
    }

    pub(crate) fn group_comm(&self) -> &CommRef {
        &self.group_comm
    }

    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    /// Latch a backend error pair; kept until overwritten by a later
    /// failure.
    pub(crate) fn latch_lib_error(&self, kind: BackendKind, errno: i32) {
        self.lib_kind.store(kind as i32, Ordering::Relaxed);
        self.lib_errno.store(errno, Ordering::Relaxed);
        log::debug!("latched backend error: {kind}, errno {errno}");
    }

    /// The backend's own message for the most recently latched library
    /// error. Meaningful after an operation returned
    /// [`ErrorCode::LibraryError`](crate::ErrorCode::LibraryError).
    pub fn lib_error_string(&self) -> String {
        let kind = BackendKind::from_tag(self.lib_kind.load(Ordering::Relaxed));
        let errno = self.lib_errno.load(Ordering::Relaxed);
        crate::backend::lib_error_string(kind, errno)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Comm, LocalComm, ReduceOp};
    use std::thread;

    #[test]
    fn rejects_bad_task_layout() {
        let comm = LocalComm::universe(1).remove(0);
        assert!(matches!(
            Context::new(comm.clone(), 0, 1),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            Context::new(comm.clone(), 1, 0),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            Context::new(comm, 2, 1),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn splits_form_io_side_and_groups() {
        // 4 ranks, stride 2: I/O ranks are 0 and 2; groups {0,1} {2,3}.
        let comms = LocalComm::universe(4);
        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| {
                thread::spawn(move || {
                    let ctx = Context::new(comm, 2, 2).unwrap();
                    let io_side = ctx.io_comm().size();
                    let group = ctx.group_comm().size();
                    let group_rank = ctx.group_comm().rank();
                    (ctx.rank(), ctx.is_io_task(), io_side, group, group_rank)
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        for (rank, io_task, io_side, group, group_rank) in results {
            assert_eq!(io_task, rank % 2 == 0);
            // both sides of the is-I/O split have two members here
            assert_eq!(io_side, 2);
            assert_eq!(group, 2);
            // the I/O rank is listed first in its group
            assert_eq!(group_rank, rank % 2);
        }
    }

    #[test]
    fn io_comm_reduces_over_io_side_only() {
        let comms = LocalComm::universe(4);
        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| {
                thread::spawn(move || {
                    let ctx = Context::new(comm, 1, 4).unwrap();
                    // rank 0 is the only I/O task; sides are {0} and {1,2,3}
                    let sum = ctx
                        .io_comm()
                        .allreduce_i32(1, ReduceOp::Sum)
                        .unwrap();
                    (ctx.rank(), ctx.is_io_task(), sum)
                })
            })
            .collect();
        for h in handles {
            let (rank, io_task, sum) = h.join().unwrap();
            if io_task {
                assert_eq!((rank, sum), (0, 1));
            } else {
                assert_eq!(sum, 3);
            }
        }
    }

    #[test]
    fn latched_errors_are_reported() {
        let comm = LocalComm::universe(1).remove(0);
        let ctx = Context::new(comm, 1, 1).unwrap();
        assert_eq!(
            ctx.lib_error_string(),
            "Could not find matching library for the source of the error"
        );
        ctx.latch_lib_error(BackendKind::Memory, crate::backend::memory::NC_ENOTVAR);
        assert_eq!(ctx.lib_error_string(), "Variable not found");
    }
}
