//! The message-passing transport seam.
//!
//! The library never talks to MPI directly; everything goes through the
//! [`Comm`] trait, which names exactly the collectives the I/O pipeline
//! needs. Two implementations are provided:
//!
//! - [`local::LocalComm`] — an in-process universe of ranks backed by a
//!   shared rendezvous hub, always available; this is what the test
//!   suite runs the full pipeline on.
//! - [`mpi::MpiComm`] (feature `mpi`) — real MPI through the C shim,
//!   with integer communicator handles into a C-side table.
//!
//! Counts and displacements for the v-collectives are expressed in
//! *elements* together with an explicit element size, mirroring the
//! contiguous-datatype idiom used on the MPI side.

pub mod local;
#[cfg(feature = "mpi")]
pub mod mpi;

pub use local::LocalComm;

use std::sync::Arc;
use thiserror::Error;

/// Shared handle to a communicator.
pub type CommRef = Arc<dyn Comm>;

/// Reduction operations for the all-reduce collectives.
///
/// The discriminants must stay in sync with the `SMIOL_SHIM_OP_*` values
/// in `csrc/smiol_shim.h`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ReduceOp {
    /// Sum of values
    Sum = 0,
    /// Maximum value
    Max = 1,
}

/// A failed transport operation.
///
/// `code` is the transport's own error code (an MPI error code for the
/// MPI transport), preserved verbatim.
#[derive(Error, Debug, Clone)]
#[error("{message} (code={code})")]
pub struct CommError {
    /// Transport-specific error code.
    pub code: i32,
    /// Human-readable message from the transport.
    pub message: String,
}

/// Result type for transport operations.
pub type CommResult<T> = std::result::Result<T, CommError>;

/// The collectives required by the I/O pipeline.
///
/// All operations are collective: every rank of the communicator must
/// call them in the same order. Implementations must be `Send + Sync`;
/// the async writer issues collectives from its own thread, though never
/// the same call concurrently with an application thread on the same
/// communicator.
pub trait Comm: Send + Sync {
    /// Rank of the calling process in this communicator.
    fn rank(&self) -> i32;

    /// Number of processes in this communicator.
    fn size(&self) -> i32;

    /// Duplicate this communicator.
    fn duplicate(&self) -> CommResult<CommRef>;

    /// Split into sub-communicators by color; `key` orders ranks within
    /// each new communicator.
    fn split(&self, color: i32, key: i32) -> CommResult<CommRef>;

    /// Barrier synchronization.
    fn barrier(&self) -> CommResult<()>;

    /// All-reduce a single `i64`.
    fn allreduce_i64(&self, value: i64, op: ReduceOp) -> CommResult<i64>;

    /// All-reduce a single `i32`.
    fn allreduce_i32(&self, value: i32, op: ReduceOp) -> CommResult<i32>;

    /// Broadcast a single `i32` from `root`; every rank returns the
    /// root's value.
    fn bcast_i32(&self, value: i32, root: i32) -> CommResult<i32>;

    /// Broadcast a byte buffer from `root` in place. All ranks must pass
    /// buffers of the same length.
    fn bcast_bytes(&self, buf: &mut [u8], root: i32) -> CommResult<()>;

    /// Gather one `i32` per rank to `root`. Returns the gathered values
    /// in rank order on the root and `None` elsewhere.
    fn gather_i32(&self, value: i32, root: i32) -> CommResult<Option<Vec<i32>>>;

    /// Gather variable-length element runs to `root`. `send` holds this
    /// rank's elements (`send.len()` must be a multiple of `elem_size`);
    /// `counts`/`displs` are element-granular and significant only at the
    /// root, as is `recv`.
    fn gatherv_bytes(
        &self,
        send: &[u8],
        elem_size: usize,
        counts: &[i32],
        displs: &[i32],
        root: i32,
        recv: &mut [u8],
    ) -> CommResult<()>;

    /// Scatter variable-length element runs from `root`. `send`,
    /// `counts` and `displs` are significant only at the root; every
    /// rank receives `recv.len() / elem_size` elements.
    fn scatterv_bytes(
        &self,
        send: &[u8],
        elem_size: usize,
        counts: &[i32],
        displs: &[i32],
        root: i32,
        recv: &mut [u8],
    ) -> CommResult<()>;

    /// All-to-all of one `i32` per peer. `send.len()` must equal the
    /// communicator size; the result holds one value from each peer.
    fn alltoall_i32(&self, send: &[i32]) -> CommResult<Vec<i32>>;

    /// All-to-all of variable-length element runs. Counts and
    /// displacements are element-granular, one entry per peer.
    #[allow(clippy::too_many_arguments)]
    fn alltoallv_bytes(
        &self,
        send: &[u8],
        sendcounts: &[i32],
        sdispls: &[i32],
        recv: &mut [u8],
        recvcounts: &[i32],
        rdispls: &[i32],
        elem_size: usize,
    ) -> CommResult<()>;

    /// The raw MPI communicator handle, if this communicator is backed
    /// by the MPI transport. Backends that hand a communicator to a
    /// native library use this; other transports return `None`.
    fn mpi_handle(&self) -> Option<i32> {
        None
    }
}
