//! # smiol
//!
//! A simple MPI I/O library: mediates between an application whose
//! compute ranks hold distributed slices of multi-dimensional arrays
//! and a parallel file backend whose writer ranks are a smaller subset
//! of the application, overlapping file writes with computation through
//! a per-file background writer.
//!
//! The pipeline, end to end: a [`Context`] splits the application's
//! communicator into an I/O-task side and per-I/O-rank groups; a
//! [`Decomp`] maps each rank's compute elements onto contiguous I/O
//! slabs; `put_var` redistributes elements with a single all-to-all and
//! queues a write descriptor; the per-file writer thread keeps peers in
//! lock-step with a queue-emptiness all-reduce and posts buffered
//! non-blocking puts, flushing collectively when the attached buffer
//! fills.
//!
//! ## Quick Start
//!
//! ```
//! use smiol::transport::LocalComm;
//! use smiol::{Context, FileMode, VarType};
//! use std::sync::Arc;
//!
//! fn main() -> Result<(), smiol::Error> {
//!     // one in-process rank; see transport::mpi for real MPI runs
//!     let comm = LocalComm::universe(1).remove(0);
//!     let ctx = Arc::new(Context::new(comm, 1, 1)?);
//!
//!     let decomp = ctx.create_decomp(&[0, 1, 2, 3])?;
//!
//!     let file = ctx.open_file("out.nc", FileMode::CREATE)?;
//!     file.define_dim("nCells", 4)?;
//!     file.define_var("x", VarType::Real64, &["nCells"])?;
//!
//!     file.put_var("x", Some(&decomp), &[0.0f64, 1.0, 2.0, 3.0])?;
//!     file.sync()?;
//!
//!     let mut back = [0.0f64; 4];
//!     file.get_var("x", Some(&decomp), &mut back)?;
//!     assert_eq!(back, [0.0, 1.0, 2.0, 3.0]);
//!
//!     file.close()?;
//!     Ok(())
//! }
//! ```
//!
//! ## Ranks, strides, and groups
//!
//! `Context::new(comm, num_io_tasks, io_stride)` marks every
//! `io_stride`-th rank as an I/O task. Each I/O task serves its *I/O
//! group* (the ranks sharing `rank / io_stride`): backend calls happen
//! on the I/O rank only, and their status is broadcast across the group
//! so every rank takes the same branch. Decompositions assign each I/O
//! task a contiguous, nearly-equal slab of the global element space.
//!
//! ## Feature Flags
//!
//! | Feature    | Description                                   | Requires        |
//! |------------|-----------------------------------------------|-----------------|
//! | `mpi`      | Real MPI transport through the C shim          | MPICH/Open MPI  |
//! | `pnetcdf`  | parallel-netCDF file backend (implies `mpi`)   | libpnetcdf      |
//! | `affinity` | Writer-thread CPU pinning                      | —               |
//!
//! Without features, the in-process [`transport::LocalComm`] and the
//! in-memory [`backend::memory::MemStore`] run the full pipeline, which
//! is how the test suite exercises multi-rank behavior.
//!
//! ## Thread Safety
//!
//! Each open file owns one background writer thread that issues
//! collective calls on a dedicated communicator. Real-MPI programs must
//! therefore initialize MPI with `MPI_THREAD_MULTIPLE`
//! ([`transport::mpi::Mpi::init`] requests it). API calls on a given
//! file are expected from one application thread at a time, in the same
//! order on every rank, as with any collective interface.
//!
//! ## Errors
//!
//! Fallible calls return [`Error`]; [`ErrorCode`] and [`error_string`]
//! give the stable integer view. Backend failures latch a
//! `(library, errno)` pair in the context — when a call returns
//! `LibraryError`, [`Context::lib_error_string`] has the backend's own
//! message. Failures inside the writer thread surface on the next
//! `sync`, `close`, or `get_var` on that file.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]

pub mod backend;
mod config;
mod context;
mod decomp;
mod error;
#[cfg(feature = "mpi")]
mod ffi;
mod file;
mod queue;
mod rw;
mod transfer;
pub mod transport;
mod vartype;
mod writer;

pub use config::{Backend, Config};
pub use context::Context;
pub use decomp::Decomp;
pub use error::{error_string, Error, ErrorCode, Result};
pub use file::{AttValue, DimInfo, File, FileMode, VarInfo};
pub use transfer::{transfer_field, Direction};
pub use vartype::{VarElement, VarType};

/// Maximum length in bytes of a dimension or variable name.
///
/// Names are broadcast between ranks as fixed blocks of this size.
pub const MAX_NAME_LEN: usize = 64;
