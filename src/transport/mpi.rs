//! Real-MPI transport through the C shim.
//!
//! Communicators are integer handles into a C-side table; handle 0 is
//! `MPI_COMM_WORLD`. The application may initialize MPI itself (the
//! usual case when smiol is embedded in a larger model) or use the
//! [`Mpi`] guard from a standalone Rust program.
//!
//! The async writer issues collectives from its own thread, so programs
//! that write through smiol should initialize MPI with
//! `MPI_THREAD_MULTIPLE`.

use super::{Comm, CommError, CommRef, CommResult, ReduceOp};
use crate::ffi;
use std::marker::PhantomData;
use std::os::raw::{c_char, c_void};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Global flag tracking whether this process initialized MPI itself.
static MPI_OWNED: AtomicBool = AtomicBool::new(false);

fn check(code: i32) -> CommResult<()> {
    if code == 0 {
        return Ok(());
    }
    let mut buf = [0u8; 512];
    let mut len: i32 = 0;
    let ret =
        unsafe { ffi::smiol_mpi_error_string(code, buf.as_mut_ptr().cast::<c_char>(), &mut len) };
    let message = if ret == 0 {
        let len = len.clamp(0, 511) as usize;
        String::from_utf8_lossy(&buf[..len]).into_owned()
    } else {
        format!("MPI error code {code}")
    };
    Err(CommError { code, message })
}

/// MPI environment guard for standalone Rust programs.
///
/// Initializes MPI with `MPI_THREAD_MULTIPLE` (required by the async
/// writer) and finalizes it on drop. Applications that already called
/// `MPI_Init` elsewhere should not create one; [`MpiComm::world`] works
/// either way.
pub struct Mpi {
    /// Marker to make Mpi !Send and !Sync
    _marker: PhantomData<*const ()>,
}

impl Mpi {
    /// Initialize MPI, requesting full multi-threaded support.
    pub fn init() -> CommResult<Self> {
        if MPI_OWNED.swap(true, Ordering::SeqCst) {
            return Err(CommError {
                code: -1,
                message: "MPI has already been initialized by this guard".into(),
            });
        }
        let mut provided: i32 = 0;
        // 3 == MPI_THREAD_MULTIPLE in the shim's numbering
        let ret = unsafe { ffi::smiol_mpi_init_thread(3, &mut provided) };
        if ret != 0 {
            MPI_OWNED.store(false, Ordering::SeqCst);
            check(ret)?;
        }
        if provided < 3 {
            log::warn!(
                "MPI provided thread level {provided}; asynchronous writes \
                 require MPI_THREAD_MULTIPLE"
            );
        }
        Ok(Mpi {
            _marker: PhantomData,
        })
    }

    /// Check whether MPI has been initialized (by anyone).
    pub fn is_initialized() -> bool {
        let mut flag: i32 = 0;
        unsafe { ffi::smiol_mpi_initialized(&mut flag) };
        flag != 0
    }
}

impl Drop for Mpi {
    fn drop(&mut self) {
        if MPI_OWNED.swap(false, Ordering::SeqCst) {
            unsafe {
                ffi::smiol_mpi_finalize();
            }
        }
    }
}

/// An MPI communicator handle.
pub struct MpiComm {
    handle: i32,
    /// World and foreign handles are borrowed, not owned, and must not
    /// be freed on drop.
    owned: bool,
}

// SAFETY: communicator handles are indices into a C-side table; the MPI
// library manages its own thread safety at the requested thread level.
unsafe impl Send for MpiComm {}
unsafe impl Sync for MpiComm {}

impl MpiComm {
    /// A handle to `MPI_COMM_WORLD`.
    pub fn world() -> CommRef {
        Arc::new(MpiComm {
            handle: unsafe { ffi::smiol_comm_world() },
            owned: false,
        })
    }

    /// Convert a Fortran integer communicator handle (`MPI_Fint`) into a
    /// transport handle. This is the entry point for foreign-language
    /// callers whose MPI communicator lives on the other side of an FFI
    /// boundary.
    pub fn from_fortran(fcomm: i32) -> CommResult<CommRef> {
        let mut handle: i32 = 0;
        check(unsafe { ffi::smiol_comm_from_fortran(fcomm, &mut handle) })?;
        Ok(Arc::new(MpiComm {
            handle,
            owned: false,
        }))
    }
}

impl Drop for MpiComm {
    fn drop(&mut self) {
        if self.owned {
            unsafe {
                ffi::smiol_comm_free(self.handle);
            }
        }
    }
}

impl Comm for MpiComm {
    fn rank(&self) -> i32 {
        let mut rank: i32 = 0;
        unsafe { ffi::smiol_comm_rank(self.handle, &mut rank) };
        rank
    }

    fn size(&self) -> i32 {
        let mut size: i32 = 0;
        unsafe { ffi::smiol_comm_size(self.handle, &mut size) };
        size
    }

    fn duplicate(&self) -> CommResult<CommRef> {
        let mut newcomm: i32 = 0;
        check(unsafe { ffi::smiol_comm_dup(self.handle, &mut newcomm) })?;
        Ok(Arc::new(MpiComm {
            handle: newcomm,
            owned: true,
        }))
    }

    fn split(&self, color: i32, key: i32) -> CommResult<CommRef> {
        let mut newcomm: i32 = 0;
        check(unsafe { ffi::smiol_comm_split(self.handle, color, key, &mut newcomm) })?;
        Ok(Arc::new(MpiComm {
            handle: newcomm,
            owned: true,
        }))
    }

    fn barrier(&self) -> CommResult<()> {
        check(unsafe { ffi::smiol_barrier(self.handle) })
    }

    fn allreduce_i64(&self, value: i64, op: ReduceOp) -> CommResult<i64> {
        let mut out: i64 = 0;
        check(unsafe { ffi::smiol_allreduce_i64(&value, &mut out, op as i32, self.handle) })?;
        Ok(out)
    }

    fn allreduce_i32(&self, value: i32, op: ReduceOp) -> CommResult<i32> {
        let mut out: i32 = 0;
        check(unsafe { ffi::smiol_allreduce_i32(&value, &mut out, op as i32, self.handle) })?;
        Ok(out)
    }

    fn bcast_i32(&self, value: i32, root: i32) -> CommResult<i32> {
        let mut v = value;
        check(unsafe {
            ffi::smiol_bcast_bytes(
                (&mut v as *mut i32).cast::<c_void>(),
                std::mem::size_of::<i32>() as i64,
                root,
                self.handle,
            )
        })?;
        Ok(v)
    }

    fn bcast_bytes(&self, buf: &mut [u8], root: i32) -> CommResult<()> {
        check(unsafe {
            ffi::smiol_bcast_bytes(
                buf.as_mut_ptr().cast::<c_void>(),
                buf.len() as i64,
                root,
                self.handle,
            )
        })
    }

    fn gather_i32(&self, value: i32, root: i32) -> CommResult<Option<Vec<i32>>> {
        let is_root = self.rank() == root;
        let mut recv = vec![0i32; if is_root { self.size() as usize } else { 0 }];
        check(unsafe {
            ffi::smiol_gather_i32(&value, recv.as_mut_ptr(), root, self.handle)
        })?;
        Ok(if is_root { Some(recv) } else { None })
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
        check(unsafe {
            ffi::smiol_gatherv_elems(
                send.as_ptr().cast::<c_void>(),
                (send.len() / elem_size) as i32,
                elem_size as i64,
                recv.as_mut_ptr().cast::<c_void>(),
                counts.as_ptr(),
                displs.as_ptr(),
                root,
                self.handle,
            )
        })
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
        check(unsafe {
            ffi::smiol_scatterv_elems(
                send.as_ptr().cast::<c_void>(),
                counts.as_ptr(),
                displs.as_ptr(),
                recv.as_mut_ptr().cast::<c_void>(),
                (recv.len() / elem_size) as i32,
                elem_size as i64,
                root,
                self.handle,
            )
        })
    }

    fn alltoall_i32(&self, send: &[i32]) -> CommResult<Vec<i32>> {
        let mut recv = vec![0i32; self.size() as usize];
        check(unsafe {
            ffi::smiol_alltoall_i32(send.as_ptr(), recv.as_mut_ptr(), self.handle)
        })?;
        Ok(recv)
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
        check(unsafe {
            ffi::smiol_alltoallv_elems(
                send.as_ptr().cast::<c_void>(),
                sendcounts.as_ptr(),
                sdispls.as_ptr(),
                recv.as_mut_ptr().cast::<c_void>(),
                recvcounts.as_ptr(),
                rdispls.as_ptr(),
                elem_size as i64,
                self.handle,
            )
        })
    }

    fn mpi_handle(&self) -> Option<i32> {
        Some(self.handle)
    }
}
