//! parallel-netCDF backend through the C shim.
//!
//! Each open file holds a `ncid` from `ncmpi_create`/`ncmpi_open` on the
//! I/O ranks' communicator. Calls translate directly to the shim; error
//! codes are parallel-netCDF statuses passed through verbatim.

use super::{BackendFile, BackendKind, BackendResult};
use crate::ffi;
use crate::transport::{Comm, CommRef};
use crate::vartype::VarType;
use crate::MAX_NAME_LEN;
use std::ffi::CString;
use std::os::raw::{c_char, c_void};

fn cstr(s: &str) -> BackendResult<CString> {
    // an interior NUL can never name anything in a netCDF file
    CString::new(s).map_err(|_| crate::backend::memory::NC_ENOTVAR)
}

fn check(code: i32) -> BackendResult<()> {
    if code == 0 {
        Ok(())
    } else {
        Err(code)
    }
}

/// Error string for a parallel-netCDF status code.
pub fn strerror(errno: i32) -> String {
    let mut buf = [0u8; 512];
    let mut len: i32 = 0;
    let ret =
        unsafe { ffi::smiol_nc_strerror(errno, buf.as_mut_ptr().cast::<c_char>(), &mut len) };
    if ret != 0 {
        return format!("parallel-netCDF error {errno}");
    }
    let len = len.clamp(0, 511) as usize;
    String::from_utf8_lossy(&buf[..len]).into_owned()
}

/// An open parallel-netCDF file on this I/O rank.
pub struct PnetcdfFile {
    ncid: i32,
}

// SAFETY: the ncid is an index into parallel-netCDF's own file table;
// the library is driven from one rank's threads at a time, serialized by
// the pipeline's collective protocol.
unsafe impl Send for PnetcdfFile {}
unsafe impl Sync for PnetcdfFile {}

impl PnetcdfFile {
    /// Collectively create a file over the I/O ranks' communicator.
    pub(crate) fn create(comm: &CommRef, path: &str) -> BackendResult<Self> {
        let handle = comm.mpi_handle().ok_or(crate::backend::memory::NC_ENOENT)?;
        let cpath = cstr(path)?;
        let mut ncid: i32 = 0;
        check(unsafe { ffi::smiol_nc_create(handle, cpath.as_ptr(), &mut ncid) })?;
        Ok(PnetcdfFile { ncid })
    }

    /// Collectively open a file over the I/O ranks' communicator.
    pub(crate) fn open(comm: &CommRef, path: &str, write: bool) -> BackendResult<Self> {
        let handle = comm.mpi_handle().ok_or(crate::backend::memory::NC_ENOENT)?;
        let cpath = cstr(path)?;
        let mut ncid: i32 = 0;
        check(unsafe {
            ffi::smiol_nc_open(handle, cpath.as_ptr(), i32::from(write), &mut ncid)
        })?;
        Ok(PnetcdfFile { ncid })
    }
}

impl BackendFile for PnetcdfFile {
    fn kind(&self) -> BackendKind {
        BackendKind::Pnetcdf
    }

    fn redef(&self) -> BackendResult<()> {
        check(unsafe { ffi::smiol_nc_redef(self.ncid) })
    }

    fn enddef(&self) -> BackendResult<()> {
        check(unsafe { ffi::smiol_nc_enddef(self.ncid) })
    }

    fn sync(&self) -> BackendResult<()> {
        check(unsafe { ffi::smiol_nc_sync(self.ncid) })
    }

    fn close(&self) -> BackendResult<()> {
        check(unsafe { ffi::smiol_nc_close(self.ncid) })
    }

    fn attach_buffer(&self, nbytes: i64) -> BackendResult<()> {
        check(unsafe { ffi::smiol_nc_buffer_attach(self.ncid, nbytes) })
    }

    fn detach_buffer(&self) -> BackendResult<()> {
        check(unsafe { ffi::smiol_nc_buffer_detach(self.ncid) })
    }

    fn buffer_usage(&self) -> BackendResult<i64> {
        let mut usage: i64 = 0;
        check(unsafe { ffi::smiol_nc_buffer_usage(self.ncid, &mut usage) })?;
        Ok(usage)
    }

    fn def_dim(&self, name: &str, len: i64) -> BackendResult<()> {
        let cname = cstr(name)?;
        check(unsafe { ffi::smiol_nc_def_dim(self.ncid, cname.as_ptr(), len) })
    }

    fn inq_dim(&self, name: &str) -> BackendResult<(i64, bool)> {
        let cname = cstr(name)?;
        let mut len: i64 = 0;
        let mut unlimited: i32 = 0;
        check(unsafe {
            ffi::smiol_nc_inq_dim(self.ncid, cname.as_ptr(), &mut len, &mut unlimited)
        })?;
        Ok((len, unlimited != 0))
    }

    fn def_var(&self, name: &str, vartype: VarType, dimnames: &[&str]) -> BackendResult<()> {
        let cname = cstr(name)?;
        let cdims: Vec<CString> = dimnames
            .iter()
            .map(|d| cstr(d))
            .collect::<BackendResult<_>>()?;
        let ptrs: Vec<*const c_char> = cdims.iter().map(|c| c.as_ptr()).collect();
        check(unsafe {
            ffi::smiol_nc_def_var(
                self.ncid,
                cname.as_ptr(),
                vartype as i32,
                ptrs.len() as i32,
                ptrs.as_ptr(),
            )
        })
    }

    fn inq_varid(&self, name: &str) -> BackendResult<i32> {
        let cname = cstr(name)?;
        let mut varid: i32 = 0;
        check(unsafe { ffi::smiol_nc_inq_varid(self.ncid, cname.as_ptr(), &mut varid) })?;
        Ok(varid)
    }

    fn inq_var(&self, varid: i32) -> BackendResult<(VarType, i32)> {
        let mut tag: i32 = 0;
        let mut ndims: i32 = 0;
        check(unsafe { ffi::smiol_nc_inq_var(self.ncid, varid, &mut tag, &mut ndims) })?;
        Ok((VarType::from_tag(tag), ndims))
    }

    fn inq_vardimname(&self, varid: i32, idim: i32) -> BackendResult<String> {
        let mut buf = [0u8; MAX_NAME_LEN];
        check(unsafe {
            ffi::smiol_nc_inq_vardimname(
                self.ncid,
                varid,
                idim,
                buf.as_mut_ptr().cast::<c_char>(),
            )
        })?;
        let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        Ok(String::from_utf8_lossy(&buf[..end]).into_owned())
    }

    fn put_att(
        &self,
        varid: i32,
        name: &str,
        vartype: VarType,
        len: i64,
        value: &[u8],
    ) -> BackendResult<()> {
        let cname = cstr(name)?;
        check(unsafe {
            ffi::smiol_nc_put_att(
                self.ncid,
                varid,
                cname.as_ptr(),
                vartype as i32,
                len,
                value.as_ptr().cast::<c_void>(),
            )
        })
    }

    fn inq_att(&self, varid: i32, name: &str) -> BackendResult<(VarType, i64)> {
        let cname = cstr(name)?;
        let mut tag: i32 = 0;
        let mut len: i64 = 0;
        check(unsafe {
            ffi::smiol_nc_inq_att(self.ncid, varid, cname.as_ptr(), &mut tag, &mut len)
        })?;
        Ok((VarType::from_tag(tag), len))
    }

    fn get_att(&self, varid: i32, name: &str, value: &mut [u8]) -> BackendResult<()> {
        let cname = cstr(name)?;
        check(unsafe {
            ffi::smiol_nc_get_att(
                self.ncid,
                varid,
                cname.as_ptr(),
                value.as_mut_ptr().cast::<c_void>(),
            )
        })
    }

    fn bput_vara(&self, varid: i32, start: &[i64], count: &[i64], buf: &[u8]) -> BackendResult<i32> {
        let mut req: i32 = 0;
        check(unsafe {
            ffi::smiol_nc_bput_vara(
                self.ncid,
                varid,
                start.as_ptr(),
                count.as_ptr(),
                start.len() as i32,
                buf.as_ptr().cast::<c_void>(),
                &mut req,
            )
        })?;
        Ok(req)
    }

    fn wait_all(&self, reqs: &mut Vec<i32>) -> BackendResult<()> {
        check(unsafe {
            ffi::smiol_nc_wait_all(self.ncid, reqs.len() as i32, reqs.as_mut_ptr())
        })?;
        reqs.clear();
        Ok(())
    }

    fn get_vara_all(
        &self,
        varid: i32,
        start: &[i64],
        count: &[i64],
        buf: &mut [u8],
    ) -> BackendResult<()> {
        check(unsafe {
            ffi::smiol_nc_get_vara_all(
                self.ncid,
                varid,
                start.as_ptr(),
                count.as_ptr(),
                start.len() as i32,
                buf.as_mut_ptr().cast::<c_void>(),
            )
        })
    }
}
