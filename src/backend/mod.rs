//! The file-library seam.
//!
//! The I/O pipeline sees a backing file format only through the
//! [`BackendFile`] trait, which names the primitives the pipeline needs:
//! define-mode/data-mode switching, non-blocking buffered puts with an
//! explicit collective `wait_all`, a fixed attached buffer with a usage
//! query, and the metadata calls. Backend error codes are opaque `i32`s
//! preserved verbatim; [`lib_error_string`] turns a latched
//! `(kind, errno)` pair back into the backend's own message.

pub mod memory;
#[cfg(feature = "pnetcdf")]
pub mod pnetcdf;

use crate::vartype::VarType;

/// Which file library produced a latched error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum BackendKind {
    /// No backend error has been latched.
    Unknown = 0,
    /// The in-memory backend.
    Memory = 1,
    /// parallel-netCDF.
    Pnetcdf = 2,
}

impl BackendKind {
    /// Map a raw tag back to the enum variant.
    pub fn from_tag(tag: i32) -> Self {
        match tag {
            1 => BackendKind::Memory,
            2 => BackendKind::Pnetcdf,
            _ => BackendKind::Unknown,
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Unknown => write!(f, "unknown library"),
            BackendKind::Memory => write!(f, "memory backend"),
            BackendKind::Pnetcdf => write!(f, "parallel-netCDF"),
        }
    }
}

/// Result type for backend primitives: the error is the backend's own
/// status code, untranslated.
pub type BackendResult<T> = std::result::Result<T, i32>;

/// An open file in some backing file library.
///
/// Implementations are shared between the API thread (metadata and
/// reads) and the per-file writer thread (buffered puts and wait-all),
/// which mirrors how the backing libraries are actually driven.
pub trait BackendFile: Send + Sync {
    /// Which library this file belongs to.
    fn kind(&self) -> BackendKind;

    /// Switch from data mode back to define mode.
    fn redef(&self) -> BackendResult<()>;

    /// Leave define mode; after this, data operations are permitted.
    fn enddef(&self) -> BackendResult<()>;

    /// Flush everything the backend holds in memory for this file.
    fn sync(&self) -> BackendResult<()>;

    /// Close the file.
    fn close(&self) -> BackendResult<()>;

    /// Attach a buffer of `nbytes` for non-blocking buffered writes.
    fn attach_buffer(&self, nbytes: i64) -> BackendResult<()>;

    /// Detach the buffer attached by [`attach_buffer`](Self::attach_buffer).
    fn detach_buffer(&self) -> BackendResult<()>;

    /// Bytes of the attached buffer currently consumed by pending puts.
    fn buffer_usage(&self) -> BackendResult<i64>;

    /// Define a dimension; a negative length defines the unlimited
    /// (record) dimension.
    fn def_dim(&self, name: &str, len: i64) -> BackendResult<()>;

    /// Look up a dimension: returns `(length, is_unlimited)`. For the
    /// unlimited dimension the current record count is returned.
    fn inq_dim(&self, name: &str) -> BackendResult<(i64, bool)>;

    /// Define a variable over previously defined dimensions.
    fn def_var(&self, name: &str, vartype: VarType, dimnames: &[&str]) -> BackendResult<()>;

    /// Look up a variable id by name.
    fn inq_varid(&self, name: &str) -> BackendResult<i32>;

    /// Type and dimensionality of a variable: `(vartype, ndims)`.
    fn inq_var(&self, varid: i32) -> BackendResult<(VarType, i32)>;

    /// Name of the `idim`-th dimension of a variable.
    fn inq_vardimname(&self, varid: i32, idim: i32) -> BackendResult<String>;

    /// Write an attribute. `varid < 0` addresses the global attribute
    /// set; `len` is the element count (string length for `Char`).
    fn put_att(
        &self,
        varid: i32,
        name: &str,
        vartype: VarType,
        len: i64,
        value: &[u8],
    ) -> BackendResult<()>;

    /// Type and length of an attribute.
    fn inq_att(&self, varid: i32, name: &str) -> BackendResult<(VarType, i64)>;

    /// Read an attribute value into `value` (sized by the caller from
    /// [`inq_att`](Self::inq_att)).
    fn get_att(&self, varid: i32, name: &str, value: &mut [u8]) -> BackendResult<()>;

    /// Post a non-blocking buffered write of one hyperslab. The buffer
    /// is copied into the attached buffer before return; the returned
    /// request id is retired by [`wait_all`](Self::wait_all).
    fn bput_vara(&self, varid: i32, start: &[i64], count: &[i64], buf: &[u8]) -> BackendResult<i32>;

    /// Complete all outstanding non-blocking requests. Collective across
    /// the I/O ranks sharing the file. Clears `reqs` on success.
    fn wait_all(&self, reqs: &mut Vec<i32>) -> BackendResult<()>;

    /// Collective read of one hyperslab into `buf`.
    fn get_vara_all(&self, varid: i32, start: &[i64], count: &[i64], buf: &mut [u8])
        -> BackendResult<()>;
}

/// Returns the backend's own error string for a latched
/// `(kind, errno)` pair.
pub fn lib_error_string(kind: BackendKind, errno: i32) -> String {
    match kind {
        BackendKind::Memory => memory::strerror(errno).to_string(),
        #[cfg(feature = "pnetcdf")]
        BackendKind::Pnetcdf => pnetcdf::strerror(errno),
        #[cfg(not(feature = "pnetcdf"))]
        BackendKind::Pnetcdf => format!("parallel-netCDF error {errno}"),
        BackendKind::Unknown => {
            "Could not find matching library for the source of the error".to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_tags_round_trip() {
        for kind in [BackendKind::Unknown, BackendKind::Memory, BackendKind::Pnetcdf] {
            assert_eq!(BackendKind::from_tag(kind as i32), kind);
        }
        assert_eq!(BackendKind::from_tag(-3), BackendKind::Unknown);
    }

    #[test]
    fn unknown_kind_has_fallback_message() {
        assert_eq!(
            lib_error_string(BackendKind::Unknown, 12345),
            "Could not find matching library for the source of the error"
        );
    }
}
