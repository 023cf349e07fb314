//! Error types for smiol.
//!
//! Every fallible operation returns [`Result`]. The [`Error`] enum carries
//! the failure detail; [`ErrorCode`] is the stable integer mirror used by
//! foreign-language callers, with the same values and messages as the
//! C-era library.

use crate::backend::BackendKind;
use crate::transport::CommError;
use crate::vartype::VarType;
use thiserror::Error;

/// Result type for smiol operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Stable integer error codes.
///
/// These discriminants are part of the library's foreign interface and
/// must not be renumbered. [`error_string`] maps a code to its message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    /// No error
    Success = 0,
    /// A memory allocation returned no memory
    MallocFailure = 1,
    /// An argument failed validation
    InvalidArgument = 2,
    /// An internal MPI call failed
    MpiError = 3,
    /// The Fortran wrapper detected inconsistent return values
    FortranError = 4,
    /// A file-library call returned a bad status; consult
    /// [`Context::lib_error_string`](crate::Context::lib_error_string)
    LibraryError = 5,
    /// An argument has the wrong element type
    WrongArgType = 6,
    /// An argument is too small
    InsufficientArg = 7,
    /// A failure in the asynchronous writer machinery
    AsyncError = 8,
}

/// Returns the error string for a stable integer error code.
///
/// If the code is `LibraryError` and a valid context is available,
/// [`Context::lib_error_string`](crate::Context::lib_error_string) should
/// be consulted instead. The string contains no newline.
pub fn error_string(code: i32) -> &'static str {
    match code {
        c if c == ErrorCode::Success as i32 => "Success!",
        c if c == ErrorCode::MallocFailure as i32 => "malloc returned a null pointer",
        c if c == ErrorCode::InvalidArgument as i32 => "invalid subroutine argument",
        c if c == ErrorCode::MpiError as i32 => "internal MPI call failed",
        c if c == ErrorCode::FortranError as i32 => {
            "Fortran wrapper detected an inconsistency in C return values"
        }
        c if c == ErrorCode::LibraryError as i32 => "bad return code from a library call",
        c if c == ErrorCode::WrongArgType as i32 => "argument is of the wrong type",
        c if c == ErrorCode::InsufficientArg as i32 => "argument is of insufficient size",
        c if c == ErrorCode::AsyncError as i32 => "failure in smiol asynchronous function",
        _ => "Unknown error",
    }
}

/// Error type for smiol operations.
#[derive(Error, Debug)]
pub enum Error {
    /// An argument failed local validation; no MPI or backend traffic was
    /// performed.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// A transport (MPI) call failed. The context is left in whatever
    /// state the transport left it; no recovery is attempted.
    #[error("internal MPI call failed: {0}")]
    Mpi(#[from] CommError),

    /// The foreign-communicator conversion produced an unusable handle.
    #[error("Fortran wrapper detected an inconsistency in C return values")]
    Fortran,

    /// A backend file-library call failed. The `(kind, errno)` pair is
    /// also latched into the owning context.
    #[error("bad return code from a library call ({kind}, errno {errno})")]
    Library {
        /// Which backend library produced the error.
        kind: BackendKind,
        /// The backend's error code, preserved verbatim.
        errno: i32,
    },

    /// A buffer's element type does not match the variable's type.
    #[error("argument is of the wrong type: variable is {expected}, buffer holds {actual}")]
    WrongArgType {
        /// The variable's type in the file.
        expected: VarType,
        /// The element type of the caller's buffer.
        actual: VarType,
    },

    /// A buffer is too small for the requested operation.
    #[error("argument is of insufficient size: need {needed} elements, have {have}")]
    InsufficientArg {
        /// Number of elements the operation requires.
        needed: usize,
        /// Number of elements the caller provided.
        have: usize,
    },

    /// A failure in the asynchronous writer machinery (thread creation,
    /// lock poisoning, or a fault the writer could not report in line).
    #[error("failure in asynchronous writer: {0}")]
    Async(String),
}

impl Error {
    /// The stable integer code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::InvalidArgument(_) => ErrorCode::InvalidArgument,
            Error::Mpi(_) => ErrorCode::MpiError,
            Error::Fortran => ErrorCode::FortranError,
            Error::Library { .. } => ErrorCode::LibraryError,
            Error::WrongArgType { .. } => ErrorCode::WrongArgType,
            Error::InsufficientArg { .. } => ErrorCode::InsufficientArg,
            Error::Async(_) => ErrorCode::AsyncError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_values_are_stable() {
        assert_eq!(ErrorCode::Success as i32, 0);
        assert_eq!(ErrorCode::MallocFailure as i32, 1);
        assert_eq!(ErrorCode::InvalidArgument as i32, 2);
        assert_eq!(ErrorCode::MpiError as i32, 3);
        assert_eq!(ErrorCode::FortranError as i32, 4);
        assert_eq!(ErrorCode::LibraryError as i32, 5);
        assert_eq!(ErrorCode::WrongArgType as i32, 6);
        assert_eq!(ErrorCode::InsufficientArg as i32, 7);
        assert_eq!(ErrorCode::AsyncError as i32, 8);
    }

    #[test]
    fn error_string_matches_codes() {
        assert_eq!(error_string(0), "Success!");
        assert_eq!(error_string(2), "invalid subroutine argument");
        assert_eq!(error_string(5), "bad return code from a library call");
        assert_eq!(error_string(999), "Unknown error");
        assert_eq!(error_string(-1), "Unknown error");
    }

    #[test]
    fn error_maps_to_code() {
        assert_eq!(
            Error::InvalidArgument("x").code(),
            ErrorCode::InvalidArgument
        );
        assert_eq!(
            Error::Library {
                kind: BackendKind::Memory,
                errno: -49
            }
            .code(),
            ErrorCode::LibraryError
        );
        assert_eq!(Error::Fortran.code(), ErrorCode::FortranError);
        assert_eq!(Error::Async("t".into()).code(), ErrorCode::AsyncError);
    }

    #[test]
    fn display_formats() {
        let err = Error::WrongArgType {
            expected: VarType::Real64,
            actual: VarType::Int32,
        };
        assert_eq!(
            format!("{err}"),
            "argument is of the wrong type: variable is REAL64, buffer holds INT32"
        );

        let err = Error::InsufficientArg { needed: 8, have: 4 };
        assert_eq!(
            format!("{err}"),
            "argument is of insufficient size: need 8 elements, have 4"
        );
    }
}
