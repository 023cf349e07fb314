//! Files: open/close, the define/data state machine, metadata.
//!
//! Every backend interaction follows one collective pattern: the I/O
//! rank of each group calls the backend primitive, and the resulting
//! status is broadcast from the group leader so that every rank in the
//! group makes the same success-or-failure decision. On failure the
//! `(backend, errno)` pair is latched into the context and
//! `LIBRARY_ERROR` is returned everywhere.

use crate::backend::{BackendFile, BackendKind};
use crate::config::Backend;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::queue::{AsyncQueue, TicketLock};
use crate::transport::{Comm, CommRef};
use crate::vartype::VarType;
use crate::writer::{WriterFault, WriterShared};
use crate::MAX_NAME_LEN;
use std::ops::BitOr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// File open modes, combinable as a bitset.
///
/// At least one of [`CREATE`](FileMode::CREATE), [`WRITE`](FileMode::WRITE)
/// or [`READ`](FileMode::READ) must be set when opening a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMode(u32);

impl FileMode {
    /// Create a new file, clobbering any existing file at the path.
    pub const CREATE: FileMode = FileMode(0x1);
    /// Open an existing file for writing.
    pub const WRITE: FileMode = FileMode(0x2);
    /// Open an existing file read-only.
    pub const READ: FileMode = FileMode(0x4);

    /// Whether every bit of `other` is set in `self`.
    pub fn contains(self, other: FileMode) -> bool {
        self.0 & other.0 == other.0
    }

    fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for FileMode {
    type Output = FileMode;

    fn bitor(self, rhs: FileMode) -> FileMode {
        FileMode(self.0 | rhs.0)
    }
}

/// Define/data state of an open file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum FileState {
    Define = 0,
    Data = 1,
}

/// A typed attribute value for `define_att` / `inquire_att`.
#[derive(Debug, Clone, PartialEq)]
pub enum AttValue {
    /// 32-bit float attribute
    Real32(f32),
    /// 64-bit float attribute
    Real64(f64),
    /// 32-bit integer attribute
    Int32(i32),
    /// Character-string attribute; its stored length is the string
    /// length, with no terminator
    Text(String),
}

impl AttValue {
    fn vartype(&self) -> VarType {
        match self {
            AttValue::Real32(_) => VarType::Real32,
            AttValue::Real64(_) => VarType::Real64,
            AttValue::Int32(_) => VarType::Int32,
            AttValue::Text(_) => VarType::Char,
        }
    }

    fn len(&self) -> i64 {
        match self {
            AttValue::Text(s) => s.len() as i64,
            _ => 1,
        }
    }

    fn bytes(&self) -> Vec<u8> {
        match self {
            AttValue::Real32(v) => v.to_ne_bytes().to_vec(),
            AttValue::Real64(v) => v.to_ne_bytes().to_vec(),
            AttValue::Int32(v) => v.to_ne_bytes().to_vec(),
            AttValue::Text(s) => s.as_bytes().to_vec(),
        }
    }
}

/// Size and record status of a dimension, from [`File::inquire_dim`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DimInfo {
    /// Dimension length; for the unlimited dimension, the current
    /// record count.
    pub size: i64,
    /// Whether this is the unlimited (record) dimension.
    pub is_unlimited: bool,
}

/// Type and shape of a variable, from [`File::inquire_var`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarInfo {
    /// Element type of the variable.
    pub vartype: VarType,
    /// Dimension names, slowest-varying first.
    pub dims: Vec<String>,
}

/// An open file.
///
/// Files are opened collectively through [`Context::open_file`] and hold
/// their own duplicates of the context's communicators. Writes are
/// asynchronous: `put_var` hands descriptors to a per-file background
/// writer, and [`sync`](File::sync), [`close`](File::close) and
/// `get_var` establish the happens-before edge with it.
pub struct File {
    pub(crate) ctx: Arc<Context>,
    mode: FileMode,
    pub(crate) io_task: bool,
    /// Communicator handed to the backend; kept for the file's lifetime.
    #[allow(dead_code)]
    io_file_comm: CommRef,
    pub(crate) io_group_comm: CommRef,
    pub(crate) backend: Option<Arc<dyn BackendFile>>,
    state: AtomicU8,
    frame: AtomicI64,
    pub(crate) shared: Arc<WriterShared>,
    pub(crate) writer: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Context {
    /// Open a file within this context. Collective over the context's
    /// communicator.
    ///
    /// On [`FileMode::CREATE`] the file starts in define mode; on
    /// [`FileMode::WRITE`] or [`FileMode::READ`] it starts in data mode.
    /// The current frame starts at zero.
    pub fn open_file(self: &Arc<Self>, path: &str, mode: FileMode) -> Result<File> {
        if mode.is_empty()
            || !(mode.contains(FileMode::CREATE)
                || mode.contains(FileMode::WRITE)
                || mode.contains(FileMode::READ))
        {
            return Err(Error::InvalidArgument(
                "file mode must include CREATE, WRITE, or READ",
            ));
        }

        let io_file_comm = self.io_comm().duplicate()?;
        let writer_comm = self.io_comm().duplicate()?;
        let io_group_comm = self.group_comm().duplicate()?;
        let io_task = self.is_io_task();
        let writable = mode.contains(FileMode::CREATE) || mode.contains(FileMode::WRITE);

        let (ierr, backend, state) = if io_task {
            match open_backend(self, &io_file_comm, path, mode) {
                Ok((b, state)) => {
                    let ierr = if writable {
                        b.attach_buffer(self.config().buf_size).err().unwrap_or(0)
                    } else {
                        0
                    };
                    (ierr, Some(b), state)
                }
                Err(e) => (e, None, FileState::Define),
            }
        } else {
            let state = if mode.contains(FileMode::CREATE) {
                FileState::Define
            } else {
                FileState::Data
            };
            (0, None, state)
        };

        let code = io_group_comm.bcast_i32(ierr, 0)?;
        if code != 0 {
            let kind = backend_kind(self);
            self.latch_lib_error(kind, code);
            return Err(Error::Library { kind, errno: code });
        }

        log::debug!(
            "open_file: rank {} opened {path:?} (io_task={io_task})",
            self.rank()
        );

        let shared = Arc::new(WriterShared {
            queue: AsyncQueue::new(),
            ticket: TicketLock::new(),
            active: AtomicBool::new(false),
            writer_comm,
            backend: backend.clone(),
            n_reqs_cap: self.config().n_reqs,
            buf_size: self.config().buf_size,
            fault: Mutex::new(None),
            writer_cores: self.config().writer_cores.clone(),
        });

        Ok(File {
            ctx: self.clone(),
            mode,
            io_task,
            io_file_comm,
            io_group_comm,
            backend,
            state: AtomicU8::new(state as u8),
            frame: AtomicI64::new(0),
            shared,
            writer: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }
}

/// Which backend kind this context's files report in latched errors.
fn backend_kind(ctx: &Context) -> BackendKind {
    match ctx.config().backend {
        Backend::Memory(_) => BackendKind::Memory,
        #[cfg(feature = "pnetcdf")]
        Backend::Pnetcdf => BackendKind::Pnetcdf,
    }
}

/// Backend create/open on an I/O rank; returns the handle and the
/// file's initial state.
#[cfg_attr(not(feature = "pnetcdf"), allow(unused_variables))]
fn open_backend(
    ctx: &Context,
    io_file_comm: &CommRef,
    path: &str,
    mode: FileMode,
) -> std::result::Result<(Arc<dyn BackendFile>, FileState), i32> {
    match &ctx.config().backend {
        Backend::Memory(store) => {
            if mode.contains(FileMode::CREATE) {
                Ok((
                    Arc::new(store.create(path)) as Arc<dyn BackendFile>,
                    FileState::Define,
                ))
            } else {
                let write = mode.contains(FileMode::WRITE);
                Ok((
                    Arc::new(store.open(path, write)?) as Arc<dyn BackendFile>,
                    FileState::Data,
                ))
            }
        }
        #[cfg(feature = "pnetcdf")]
        Backend::Pnetcdf => {
            use crate::backend::pnetcdf::PnetcdfFile;
            if mode.contains(FileMode::CREATE) {
                Ok((
                    Arc::new(PnetcdfFile::create(io_file_comm, path)?) as Arc<dyn BackendFile>,
                    FileState::Define,
                ))
            } else {
                let write = mode.contains(FileMode::WRITE);
                Ok((
                    Arc::new(PnetcdfFile::open(io_file_comm, path, write)?)
                        as Arc<dyn BackendFile>,
                    FileState::Data,
                ))
            }
        }
    }
}

impl File {
    pub(crate) fn state(&self) -> FileState {
        if self.state.load(Ordering::Acquire) == FileState::Define as u8 {
            FileState::Define
        } else {
            FileState::Data
        }
    }

    fn set_state(&self, state: FileState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Set the record-dimension index for subsequent writes and reads.
    /// Not collective.
    pub fn set_frame(&self, frame: i64) {
        self.frame.store(frame, Ordering::Relaxed);
    }

    /// The current record-dimension index.
    pub fn get_frame(&self) -> i64 {
        self.frame.load(Ordering::Relaxed)
    }

    /// Broadcast an I/O rank's backend status across the I/O group and
    /// turn a failure into a latched `LIBRARY_ERROR`.
    pub(crate) fn group_status(&self, ierr: i32) -> Result<()> {
        let code = self.io_group_comm.bcast_i32(ierr, 0)?;
        if code != 0 {
            let kind = backend_kind(&self.ctx);
            self.ctx.latch_lib_error(kind, code);
            return Err(Error::Library { kind, errno: code });
        }
        Ok(())
    }

    /// Run a backend call on the I/O rank and share its status with the
    /// group.
    pub(crate) fn group_io(
        &self,
        f: impl FnOnce(&dyn BackendFile) -> std::result::Result<(), i32>,
    ) -> Result<()> {
        let ierr = match &self.backend {
            Some(b) if self.io_task => f(b.as_ref()).err().unwrap_or(0),
            _ => 0,
        };
        self.group_status(ierr)
    }

    /// Switch to define mode if the file is in data mode. Queued writes
    /// must not land while the file is redefined, so the writer is
    /// drained first; any fault it latched stays latched for the next
    /// `sync`, `close`, or `get_var`.
    pub(crate) fn ensure_define(&self) -> Result<()> {
        if self.state() == FileState::Data {
            self.join_writer();
            self.group_io(|b| b.redef())?;
            self.set_state(FileState::Define);
        }
        Ok(())
    }

    /// Switch to data mode if the file is in define mode.
    pub(crate) fn ensure_data(&self) -> Result<()> {
        if self.state() == FileState::Define {
            self.group_io(|b| b.enddef())?;
            self.set_state(FileState::Data);
        }
        Ok(())
    }

    /// Resolve a variable name to the backend's id on the I/O rank.
    /// Non-I/O ranks share the status and receive a placeholder id.
    pub(crate) fn resolve_varid(&self, varname: &str) -> Result<i32> {
        let (ierr, varid) = match &self.backend {
            Some(b) if self.io_task => match b.inq_varid(varname) {
                Ok(id) => (0, id),
                Err(e) => (e, 0),
            },
            _ => (0, 0),
        };
        self.group_status(ierr)?;
        Ok(varid)
    }

    /// Join the writer thread, if one was ever launched.
    pub(crate) fn join_writer(&self) {
        let handle = self.writer.lock().expect("writer slot poisoned").take();
        if let Some(h) = handle {
            let _ = h.join();
        }
    }

    /// Surface a fault the writer latched since the last call.
    pub(crate) fn take_writer_fault(&self) -> Result<()> {
        let fault = self.shared.fault.lock().expect("fault mutex poisoned").take();
        match fault {
            None => Ok(()),
            Some(WriterFault::Backend(errno)) => {
                let kind = backend_kind(&self.ctx);
                self.ctx.latch_lib_error(kind, errno);
                Err(Error::Library { kind, errno })
            }
            Some(WriterFault::Transport(e)) => Err(Error::Mpi(e)),
        }
    }

    /// Define a dimension. A negative `size` defines the unlimited
    /// (record) dimension; zero-length dimensions are rejected.
    /// Collective.
    pub fn define_dim(&self, dimname: &str, size: i64) -> Result<()> {
        if dimname.is_empty() {
            return Err(Error::InvalidArgument("dimension name must not be empty"));
        }
        if size == 0 {
            return Err(Error::InvalidArgument(
                "zero-length dimensions are not representable",
            ));
        }
        self.ensure_define()?;
        self.group_io(|b| b.def_dim(dimname, size))
    }

    /// Inquire about a dimension's size and record status. Collective.
    pub fn inquire_dim(&self, dimname: &str) -> Result<DimInfo> {
        if dimname.is_empty() {
            return Err(Error::InvalidArgument("dimension name must not be empty"));
        }
        let (ierr, mut size, mut unlimited) = match &self.backend {
            Some(b) if self.io_task => match b.inq_dim(dimname) {
                Ok((len, unl)) => (0, len, i32::from(unl)),
                Err(e) => (e, -1, 0),
            },
            _ => (0, 0, 0),
        };
        self.group_status(ierr)?;

        let mut size_bytes = size.to_ne_bytes();
        self.io_group_comm.bcast_bytes(&mut size_bytes, 0)?;
        size = i64::from_ne_bytes(size_bytes);
        unlimited = self.io_group_comm.bcast_i32(unlimited, 0)?;

        Ok(DimInfo {
            size,
            is_unlimited: unlimited != 0,
        })
    }

    /// Define a variable over previously defined dimensions. Collective.
    pub fn define_var(&self, varname: &str, vartype: VarType, dimnames: &[&str]) -> Result<()> {
        if varname.is_empty() {
            return Err(Error::InvalidArgument("variable name must not be empty"));
        }
        if vartype == VarType::Unknown {
            return Err(Error::InvalidArgument("unknown variable type"));
        }
        self.ensure_define()?;
        self.group_io(|b| b.def_var(varname, vartype, dimnames))
    }

    /// Inquire about a variable's type and dimension names. Collective.
    pub fn inquire_var(&self, varname: &str) -> Result<VarInfo> {
        if varname.is_empty() {
            return Err(Error::InvalidArgument("variable name must not be empty"));
        }
        let varid = self.resolve_varid(varname)?;

        let (ierr, tag, ndims) = match &self.backend {
            Some(b) if self.io_task => match b.inq_var(varid) {
                Ok((vt, nd)) => (0, vt as i32, nd),
                Err(e) => (e, VarType::Unknown as i32, 0),
            },
            _ => (0, VarType::Unknown as i32, 0),
        };
        self.group_status(ierr)?;
        let tag = self.io_group_comm.bcast_i32(tag, 0)?;
        let ndims = self.io_group_comm.bcast_i32(ndims, 0)?;

        let mut dims = Vec::with_capacity(ndims as usize);
        for idim in 0..ndims {
            let (ierr, name) = match &self.backend {
                Some(b) if self.io_task => match b.inq_vardimname(varid, idim) {
                    Ok(n) => (0, n),
                    Err(e) => (e, String::new()),
                },
                _ => (0, String::new()),
            };
            self.group_status(ierr)?;

            // names travel as a fixed-size block; MAX_NAME_LEN bounds
            // every dimension name in the file
            let mut block = [0u8; MAX_NAME_LEN];
            let n = name.len().min(MAX_NAME_LEN);
            block[..n].copy_from_slice(&name.as_bytes()[..n]);
            self.io_group_comm.bcast_bytes(&mut block, 0)?;
            let end = block.iter().position(|&b| b == 0).unwrap_or(MAX_NAME_LEN);
            dims.push(String::from_utf8_lossy(&block[..end]).into_owned());
        }

        Ok(VarInfo {
            vartype: VarType::from_tag(tag),
            dims,
        })
    }

    /// Define an attribute on a variable, or a global attribute when
    /// `varname` is `None`. Collective.
    pub fn define_att(
        &self,
        varname: Option<&str>,
        att_name: &str,
        value: &AttValue,
    ) -> Result<()> {
        if att_name.is_empty() {
            return Err(Error::InvalidArgument("attribute name must not be empty"));
        }
        let varid = match varname {
            Some(name) => self.resolve_varid(name)?,
            None => -1,
        };
        self.ensure_define()?;
        self.group_io(|b| b.put_att(varid, att_name, value.vartype(), value.len(), &value.bytes()))
    }

    /// Inquire about an attribute of a variable, or a global attribute
    /// when `varname` is `None`. Collective.
    pub fn inquire_att(&self, varname: Option<&str>, att_name: &str) -> Result<AttValue> {
        if att_name.is_empty() {
            return Err(Error::InvalidArgument("attribute name must not be empty"));
        }
        let varid = match varname {
            Some(name) => self.resolve_varid(name)?,
            None => -1,
        };

        let (ierr, tag, len) = match &self.backend {
            Some(b) if self.io_task => match b.inq_att(varid, att_name) {
                Ok((vt, len)) => (0, vt as i32, len),
                Err(e) => (e, VarType::Unknown as i32, -1),
            },
            _ => (0, VarType::Unknown as i32, -1),
        };
        self.group_status(ierr)?;
        let tag = self.io_group_comm.bcast_i32(tag, 0)?;
        let mut len_bytes = len.to_ne_bytes();
        self.io_group_comm.bcast_bytes(&mut len_bytes, 0)?;
        let len = i64::from_ne_bytes(len_bytes);

        let vartype = VarType::from_tag(tag);
        let nbytes = match vartype {
            VarType::Char => len.max(0) as usize,
            other => other.size(),
        };
        let mut value = vec![0u8; nbytes];
        let ierr = match &self.backend {
            Some(b) if self.io_task => b.get_att(varid, att_name, &mut value).err().unwrap_or(0),
            _ => 0,
        };
        self.group_status(ierr)?;
        self.io_group_comm.bcast_bytes(&mut value, 0)?;

        Ok(match vartype {
            VarType::Real32 => AttValue::Real32(f32::from_ne_bytes(value[..4].try_into().unwrap())),
            VarType::Real64 => AttValue::Real64(f64::from_ne_bytes(value[..8].try_into().unwrap())),
            VarType::Int32 => AttValue::Int32(i32::from_ne_bytes(value[..4].try_into().unwrap())),
            _ => AttValue::Text(String::from_utf8_lossy(&value).into_owned()),
        })
    }

    /// Flush all in-memory data for this file. Drains the async writer,
    /// surfaces any fault it latched, leaves define mode if needed, and
    /// syncs the backend. Collective.
    pub fn sync(&self) -> Result<()> {
        self.join_writer();
        self.take_writer_fault()?;
        self.ensure_data()?;
        self.group_io(|b| b.sync())
    }

    /// Close the file. Drains the writer, detaches the backend buffer
    /// on writable files, and closes the backend file. Collective.
    pub fn close(self) -> Result<()> {
        self.close_inner()
    }

    fn close_inner(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.join_writer();
        let fault = self.take_writer_fault();

        let writable =
            self.mode.contains(FileMode::CREATE) || self.mode.contains(FileMode::WRITE);
        let ierr = match &self.backend {
            Some(b) if self.io_task => {
                if writable {
                    if let Err(e) = b.detach_buffer() {
                        log::warn!("close: detach_buffer failed ({e})");
                    }
                }
                b.close().err().unwrap_or(0)
            }
            _ => 0,
        };
        self.group_status(ierr)?;
        fault
    }
}

impl Drop for File {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            // best-effort close; errors have nowhere to go from a drop
            if let Err(e) = self.close_inner() {
                log::warn!("close on drop failed: {e}");
            }
        }
    }
}
