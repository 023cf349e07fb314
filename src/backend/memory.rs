//! In-memory file backend.
//!
//! A [`MemStore`] is a shared registry of in-memory files with
//! netCDF-like semantics: named dimensions (one of which may be
//! unlimited), typed variables over those dimensions, attributes, a
//! define/data mode per handle, hyperslab writes and reads, and
//! non-blocking buffered puts retired by `wait_all` against an attached
//! buffer budget.
//!
//! All I/O ranks of a file share one store entry, so writes from
//! different ranks land in one logical file exactly as they would with a
//! parallel file library. Error codes follow the netCDF numbering for
//! the conditions this backend can produce, so latched errors read
//! naturally through `lib_error_string`.
//!
//! The store also counts `bput`/`wait_all` calls ([`MemStats`]), which
//! is how tests observe flush-on-pressure behavior without reaching into
//! the writer.

use super::{BackendFile, BackendKind, BackendResult};
use crate::vartype::VarType;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub(crate) const NC_NOERR: i32 = 0;
pub(crate) const NC_ENOENT: i32 = -10;
pub(crate) const NC_EPERM: i32 = -37;
pub(crate) const NC_ENOTINDEFINE: i32 = -38;
pub(crate) const NC_EINDEFINE: i32 = -39;
pub(crate) const NC_EINVALCOORDS: i32 = -40;
pub(crate) const NC_ENAMEINUSE: i32 = -42;
pub(crate) const NC_ENOTATT: i32 = -43;
pub(crate) const NC_EUNLIMIT: i32 = -44;
pub(crate) const NC_EBADTYPE: i32 = -45;
pub(crate) const NC_EBADDIM: i32 = -46;
pub(crate) const NC_ENOTVAR: i32 = -49;
pub(crate) const NC_EEDGE: i32 = -57;
pub(crate) const NC_EINSUFFBUF: i32 = -227;
pub(crate) const NC_ENULLABUF: i32 = -228;

/// Error string for a memory-backend status code.
pub fn strerror(errno: i32) -> &'static str {
    match errno {
        NC_NOERR => "No error",
        NC_ENOENT => "File does not exist",
        NC_EPERM => "Write to read only",
        NC_ENOTINDEFINE => "Operation not allowed in data mode",
        NC_EINDEFINE => "Operation not allowed in define mode",
        NC_EINVALCOORDS => "Index exceeds dimension bound",
        NC_ENAMEINUSE => "String match to name in use",
        NC_ENOTATT => "Attribute not found",
        NC_EUNLIMIT => "NC_UNLIMITED size already in use",
        NC_EBADTYPE => "Not a valid data type",
        NC_EBADDIM => "Invalid dimension ID or name",
        NC_ENOTVAR => "Variable not found",
        NC_EEDGE => "Start+count exceeds dimension bound",
        NC_EINSUFFBUF => "Insufficient buffer size",
        NC_ENULLABUF => "No attached buffer",
        _ => "Unknown error",
    }
}

#[derive(Debug)]
struct DimDef {
    name: String,
    len: i64,
    unlimited: bool,
}

#[derive(Debug)]
struct VarDef {
    name: String,
    vartype: VarType,
    dim_ids: Vec<usize>,
    data: Vec<u8>,
}

#[derive(Debug)]
struct AttDef {
    vartype: VarType,
    len: i64,
    bytes: Vec<u8>,
}

#[derive(Debug, Default)]
struct FileData {
    dims: Vec<DimDef>,
    vars: Vec<VarDef>,
    /// Attribute key is (variable id, name); the global set uses id -1.
    atts: HashMap<(i32, String), AttDef>,
    /// Current record count of the unlimited dimension.
    numrecs: i64,
}

#[derive(Debug)]
struct SharedFile {
    data: Mutex<FileData>,
    handles: AtomicUsize,
}

#[derive(Debug, Default)]
struct Stats {
    bput_calls: AtomicU64,
    wait_all_calls: AtomicU64,
}

/// Counters exposed for observing backend traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemStats {
    /// Number of non-blocking buffered puts posted.
    pub bput_calls: u64,
    /// Number of `wait_all` flushes issued.
    pub wait_all_calls: u64,
}

#[derive(Debug)]
struct StoreInner {
    files: Mutex<HashMap<String, Arc<SharedFile>>>,
    stats: Stats,
}

/// Shared registry of in-memory files.
///
/// Cloning is cheap and shares the registry; hand clones of one store to
/// every rank that should see the same "filesystem".
#[derive(Debug, Clone)]
pub struct MemStore {
    inner: Arc<StoreInner>,
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStore {
    /// Create an empty store.
    pub fn new() -> Self {
        MemStore {
            inner: Arc::new(StoreInner {
                files: Mutex::new(HashMap::new()),
                stats: Stats::default(),
            }),
        }
    }

    /// Snapshot of the backend traffic counters.
    pub fn stats(&self) -> MemStats {
        MemStats {
            bput_calls: self.inner.stats.bput_calls.load(Ordering::Relaxed),
            wait_all_calls: self.inner.stats.wait_all_calls.load(Ordering::Relaxed),
        }
    }

    /// Create (clobbering) a file. When peer ranks already hold open
    /// handles on the path, the call joins their file instead, which is
    /// how a collective create lands on one shared entry.
    pub(crate) fn create(&self, path: &str) -> MemBackend {
        let mut files = self.inner.files.lock().expect("store mutex poisoned");
        let file = match files.get(path) {
            Some(existing) if existing.handles.load(Ordering::SeqCst) > 0 => existing.clone(),
            _ => {
                let fresh = Arc::new(SharedFile {
                    data: Mutex::new(FileData::default()),
                    handles: AtomicUsize::new(0),
                });
                files.insert(path.to_string(), fresh.clone());
                fresh
            }
        };
        file.handles.fetch_add(1, Ordering::SeqCst);
        MemBackend::new(self.clone(), file, true, true)
    }

    /// Open an existing file.
    pub(crate) fn open(&self, path: &str, write: bool) -> BackendResult<MemBackend> {
        let files = self.inner.files.lock().expect("store mutex poisoned");
        let file = files.get(path).ok_or(NC_ENOENT)?.clone();
        file.handles.fetch_add(1, Ordering::SeqCst);
        Ok(MemBackend::new(self.clone(), file, false, write))
    }
}

#[derive(Debug)]
struct PendingWrite {
    varid: i32,
    start: Vec<i64>,
    count: Vec<i64>,
    buf: Vec<u8>,
}

#[derive(Debug)]
struct HandleState {
    define_mode: bool,
    buffer_cap: Option<i64>,
    pending: Vec<PendingWrite>,
    pending_bytes: i64,
    next_req: i32,
}

/// One rank's handle on an in-memory file.
#[derive(Debug)]
pub struct MemBackend {
    store: MemStore,
    file: Arc<SharedFile>,
    writable: bool,
    state: Mutex<HandleState>,
}

impl MemBackend {
    fn new(store: MemStore, file: Arc<SharedFile>, define_mode: bool, writable: bool) -> Self {
        MemBackend {
            store,
            file,
            writable,
            state: Mutex::new(HandleState {
                define_mode,
                buffer_cap: None,
                pending: Vec::new(),
                pending_bytes: 0,
                next_req: 0,
            }),
        }
    }
}

/// Resolved element-space shape of a variable; the record dimension
/// reports the file's current record count.
fn var_shape(data: &FileData, var: &VarDef) -> Vec<i64> {
    var.dim_ids
        .iter()
        .map(|&d| {
            let dim = &data.dims[d];
            if dim.unlimited {
                data.numrecs
            } else {
                dim.len
            }
        })
        .collect()
}

fn record_size(data: &FileData, var: &VarDef) -> usize {
    let esize = var.vartype.size();
    var.dim_ids
        .iter()
        .filter(|&&d| !data.dims[d].unlimited)
        .fold(esize, |acc, &d| acc * data.dims[d].len as usize)
}

/// Walk the hyperslab `(start, count)` of a variable with shape `shape`,
/// invoking `f(var_byte_offset, caller_byte_offset, run_bytes)` once per
/// contiguous innermost run.
fn for_each_run(
    shape: &[i64],
    start: &[i64],
    count: &[i64],
    esize: usize,
    mut f: impl FnMut(usize, usize, usize),
) {
    let ndims = shape.len();
    if ndims == 0 {
        f(0, 0, esize);
        return;
    }
    if count.iter().any(|&c| c == 0) {
        return;
    }

    let mut strides = vec![1i64; ndims];
    for i in (0..ndims - 1).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }

    let run_bytes = count[ndims - 1] as usize * esize;
    let mut idx = vec![0i64; ndims - 1];
    let mut caller_off = 0usize;
    loop {
        let mut flat = start[ndims - 1];
        for i in 0..ndims - 1 {
            flat += (start[i] + idx[i]) * strides[i];
        }
        f(flat as usize * esize, caller_off, run_bytes);
        caller_off += run_bytes;

        // odometer increment over the outer dimensions
        let mut dim = ndims - 1;
        loop {
            if dim == 0 {
                return;
            }
            dim -= 1;
            idx[dim] += 1;
            if idx[dim] < count[dim] {
                break;
            }
            idx[dim] = 0;
        }
    }
}

/// Bounds-check a hyperslab against a shape; `grow_record` permits the
/// leading record dimension to extend past the current record count.
fn check_bounds(
    data: &FileData,
    var: &VarDef,
    shape: &[i64],
    start: &[i64],
    count: &[i64],
    grow_record: bool,
) -> BackendResult<()> {
    if start.len() != shape.len() || count.len() != shape.len() {
        return Err(NC_EINVALCOORDS);
    }
    for i in 0..shape.len() {
        if start[i] < 0 || count[i] < 0 {
            return Err(NC_EINVALCOORDS);
        }
        let unlimited = var
            .dim_ids
            .get(i)
            .map(|&d| data.dims[d].unlimited)
            .unwrap_or(false);
        if unlimited && grow_record {
            continue;
        }
        if start[i] + count[i] > shape[i] {
            return Err(NC_EEDGE);
        }
    }
    Ok(())
}

fn apply_write(data: &mut FileData, w: &PendingWrite) -> BackendResult<()> {
    let varid = w.varid as usize;
    if varid >= data.vars.len() {
        return Err(NC_ENOTVAR);
    }

    // split borrow: resolve metadata before touching the variable's data
    let shape = var_shape(data, &data.vars[varid]);
    check_bounds(data, &data.vars[varid], &shape, &w.start, &w.count, true)?;
    let esize = data.vars[varid].vartype.size();
    let rec_size = record_size(data, &data.vars[varid]);
    let has_record = data.vars[varid]
        .dim_ids
        .first()
        .map(|&d| data.dims[d].unlimited)
        .unwrap_or(false);

    let mut shape = shape;
    if has_record {
        let needed = w.start[0] + w.count[0];
        if needed > data.numrecs {
            data.numrecs = needed;
        }
        shape[0] = data.numrecs;
        let need_bytes = data.numrecs as usize * rec_size;
        let var = &mut data.vars[varid];
        if var.data.len() < need_bytes {
            var.data.resize(need_bytes, 0);
        }
    }

    // ranks excluded from a write pass zero counts with their full
    // buffer still attached, so extra bytes are not an error
    let expected: i64 = w.count.iter().product::<i64>() * esize as i64;
    if (w.buf.len() as i64) < expected {
        return Err(NC_EINVALCOORDS);
    }

    let var = &mut data.vars[varid];
    let mut status = NC_NOERR;
    for_each_run(&shape, &w.start, &w.count, esize, |voff, coff, n| {
        if voff + n <= var.data.len() {
            var.data[voff..voff + n].copy_from_slice(&w.buf[coff..coff + n]);
        } else {
            status = NC_EEDGE;
        }
    });
    if status != NC_NOERR {
        return Err(status);
    }
    Ok(())
}

impl BackendFile for MemBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    fn redef(&self) -> BackendResult<()> {
        let mut st = self.state.lock().expect("handle mutex poisoned");
        if st.define_mode {
            return Err(NC_EINDEFINE);
        }
        if !self.writable {
            return Err(NC_EPERM);
        }
        st.define_mode = true;
        Ok(())
    }

    fn enddef(&self) -> BackendResult<()> {
        let mut st = self.state.lock().expect("handle mutex poisoned");
        if !st.define_mode {
            return Err(NC_ENOTINDEFINE);
        }
        st.define_mode = false;
        Ok(())
    }

    fn sync(&self) -> BackendResult<()> {
        // contents already live in the shared store
        Ok(())
    }

    fn close(&self) -> BackendResult<()> {
        self.file.handles.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    fn attach_buffer(&self, nbytes: i64) -> BackendResult<()> {
        let mut st = self.state.lock().expect("handle mutex poisoned");
        st.buffer_cap = Some(nbytes);
        Ok(())
    }

    fn detach_buffer(&self) -> BackendResult<()> {
        let mut st = self.state.lock().expect("handle mutex poisoned");
        if st.buffer_cap.take().is_none() {
            return Err(NC_ENULLABUF);
        }
        Ok(())
    }

    fn buffer_usage(&self) -> BackendResult<i64> {
        let st = self.state.lock().expect("handle mutex poisoned");
        if st.buffer_cap.is_none() {
            return Err(NC_ENULLABUF);
        }
        Ok(st.pending_bytes)
    }

    fn def_dim(&self, name: &str, len: i64) -> BackendResult<()> {
        let st = self.state.lock().expect("handle mutex poisoned");
        if !st.define_mode {
            return Err(NC_ENOTINDEFINE);
        }
        drop(st);

        let unlimited = len < 0;
        let mut data = self.file.data.lock().expect("file mutex poisoned");
        if let Some(existing) = data.dims.iter().find(|d| d.name == name) {
            // collective define from a peer handle
            if existing.unlimited == unlimited && (unlimited || existing.len == len) {
                return Ok(());
            }
            return Err(NC_ENAMEINUSE);
        }
        if unlimited && data.dims.iter().any(|d| d.unlimited) {
            return Err(NC_EUNLIMIT);
        }
        data.dims.push(DimDef {
            name: name.to_string(),
            len: if unlimited { 0 } else { len },
            unlimited,
        });
        Ok(())
    }

    fn inq_dim(&self, name: &str) -> BackendResult<(i64, bool)> {
        let data = self.file.data.lock().expect("file mutex poisoned");
        let dim = data.dims.iter().find(|d| d.name == name).ok_or(NC_EBADDIM)?;
        if dim.unlimited {
            Ok((data.numrecs, true))
        } else {
            Ok((dim.len, false))
        }
    }

    fn def_var(&self, name: &str, vartype: VarType, dimnames: &[&str]) -> BackendResult<()> {
        let st = self.state.lock().expect("handle mutex poisoned");
        if !st.define_mode {
            return Err(NC_ENOTINDEFINE);
        }
        drop(st);

        if vartype == VarType::Unknown {
            return Err(NC_EBADTYPE);
        }
        let mut data = self.file.data.lock().expect("file mutex poisoned");
        let mut dim_ids = Vec::with_capacity(dimnames.len());
        for dn in dimnames {
            let id = data
                .dims
                .iter()
                .position(|d| d.name == *dn)
                .ok_or(NC_EBADDIM)?;
            dim_ids.push(id);
        }

        if let Some(existing) = data.vars.iter().find(|v| v.name == name) {
            if existing.vartype == vartype && existing.dim_ids == dim_ids {
                return Ok(());
            }
            return Err(NC_ENAMEINUSE);
        }

        let has_record = dim_ids
            .first()
            .map(|&d| data.dims[d].unlimited)
            .unwrap_or(false);
        let fixed_bytes = dim_ids
            .iter()
            .filter(|&&d| !data.dims[d].unlimited)
            .fold(vartype.size(), |acc, &d| acc * data.dims[d].len as usize);
        let initial = if has_record { 0 } else { fixed_bytes };

        data.vars.push(VarDef {
            name: name.to_string(),
            vartype,
            dim_ids,
            data: vec![0u8; initial],
        });
        Ok(())
    }

    fn inq_varid(&self, name: &str) -> BackendResult<i32> {
        let data = self.file.data.lock().expect("file mutex poisoned");
        data.vars
            .iter()
            .position(|v| v.name == name)
            .map(|i| i as i32)
            .ok_or(NC_ENOTVAR)
    }

    fn inq_var(&self, varid: i32) -> BackendResult<(VarType, i32)> {
        let data = self.file.data.lock().expect("file mutex poisoned");
        let var = data.vars.get(varid as usize).ok_or(NC_ENOTVAR)?;
        Ok((var.vartype, var.dim_ids.len() as i32))
    }

    fn inq_vardimname(&self, varid: i32, idim: i32) -> BackendResult<String> {
        let data = self.file.data.lock().expect("file mutex poisoned");
        let var = data.vars.get(varid as usize).ok_or(NC_ENOTVAR)?;
        let &dim_id = var.dim_ids.get(idim as usize).ok_or(NC_EBADDIM)?;
        Ok(data.dims[dim_id].name.clone())
    }

    fn put_att(
        &self,
        varid: i32,
        name: &str,
        vartype: VarType,
        len: i64,
        value: &[u8],
    ) -> BackendResult<()> {
        let st = self.state.lock().expect("handle mutex poisoned");
        if !st.define_mode {
            return Err(NC_ENOTINDEFINE);
        }
        drop(st);

        if vartype == VarType::Unknown {
            return Err(NC_EBADTYPE);
        }
        let mut data = self.file.data.lock().expect("file mutex poisoned");
        if varid >= 0 && data.vars.get(varid as usize).is_none() {
            return Err(NC_ENOTVAR);
        }
        let key = (varid.max(-1), name.to_string());
        data.atts.insert(
            key,
            AttDef {
                vartype,
                len,
                bytes: value.to_vec(),
            },
        );
        Ok(())
    }

    fn inq_att(&self, varid: i32, name: &str) -> BackendResult<(VarType, i64)> {
        let data = self.file.data.lock().expect("file mutex poisoned");
        let att = data
            .atts
            .get(&(varid.max(-1), name.to_string()))
            .ok_or(NC_ENOTATT)?;
        Ok((att.vartype, att.len))
    }

    fn get_att(&self, varid: i32, name: &str, value: &mut [u8]) -> BackendResult<()> {
        let data = self.file.data.lock().expect("file mutex poisoned");
        let att = data
            .atts
            .get(&(varid.max(-1), name.to_string()))
            .ok_or(NC_ENOTATT)?;
        let n = value.len().min(att.bytes.len());
        value[..n].copy_from_slice(&att.bytes[..n]);
        Ok(())
    }

    fn bput_vara(&self, varid: i32, start: &[i64], count: &[i64], buf: &[u8]) -> BackendResult<i32> {
        let mut st = self.state.lock().expect("handle mutex poisoned");
        if st.define_mode {
            return Err(NC_EINDEFINE);
        }
        if !self.writable {
            return Err(NC_EPERM);
        }
        let cap = st.buffer_cap.ok_or(NC_ENULLABUF)?;
        let nbytes = buf.len() as i64;
        if st.pending_bytes + nbytes > cap {
            return Err(NC_EINSUFFBUF);
        }

        {
            let data = self.file.data.lock().expect("file mutex poisoned");
            if data.vars.get(varid as usize).is_none() {
                return Err(NC_ENOTVAR);
            }
        }

        let req = st.next_req;
        st.next_req += 1;
        st.pending.push(PendingWrite {
            varid,
            start: start.to_vec(),
            count: count.to_vec(),
            buf: buf.to_vec(),
        });
        st.pending_bytes += nbytes;
        self.store.inner.stats.bput_calls.fetch_add(1, Ordering::Relaxed);
        Ok(req)
    }

    fn wait_all(&self, reqs: &mut Vec<i32>) -> BackendResult<()> {
        let mut st = self.state.lock().expect("handle mutex poisoned");
        let pending = std::mem::take(&mut st.pending);
        st.pending_bytes = 0;
        drop(st);

        self.store
            .inner
            .stats
            .wait_all_calls
            .fetch_add(1, Ordering::Relaxed);

        let mut status = NC_NOERR;
        let mut data = self.file.data.lock().expect("file mutex poisoned");
        for w in &pending {
            if let Err(e) = apply_write(&mut data, w) {
                if status == NC_NOERR {
                    status = e;
                }
            }
        }
        reqs.clear();
        if status != NC_NOERR {
            return Err(status);
        }
        Ok(())
    }

    fn get_vara_all(
        &self,
        varid: i32,
        start: &[i64],
        count: &[i64],
        buf: &mut [u8],
    ) -> BackendResult<()> {
        let st = self.state.lock().expect("handle mutex poisoned");
        if st.define_mode {
            return Err(NC_EINDEFINE);
        }
        drop(st);

        let mut data = self.file.data.lock().expect("file mutex poisoned");
        let varid = varid as usize;
        if varid >= data.vars.len() {
            return Err(NC_ENOTVAR);
        }
        let shape = var_shape(&data, &data.vars[varid]);
        check_bounds(&data, &data.vars[varid], &shape, start, count, false)?;
        let esize = data.vars[varid].vartype.size();
        let rec_size = record_size(&data, &data.vars[varid]);

        // another record variable may have pushed numrecs past this
        // variable's storage; fill the gap so reads see fill values
        let has_record = data.vars[varid]
            .dim_ids
            .first()
            .map(|&d| data.dims[d].unlimited)
            .unwrap_or(false);
        if has_record {
            let need = data.numrecs as usize * rec_size;
            let var = &mut data.vars[varid];
            if var.data.len() < need {
                var.data.resize(need, 0);
            }
        }

        let expected: i64 = count.iter().product::<i64>() * esize as i64;
        if buf.len() as i64 != expected {
            return Err(NC_EINVALCOORDS);
        }

        let var = &data.vars[varid];
        for_each_run(&shape, start, count, esize, |voff, coff, n| {
            buf[coff..coff + n].copy_from_slice(&var.data[voff..voff + n]);
        });
        Ok(())
    }
}
