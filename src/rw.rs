//! The decomposed write and read paths: `put_var` and `get_var`.
//!
//! Writes are asynchronous: after the compute-to-I/O redistribution,
//! each I/O rank enqueues a descriptor and the per-file writer thread
//! posts it to the backend. Reads are synchronous with respect to the
//! writer: `get_var` drains the writer before touching the backend.

use crate::decomp::{Aggregation, Decomp};
use crate::error::{Error, Result};
use crate::file::File;
use crate::queue::WriteDesc;
use crate::transfer::{transfer_field, Direction};
use crate::transport::Comm;
use crate::vartype::{as_bytes, as_bytes_mut, VarElement, VarType};
use crate::writer;
use std::sync::atomic::Ordering;

/// Parallel access plan for one variable: the element size (bytes of
/// one slowest-dimension record), and the per-rank `start`/`count`
/// arrays.
struct StartCount {
    vartype: VarType,
    elem_size: usize,
    start: Vec<i64>,
    count: Vec<i64>,
}

impl File {
    /// Work out `start[]`/`count[]` and the effective element size for
    /// reading or writing a variable.
    ///
    /// One *element* is the contiguous memory range under the
    /// slowest-varying non-record dimension: for
    /// `f32 foo[nCells][nVertLevels]` decomposed over `nCells`, an
    /// element is `nVertLevels` floats. A record dimension is always
    /// axis 0 and contributes `start = frame, count = 1`. For
    /// non-decomposed writes, every rank but global rank 0 gets zero
    /// counts so that identical copies are not written repeatedly.
    fn build_start_count(
        &self,
        varname: &str,
        decomp: Option<&Decomp>,
        write: bool,
    ) -> Result<StartCount> {
        let info = self.inquire_var(varname)?;
        let ndims = info.dims.len();

        let mut dim_info = Vec::with_capacity(ndims);
        for name in &info.dims {
            dim_info.push(self.inquire_dim(name)?);
        }
        let has_unlimited = dim_info.first().map(|d| d.is_unlimited).unwrap_or(false);

        let mut elem_size = info.vartype.size();
        let mut start = vec![0i64; ndims];
        let mut count = vec![0i64; ndims];

        for i in 0..ndims {
            start[i] = 0;
            count[i] = dim_info[i].size;

            if has_unlimited && i == 0 {
                start[i] = self.get_frame();
                count[i] = 1;
            }

            if decomp.is_some() {
                let decomposed_axis = usize::from(has_unlimited);
                if i == decomposed_axis {
                    let d = decomp.unwrap();
                    start[i] = d.io_start();
                    count[i] = d.io_count() as i64;
                } else {
                    elem_size *= count[i] as usize;
                }
            } else {
                elem_size *= count[i] as usize;
            }

            // identical copies exist on every rank; one writer suffices
            if write && decomp.is_none() && self.ctx.rank() != 0 {
                count[i] = 0;
            }
        }

        Ok(StartCount {
            vartype: info.vartype,
            elem_size,
            start,
            count,
        })
    }

    /// Write a variable.
    ///
    /// With a decomposition, `buf` holds this rank's compute elements
    /// and the elements are redistributed to the I/O ranks' slabs
    /// before being queued for the background writer. Without one, all
    /// ranks must hold identical copies of the whole variable and rank
    /// 0's copy is written.
    ///
    /// The call returns once the descriptor is queued; use
    /// [`sync`](File::sync) or [`close`](File::close) to wait for the
    /// data to reach the backend. Collective.
    pub fn put_var<T: VarElement>(
        &self,
        varname: &str,
        decomp: Option<&Decomp>,
        buf: &[T],
    ) -> Result<()> {
        if varname.is_empty() {
            return Err(Error::InvalidArgument("variable name must not be empty"));
        }
        let sc = self.build_start_count(varname, decomp, true)?;
        if sc.vartype != T::VAR_TYPE {
            return Err(Error::WrongArgType {
                expected: sc.vartype,
                actual: T::VAR_TYPE,
            });
        }
        let scalars_per_elem = sc.elem_size / T::VAR_TYPE.size();

        // redistribute decomposed elements onto the I/O slabs
        let mut out_buf = Vec::new();
        if let Some(d) = decomp {
            let needed = d.n_compute() * scalars_per_elem;
            if buf.len() < needed {
                return Err(Error::InsufficientArg {
                    needed,
                    have: buf.len(),
                });
            }
            let user_bytes = &as_bytes(buf)[..d.n_compute() * sc.elem_size];
            out_buf = vec![0u8; sc.elem_size * d.io_count()];

            match &d.agg {
                Aggregation::Disabled => {
                    transfer_field(d, Direction::CompToIo, sc.elem_size, user_bytes, &mut out_buf)?;
                }
                Aggregation::Grouped {
                    comm,
                    n_compute_agg,
                    counts,
                    displs,
                } => {
                    let mut agg_buf = vec![0u8; sc.elem_size * n_compute_agg];
                    comm.gatherv_bytes(user_bytes, sc.elem_size, counts, displs, 0, &mut agg_buf)?;
                    transfer_field(d, Direction::CompToIo, sc.elem_size, &agg_buf, &mut out_buf)?;
                }
            }
        } else if buf.len() < scalars_per_elem {
            return Err(Error::InsufficientArg {
                needed: scalars_per_elem,
                have: buf.len(),
            });
        }

        self.ensure_data()?;
        let varid = self.resolve_varid(varname)?;

        // only I/O ranks feed the writer; everyone else is done once
        // the transfer engine has run
        if self.io_task {
            let payload = if decomp.is_some() {
                out_buf
            } else {
                // the descriptor owns its buffer until the writer hands
                // it to the backend's buffered put
                as_bytes(buf)[..sc.elem_size].to_vec()
            };
            let bufsize = payload.len() as i64;
            let desc = WriteDesc {
                var_id: varid,
                start: sc.start,
                count: sc.count,
                buf: payload,
                bufsize,
            };

            let _ticket = self.shared.ticket.lock();
            self.shared.queue.add(desc);
            if !self.shared.active.load(Ordering::Acquire) {
                // reap the previous writer's handle before relaunching
                let mut slot = self.writer.lock().expect("writer slot poisoned");
                if let Some(h) = slot.take() {
                    let _ = h.join();
                }
                self.shared.active.store(true, Ordering::Release);
                match writer::launch(self.shared.clone()) {
                    Ok(h) => *slot = Some(h),
                    Err(e) => {
                        self.shared.active.store(false, Ordering::Release);
                        return Err(Error::Async(format!("failed to launch writer thread: {e}")));
                    }
                }
            }
        }

        Ok(())
    }

    /// Read a variable.
    ///
    /// With a decomposition, each rank receives its compute elements;
    /// without one, every rank receives the whole variable (the I/O
    /// ranks read it and broadcast across their groups). Drains the
    /// async writer first, so all writes queued on this file before the
    /// call are visible. Collective.
    pub fn get_var<T: VarElement>(
        &self,
        varname: &str,
        decomp: Option<&Decomp>,
        buf: &mut [T],
    ) -> Result<()> {
        if varname.is_empty() {
            return Err(Error::InvalidArgument("variable name must not be empty"));
        }
        let sc = self.build_start_count(varname, decomp, false)?;
        if sc.vartype != T::VAR_TYPE {
            return Err(Error::WrongArgType {
                expected: sc.vartype,
                actual: T::VAR_TYPE,
            });
        }
        let scalars_per_elem = sc.elem_size / T::VAR_TYPE.size();
        let needed = match decomp {
            Some(d) => d.n_compute() * scalars_per_elem,
            None => scalars_per_elem,
        };
        if buf.len() < needed {
            return Err(Error::InsufficientArg {
                needed,
                have: buf.len(),
            });
        }

        let mut in_buf = decomp.map(|d| vec![0u8; sc.elem_size * d.io_count()]);

        self.join_writer();
        self.take_writer_fault()?;
        self.ensure_data()?;
        let varid = self.resolve_varid(varname)?;

        let ierr = match &self.backend {
            Some(b) if self.io_task => {
                let target: &mut [u8] = match in_buf.as_mut() {
                    Some(slab) => slab.as_mut_slice(),
                    None => &mut as_bytes_mut(buf)[..sc.elem_size],
                };
                b.get_vara_all(varid, &sc.start, &sc.count, target)
                    .err()
                    .unwrap_or(0)
            }
            _ => 0,
        };
        self.group_status(ierr)?;

        match decomp {
            Some(d) => {
                let in_buf = in_buf.unwrap();
                let user_bytes = &mut as_bytes_mut(buf)[..d.n_compute() * sc.elem_size];
                match &d.agg {
                    Aggregation::Disabled => {
                        transfer_field(d, Direction::IoToComp, sc.elem_size, &in_buf, user_bytes)?;
                    }
                    Aggregation::Grouped {
                        comm,
                        n_compute_agg,
                        counts,
                        displs,
                    } => {
                        let mut agg_buf = vec![0u8; sc.elem_size * n_compute_agg];
                        transfer_field(d, Direction::IoToComp, sc.elem_size, &in_buf, &mut agg_buf)?;
                        comm.scatterv_bytes(&agg_buf, sc.elem_size, counts, displs, 0, user_bytes)?;
                    }
                }
            }
            None => {
                // the group's I/O rank holds the data; share it
                let user_bytes = &mut as_bytes_mut(buf)[..sc.elem_size];
                self.io_group_comm.bcast_bytes(user_bytes, 0)?;
            }
        }

        Ok(())
    }
}
