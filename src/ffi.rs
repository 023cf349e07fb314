//! Raw FFI bindings to the C shim layer.
//!
//! These are low-level unsafe functions. Use the safe wrappers in
//! [`transport::mpi`](crate::transport::mpi) and
//! [`backend::pnetcdf`](crate::backend::pnetcdf).

#![allow(dead_code)]

use std::os::raw::{c_char, c_int, c_longlong, c_void};

extern "C" {
    // ============================================================
    // Initialization and Finalization
    // ============================================================

    pub fn smiol_mpi_init_thread(required: c_int, provided: *mut c_int) -> c_int;
    pub fn smiol_mpi_finalize() -> c_int;
    pub fn smiol_mpi_initialized(flag: *mut c_int) -> c_int;

    // ============================================================
    // Communicator Operations
    // ============================================================

    pub fn smiol_comm_world() -> i32;
    pub fn smiol_comm_from_fortran(fcomm: c_int, comm: *mut i32) -> c_int;
    pub fn smiol_comm_rank(comm: i32, rank: *mut i32) -> c_int;
    pub fn smiol_comm_size(comm: i32, size: *mut i32) -> c_int;
    pub fn smiol_comm_dup(comm: i32, newcomm: *mut i32) -> c_int;
    pub fn smiol_comm_split(comm: i32, color: i32, key: i32, newcomm: *mut i32) -> c_int;
    pub fn smiol_comm_free(comm: i32) -> c_int;

    // ============================================================
    // Collectives
    // ============================================================

    pub fn smiol_barrier(comm: i32) -> c_int;

    pub fn smiol_allreduce_i64(
        sendval: *const c_longlong,
        recvval: *mut c_longlong,
        op: c_int,
        comm: i32,
    ) -> c_int;

    pub fn smiol_allreduce_i32(
        sendval: *const c_int,
        recvval: *mut c_int,
        op: c_int,
        comm: i32,
    ) -> c_int;

    pub fn smiol_bcast_bytes(buf: *mut c_void, nbytes: c_longlong, root: c_int, comm: i32)
        -> c_int;

    pub fn smiol_gather_i32(
        sendval: *const c_int,
        recvbuf: *mut c_int,
        root: c_int,
        comm: i32,
    ) -> c_int;

    pub fn smiol_gatherv_elems(
        sendbuf: *const c_void,
        sendcount: c_int,
        elem_size: c_longlong,
        recvbuf: *mut c_void,
        counts: *const c_int,
        displs: *const c_int,
        root: c_int,
        comm: i32,
    ) -> c_int;

    pub fn smiol_scatterv_elems(
        sendbuf: *const c_void,
        counts: *const c_int,
        displs: *const c_int,
        recvbuf: *mut c_void,
        recvcount: c_int,
        elem_size: c_longlong,
        root: c_int,
        comm: i32,
    ) -> c_int;

    pub fn smiol_alltoall_i32(sendbuf: *const c_int, recvbuf: *mut c_int, comm: i32) -> c_int;

    pub fn smiol_alltoallv_elems(
        sendbuf: *const c_void,
        sendcounts: *const c_int,
        sdispls: *const c_int,
        recvbuf: *mut c_void,
        recvcounts: *const c_int,
        rdispls: *const c_int,
        elem_size: c_longlong,
        comm: i32,
    ) -> c_int;

    // ============================================================
    // Error Information
    // ============================================================

    pub fn smiol_mpi_error_string(code: c_int, msg: *mut c_char, len: *mut c_int) -> c_int;
}

#[cfg(feature = "pnetcdf")]
extern "C" {
    // ============================================================
    // parallel-netCDF backend
    // ============================================================

    pub fn smiol_nc_create(comm: i32, path: *const c_char, ncid: *mut c_int) -> c_int;
    pub fn smiol_nc_open(comm: i32, path: *const c_char, write: c_int, ncid: *mut c_int) -> c_int;
    pub fn smiol_nc_close(ncid: c_int) -> c_int;
    pub fn smiol_nc_redef(ncid: c_int) -> c_int;
    pub fn smiol_nc_enddef(ncid: c_int) -> c_int;
    pub fn smiol_nc_sync(ncid: c_int) -> c_int;

    pub fn smiol_nc_buffer_attach(ncid: c_int, nbytes: c_longlong) -> c_int;
    pub fn smiol_nc_buffer_detach(ncid: c_int) -> c_int;
    pub fn smiol_nc_buffer_usage(ncid: c_int, usage: *mut c_longlong) -> c_int;

    pub fn smiol_nc_def_dim(ncid: c_int, name: *const c_char, len: c_longlong) -> c_int;
    pub fn smiol_nc_inq_dim(
        ncid: c_int,
        name: *const c_char,
        len: *mut c_longlong,
        is_unlimited: *mut c_int,
    ) -> c_int;

    pub fn smiol_nc_def_var(
        ncid: c_int,
        name: *const c_char,
        type_tag: c_int,
        ndims: c_int,
        dimnames: *const *const c_char,
    ) -> c_int;
    pub fn smiol_nc_inq_varid(ncid: c_int, name: *const c_char, varid: *mut c_int) -> c_int;
    pub fn smiol_nc_inq_var(
        ncid: c_int,
        varid: c_int,
        type_tag: *mut c_int,
        ndims: *mut c_int,
    ) -> c_int;
    pub fn smiol_nc_inq_vardimname(
        ncid: c_int,
        varid: c_int,
        idim: c_int,
        name: *mut c_char,
    ) -> c_int;

    pub fn smiol_nc_put_att(
        ncid: c_int,
        varid: c_int,
        name: *const c_char,
        type_tag: c_int,
        len: c_longlong,
        value: *const c_void,
    ) -> c_int;
    pub fn smiol_nc_inq_att(
        ncid: c_int,
        varid: c_int,
        name: *const c_char,
        type_tag: *mut c_int,
        len: *mut c_longlong,
    ) -> c_int;
    pub fn smiol_nc_get_att(
        ncid: c_int,
        varid: c_int,
        name: *const c_char,
        value: *mut c_void,
    ) -> c_int;

    pub fn smiol_nc_bput_vara(
        ncid: c_int,
        varid: c_int,
        start: *const c_longlong,
        count: *const c_longlong,
        ndims: c_int,
        buf: *const c_void,
        req: *mut c_int,
    ) -> c_int;
    pub fn smiol_nc_wait_all(ncid: c_int, n: c_int, reqs: *mut c_int) -> c_int;
    pub fn smiol_nc_get_vara_all(
        ncid: c_int,
        varid: c_int,
        start: *const c_longlong,
        count: *const c_longlong,
        ndims: c_int,
        buf: *mut c_void,
    ) -> c_int;

    pub fn smiol_nc_strerror(code: c_int, msg: *mut c_char, len: *mut c_int) -> c_int;
}
