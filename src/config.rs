//! Run-time configuration of the I/O pipeline.

use crate::backend::memory::MemStore;

/// Which file library a context opens files with.
#[derive(Clone)]
pub enum Backend {
    /// The in-memory backend, reading and writing files in the given
    /// store. Always available; the default without the `pnetcdf`
    /// feature.
    Memory(MemStore),
    /// parallel-netCDF. Requires the context to run on the MPI
    /// transport.
    #[cfg(feature = "pnetcdf")]
    Pnetcdf,
}

/// Tunables for a context, applied to every file it opens.
///
/// # Example
///
/// ```
/// use smiol::Config;
///
/// let config = Config {
///     buf_size: 64 * 1024,
///     agg_factor: 2,
///     ..Config::default()
/// };
/// assert_eq!(config.n_reqs, 512);
/// ```
#[derive(Clone)]
pub struct Config {
    /// Maximum outstanding non-blocking write requests per file before
    /// the writer forces a collective flush.
    pub n_reqs: usize,
    /// Size in bytes of the backend buffer attached to writable files;
    /// also the global usage bound that triggers a collective flush.
    pub buf_size: i64,
    /// Ranks per intra-group aggregation sub-group in a decomposition;
    /// `0` or `1` disables aggregation.
    pub agg_factor: i32,
    /// CPU cores the writer thread is pinned to (with the `affinity`
    /// feature). Empty means no pinning. This is a hint, not a contract.
    pub writer_cores: Vec<usize>,
    /// File library used by `open_file`.
    pub backend: Backend,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            n_reqs: 512,
            buf_size: 512 * 1024 * 1024,
            agg_factor: 0,
            writer_cores: Vec::new(),
            #[cfg(feature = "pnetcdf")]
            backend: Backend::Pnetcdf,
            #[cfg(not(feature = "pnetcdf"))]
            backend: Backend::Memory(MemStore::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_tunables() {
        let c = Config::default();
        assert_eq!(c.n_reqs, 512);
        assert_eq!(c.buf_size, 512 * 1024 * 1024);
        assert_eq!(c.agg_factor, 0);
        assert!(c.writer_cores.is_empty());
    }
}
