//! # Error
//!
//! Every failure the measurement engine can report. Configuration and resource
//! errors are fatal for a run: the binary logs them and exits non-zero. A timing
//! shortfall is deliberately absent here; a worker that never got to measure
//! returns a record with zero samples instead of an error.
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Stride of zero, or a stride larger than the number of cache lines.
    #[error(
        "invalid cache line stride {stride} for {count} cache lines (need 1 <= stride <= count; \
         for a jump to self use stride == count)"
    )]
    InvalidStride { stride: usize, count: usize },

    /// A single self-loop cannot be shuffled.
    #[error("cache line stride equals cache line count ({count}) but randomize was requested")]
    RandomizeSelfLoop { count: usize },

    /// The node header does not fit in, or does not tile, the requested line size.
    #[error("chase node of {node_bytes} bytes does not equal cacheline_bytes = {cacheline_bytes}")]
    NodeSize {
        node_bytes: usize,
        cacheline_bytes: usize,
    },

    #[error("cacheline_bytes = {cacheline_bytes} is not an exact multiple of the pointer size {pointer_bytes}")]
    CachelineAlignment {
        cacheline_bytes: usize,
        pointer_bytes: usize,
    },

    /// Any other configuration value that cannot produce a meaningful run.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("refusing to allocate a zero-sized region")]
    ZeroSizedRegion,

    /// mmap with MAP_HUGETLB failed.
    #[error(
        "mmap of {bytes} bytes backed by {policy} hugepages failed: {source}\n\
         You probably need to allocate hugepages. Try:\n \
         sudo apt-get install libhugetlbfs-bin\n \
         sudo hugeadm --create-global-mounts\n \
         sudo hugeadm --pool-pages-max DEFAULT:+1000\n\
         (Only the last line is needed after a reboot.)\n\
         Or, no pages of the requested hugepage size are available."
    )]
    HugePagesUnavailable {
        bytes: usize,
        policy: String,
        #[source]
        source: std::io::Error,
    },

    #[error("allocation of {bytes} bytes aligned to {alignment} failed")]
    AllocationFailed { bytes: usize, alignment: usize },

    #[error("{0} backing is not supported on this platform")]
    UnsupportedBacking(String),

    /// The kernel reports an empty affinity mask after pinning.
    #[error("0 CPUs were bound after pinning to CPU {cpu}")]
    NoCpuBound { cpu: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("worker thread '{0}' panicked")]
    WorkerPanicked(String),
}

pub type Result<T> = std::result::Result<T, Error>;
