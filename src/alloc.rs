//! # Alloc
//!
//! Backing memory for chase graphs and bandwidth buffers. Every region is fully
//! faulted in before it is handed out, so the first pass of a measurement loop
//! does not pay page-fault latency. Hugepage regions come from an anonymous
//! `MAP_HUGETLB | MAP_POPULATE` mapping; ordinary regions come from the global
//! allocator and are touched byte by byte.
use crate::error::{Error, Result};
use std::alloc::Layout;
use std::fmt;
use std::ptr::NonNull;
use std::str::FromStr;

/// Backing policy for a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HugePages {
    #[default]
    None,
    /// Kernel default hugepage size (`Hugepagesize` in /proc/meminfo).
    Default,
    Size64K,
    Size2M,
    Size32M,
    Size512M,
    Size1G,
    Size16G,
}

impl HugePages {
    pub const ALL: [HugePages; 8] = [
        HugePages::None,
        HugePages::Default,
        HugePages::Size64K,
        HugePages::Size2M,
        HugePages::Size32M,
        HugePages::Size512M,
        HugePages::Size1G,
        HugePages::Size16G,
    ];

    /// Accepted spellings, paired with the policy they select.
    pub const NAMES: [(&'static str, HugePages); 16] = [
        ("none", HugePages::None),
        ("0", HugePages::None),
        ("default", HugePages::Default),
        ("1", HugePages::Default),
        ("64K", HugePages::Size64K),
        ("64KB", HugePages::Size64K),
        ("2M", HugePages::Size2M),
        ("2MB", HugePages::Size2M),
        ("32M", HugePages::Size32M),
        ("32MB", HugePages::Size32M),
        ("512M", HugePages::Size512M),
        ("512MB", HugePages::Size512M),
        ("1G", HugePages::Size1G),
        ("1GB", HugePages::Size1G),
        ("16G", HugePages::Size16G),
        ("16GB", HugePages::Size16G),
    ];

    /// Explicit page size in bytes, `None` for ordinary memory and the kernel default.
    pub fn page_bytes(self) -> Option<usize> {
        const KB: usize = 1024;
        const MB: usize = 1024 * KB;
        const GB: usize = 1024 * MB;
        match self {
            HugePages::None | HugePages::Default => None,
            HugePages::Size64K => Some(64 * KB),
            HugePages::Size2M => Some(2 * MB),
            HugePages::Size32M => Some(32 * MB),
            HugePages::Size512M => Some(512 * MB),
            HugePages::Size1G => Some(GB),
            HugePages::Size16G => Some(16 * GB),
        }
    }

    pub fn is_huge(self) -> bool {
        self != HugePages::None
    }
}

impl fmt::Display for HugePages {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = HugePages::NAMES
            .iter()
            .find(|(_, policy)| policy == self)
            .map(|(name, _)| *name)
            .unwrap_or("?");
        f.write_str(name)
    }
}

impl FromStr for HugePages {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if let Some((_, policy)) = HugePages::NAMES
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(s))
        {
            return Ok(*policy);
        }
        s.parse::<usize>()
            .ok()
            .and_then(|n| HugePages::ALL.get(n).copied())
            .ok_or_else(|| {
                let known: Vec<&str> = HugePages::NAMES.iter().map(|(name, _)| *name).collect();
                Error::InvalidConfig(format!(
                    "unknown hugepage size '{s}' (known: {})",
                    known.join(", ")
                ))
            })
    }
}

enum Backing {
    Heap(Layout),
    #[cfg(target_os = "linux")]
    Mapped,
}

/// An owned, pre-faulted memory region. Released when dropped.
pub struct Region {
    ptr: NonNull<u8>,
    len: usize,
    backing: Backing,
}

// SAFETY: `Region` owns its allocation exclusively. Shared references only hand
// out `*const` views; writes require `&mut self`.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Whole region as machine words. The region must be word aligned, which
    /// every caller in this crate guarantees by asking for `alignment >= 8`.
    pub fn words(&self) -> &[usize] {
        debug_assert_eq!(self.as_ptr() as usize % std::mem::align_of::<usize>(), 0);
        // SAFETY: allocation is live for `&self`, aligned, and fully initialized by prefault.
        unsafe {
            std::slice::from_raw_parts(
                self.as_ptr() as *const usize,
                self.len / std::mem::size_of::<usize>(),
            )
        }
    }

    pub fn words_mut(&mut self) -> &mut [usize] {
        debug_assert_eq!(self.as_ptr() as usize % std::mem::align_of::<usize>(), 0);
        let words = self.len / std::mem::size_of::<usize>();
        // SAFETY: as in `words`, plus exclusive access through `&mut self`.
        unsafe { std::slice::from_raw_parts_mut(self.as_mut_ptr() as *mut usize, words) }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        match self.backing {
            // SAFETY: `ptr` came from `std::alloc::alloc` with this exact layout.
            Backing::Heap(layout) => unsafe { std::alloc::dealloc(self.ptr.as_ptr(), layout) },
            #[cfg(target_os = "linux")]
            Backing::Mapped => unsafe {
                libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
            },
        }
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

/// Allocate `bytes` of pre-faulted memory. `alignment` applies to ordinary
/// memory only; hugepage mappings are always aligned to their page size.
pub fn allocate(bytes: usize, policy: HugePages, alignment: usize) -> Result<Region> {
    if bytes == 0 {
        return Err(Error::ZeroSizedRegion);
    }
    if policy.is_huge() {
        return allocate_huge(bytes, policy);
    }

    let layout = Layout::from_size_align(bytes, alignment)
        .map_err(|_| Error::AllocationFailed { bytes, alignment })?;
    // SAFETY: layout has non-zero size.
    let raw = unsafe { std::alloc::alloc(layout) };
    let ptr = NonNull::new(raw).ok_or(Error::AllocationFailed { bytes, alignment })?;

    // prefault; a non-zero fill keeps this from being folded into a lazy calloc
    // SAFETY: `ptr` is valid for `bytes` writes.
    unsafe { std::ptr::write_bytes(ptr.as_ptr(), 1, bytes) };

    Ok(Region {
        ptr,
        len: bytes,
        backing: Backing::Heap(layout),
    })
}

/// System page size.
pub fn page_size() -> usize {
    static PAGE_SIZE: std::sync::OnceLock<usize> = std::sync::OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        // SAFETY: sysconf has no preconditions.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 { size as usize } else { 4096 }
    })
}

#[cfg(target_os = "linux")]
fn default_huge_page_size() -> usize {
    static HUGE_PAGE_SIZE: std::sync::OnceLock<usize> = std::sync::OnceLock::new();
    *HUGE_PAGE_SIZE.get_or_init(|| read_huge_page_size().unwrap_or(2 * 1024 * 1024))
}

#[cfg(target_os = "linux")]
fn read_huge_page_size() -> Option<usize> {
    let contents = std::fs::read_to_string("/proc/meminfo").ok()?;
    let line = contents.lines().find(|l| l.starts_with("Hugepagesize:"))?;
    let size_kb: usize = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(size_kb * 1024)
}

#[cfg(target_os = "linux")]
fn allocate_huge(bytes: usize, policy: HugePages) -> Result<Region> {
    let (page, size_flag) = match policy.page_bytes() {
        // MAP_HUGE_* encodes log2(page size) above MAP_HUGE_SHIFT
        Some(page) => (
            page,
            (page.trailing_zeros() as libc::c_int) << libc::MAP_HUGE_SHIFT,
        ),
        None => (default_huge_page_size(), 0),
    };
    let len = bytes.div_ceil(page) * page;
    let flags = libc::MAP_PRIVATE
        | libc::MAP_ANONYMOUS
        | libc::MAP_HUGETLB
        | libc::MAP_POPULATE
        | size_flag;

    // SAFETY: anonymous mapping, no file descriptor or address hint involved.
    let raw = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            flags,
            -1,
            0,
        )
    };
    if raw == libc::MAP_FAILED {
        return Err(Error::HugePagesUnavailable {
            bytes: len,
            policy: policy.to_string(),
            source: std::io::Error::last_os_error(),
        });
    }
    let ptr = NonNull::new(raw as *mut u8).ok_or(Error::AllocationFailed {
        bytes: len,
        alignment: page,
    })?;

    Ok(Region {
        ptr,
        len,
        backing: Backing::Mapped,
    })
}

#[cfg(not(target_os = "linux"))]
fn allocate_huge(_bytes: usize, policy: HugePages) -> Result<Region> {
    Err(Error::UnsupportedBacking(format!("{policy} hugepage")))
}
