//! # Accessor
//!
//! The single load and the single store the measurement loops are made of.
//! They must survive the optimizer exactly as written: one load per hop of the
//! pointer chase, one load or store per cache line of a bandwidth pass. On
//! x86_64 and aarch64 the access is an inline `mov`/`ldr`/`str`; elsewhere a
//! volatile access stands in.
use std::hint::black_box;

/// One word-sized access to memory the caller owns.
pub trait MemoryAccessor {
    /// # Safety
    /// `ptr` must be valid for a word-sized aligned read.
    unsafe fn read_line(ptr: *const usize) -> usize;

    /// # Safety
    /// `ptr` must be valid for a word-sized aligned write.
    unsafe fn write_line(ptr: *mut usize, value: usize);
}

/// Backend based on `read_volatile`/`write_volatile`, available everywhere.
pub struct VolatileAccessor;

impl MemoryAccessor for VolatileAccessor {
    #[inline(always)]
    unsafe fn read_line(ptr: *const usize) -> usize {
        unsafe { std::ptr::read_volatile(ptr) }
    }

    #[inline(always)]
    unsafe fn write_line(ptr: *mut usize, value: usize) {
        unsafe { std::ptr::write_volatile(ptr, value) }
    }
}

/// Backend issuing the load/store instruction directly.
#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
pub struct AsmAccessor;

#[cfg(target_arch = "x86_64")]
impl MemoryAccessor for AsmAccessor {
    #[inline(always)]
    unsafe fn read_line(ptr: *const usize) -> usize {
        let value: usize;
        unsafe {
            std::arch::asm!(
                "mov {value}, qword ptr [{ptr}]",
                ptr = in(reg) ptr,
                value = out(reg) value,
                options(nostack, preserves_flags, readonly),
            );
        }
        value
    }

    #[inline(always)]
    unsafe fn write_line(ptr: *mut usize, value: usize) {
        unsafe {
            std::arch::asm!(
                "mov qword ptr [{ptr}], {value}",
                ptr = in(reg) ptr,
                value = in(reg) value,
                options(nostack, preserves_flags),
            );
        }
    }
}

#[cfg(target_arch = "aarch64")]
impl MemoryAccessor for AsmAccessor {
    #[inline(always)]
    unsafe fn read_line(ptr: *const usize) -> usize {
        let value: usize;
        unsafe {
            std::arch::asm!(
                "ldr {value}, [{ptr}]",
                ptr = in(reg) ptr,
                value = out(reg) value,
                options(nostack, preserves_flags, readonly),
            );
        }
        value
    }

    #[inline(always)]
    unsafe fn write_line(ptr: *mut usize, value: usize) {
        unsafe {
            std::arch::asm!(
                "str {value}, [{ptr}]",
                ptr = in(reg) ptr,
                value = in(reg) value,
                options(nostack, preserves_flags),
            );
        }
    }
}

/// Backend used by the measurement loops on this target.
#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
pub type NativeAccessor = AsmAccessor;
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub type NativeAccessor = VolatileAccessor;

/// Spin through `count` empty iterations the optimizer cannot remove.
#[inline(always)]
pub fn delay(count: usize) {
    for i in 0..count {
        black_box(i);
    }
}

/// Write back and invalidate every cache line in `[ptr, ptr + len)`.
///
/// # Safety
/// The range must be mapped.
pub unsafe fn flush_range(ptr: *const u8, len: usize, line_bytes: usize) {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        let mut offset = 0;
        while offset < len {
            std::arch::x86_64::_mm_clflush(ptr.add(offset));
            offset += line_bytes;
        }
        std::arch::x86_64::_mm_mfence();
    }

    #[cfg(target_arch = "aarch64")]
    unsafe {
        let mut offset = 0;
        while offset < len {
            std::arch::asm!("dc civac, {0}", in(reg) ptr.add(offset), options(nostack, preserves_flags));
            offset += line_bytes;
        }
        std::arch::asm!("dsb ish", "isb", options(nostack, preserves_flags));
    }

    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        let _ = (ptr, len, line_bytes);
        log::debug!("cache flush is a no-op on this target");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip<A: MemoryAccessor>() {
        let mut words = vec![0usize; 16];
        let base = words.as_mut_ptr();
        unsafe {
            A::write_line(base.add(3), 0xfeed);
            A::write_line(base.add(15), 42);
            assert_eq!(A::read_line(base.add(3)), 0xfeed);
            assert_eq!(A::read_line(base.add(15)), 42);
            assert_eq!(A::read_line(base), 0);
        }
        assert_eq!(words[3], 0xfeed);
    }

    #[test]
    fn volatile_backend_reads_back_writes() {
        roundtrip::<VolatileAccessor>();
    }

    #[test]
    fn native_backend_reads_back_writes() {
        roundtrip::<NativeAccessor>();
    }

    #[test]
    fn flush_keeps_contents() {
        let words: Vec<usize> = (0..64).collect();
        unsafe { flush_range(words.as_ptr() as *const u8, words.len() * 8, 64) };
        assert_eq!(words[63], 63);
    }
}
