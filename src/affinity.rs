//! # Affinity
//!
//! Pinning for worker threads. A worker pins itself, then asks the kernel what
//! it actually got: a different or wider mask is logged and the run goes on,
//! an empty mask is fatal.
use crate::error::{Error, Result};
use log::warn;

/// Pin the calling thread to `cpu` and verify the resulting mask.
pub fn pin_current(cpu: usize) -> Result<Vec<usize>> {
    if !core_affinity::set_for_current(core_affinity::CoreId { id: cpu }) {
        warn!("Couldn't pin thread to CPU {cpu} (NOTE: this is expected on macOS)");
    }

    let Some(bound) = current_cpus()? else {
        return Ok(vec![cpu]);
    };
    check_bound(cpu, &bound)?;
    Ok(bound)
}

/// Report anomalies in the mask bound for a thread that asked for `cpu`.
pub fn check_bound(cpu: usize, bound: &[usize]) -> Result<()> {
    if bound.is_empty() {
        return Err(Error::NoCpuBound { cpu });
    }
    for &other in bound.iter().filter(|&&c| c != cpu) {
        warn!("wanted CPU{cpu} but got CPU{other}");
    }
    if bound.len() > 1 {
        warn!("{} CPUs were bound for CPU {cpu}", bound.len());
    }
    Ok(())
}

/// CPUs the calling thread may run on, `None` where the platform can't say.
#[cfg(target_os = "linux")]
pub fn current_cpus() -> Result<Option<Vec<usize>>> {
    // SAFETY: cpu_set_t is plain data; zero is the empty set.
    let mut set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
    // SAFETY: pid 0 is the calling thread and `set` is a valid out-pointer.
    let rc = unsafe { libc::sched_getaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &mut set) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    let cpus = (0..libc::CPU_SETSIZE as usize)
        .filter(|&cpu| unsafe { libc::CPU_ISSET(cpu, &set) })
        .collect();
    Ok(Some(cpus))
}

#[cfg(not(target_os = "linux"))]
pub fn current_cpus() -> Result<Option<Vec<usize>>> {
    Ok(None)
}

/// Ask for the highest scheduling priority; failure only costs precision.
pub fn raise_priority(thread_name: &str) {
    if thread_priority::set_current_thread_priority(thread_priority::ThreadPriority::Max).is_err() {
        warn!("Couldn't set '{thread_name}' to maximum thread priority");
    }
}
