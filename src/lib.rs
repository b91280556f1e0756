//! Loaded memory latency: measure dependent-load latency from some CPUs while
//! other CPUs generate bandwidth traffic, over one shared time window.
pub mod accessor;
pub mod affinity;
pub mod alloc;
pub mod bandwidth;
pub mod chase;
pub mod clock;
pub mod config;
pub mod coverage;
pub mod error;
pub mod latency;
pub mod orchestrator;
pub mod record;
pub mod report;
pub mod sync;

pub use error::{Error, Result};

/// Convert number of bytes to formatted string
pub fn format_size(bytes: f32) -> String {
    const GB: f32 = 1024.0 * 1024.0 * 1024.0;
    const MB: f32 = 1024.0 * 1024.0;
    const KB: f32 = 1024.0;

    if bytes >= GB {
        format!("{:.2} GiB", bytes / GB)
    } else if bytes >= MB {
        format!("{:.2} MiB", bytes / MB)
    } else if bytes >= KB {
        format!("{:.2} KiB", bytes / KB)
    } else {
        format!("{:.2} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::format_size;

    #[test]
    fn sizes_pick_the_largest_unit() {
        assert_eq!(format_size(512.0), "512.00 B");
        assert_eq!(format_size(8.0 * 1024.0 * 1024.0), "8.00 MiB");
        assert_eq!(format_size(1.5 * 1024.0 * 1024.0 * 1024.0), "1.50 GiB");
    }
}
