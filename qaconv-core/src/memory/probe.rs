use std::io;
use std::sync::Arc;

use super::Counter;

/// Source of "current usage" samples for a memory monitor.
pub trait UsageProbe: Send + Sync {
    fn sample(&self) -> io::Result<u64>;
}

/// Resident set size of the current process.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessRss;

impl UsageProbe for ProcessRss {
    fn sample(&self) -> io::Result<u64> {
        #[cfg(target_os = "linux")]
        {
            rss_linux()
        }

        #[cfg(target_os = "macos")]
        {
            rss_macos()
        }

        #[cfg(not(any(target_os = "macos", target_os = "linux")))]
        {
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "memory sampling not supported on this platform",
            ))
        }
    }
}

#[cfg(target_os = "linux")]
fn rss_linux() -> io::Result<u64> {
    let status = std::fs::read_to_string("/proc/self/status")?;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            let kb: u64 = rest
                .split_whitespace()
                .next()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "bad VmRSS line"))?;
            return Ok(kb * 1024);
        }
    }
    Err(io::Error::new(io::ErrorKind::InvalidData, "VmRSS missing"))
}

#[cfg(target_os = "macos")]
fn rss_macos() -> io::Result<u64> {
    let output = std::process::Command::new("ps")
        .args(["-o", "rss=", "-p", &std::process::id().to_string()])
        .output()?;
    let kb: u64 = String::from_utf8_lossy(&output.stdout)
        .trim()
        .parse()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "failed to parse RSS"))?;
    Ok(kb * 1024)
}

/// Reads the bytes charged to a `MemoryBudget` through leases.
#[derive(Clone)]
pub struct TrackedUsage {
    pub(super) counter: Arc<Counter>,
}

impl UsageProbe for TrackedUsage {
    fn sample(&self) -> io::Result<u64> {
        Ok(self.counter.in_use())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(target_os = "linux")]
    #[test]
    fn process_rss_is_nonzero() {
        assert!(ProcessRss.sample().unwrap() > 0);
    }
}
