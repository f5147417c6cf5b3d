// Resource probing for the Parallel and Adaptive execution strategies.

use serde::Serialize;

/// Limits applied when admitting targets under parallel execution.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ResourceLimits {
    pub max_cpu_percent: f64,
    /// 0 means unlimited.
    pub max_memory_bytes: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_cpu_percent: 85.0,
            max_memory_bytes: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ResourceSample {
    pub cpu_percent: f64,
    pub memory_bytes: u64,
}

impl ResourceSample {
    pub fn within(&self, limits: &ResourceLimits) -> bool {
        if self.cpu_percent > limits.max_cpu_percent {
            return false;
        }
        if limits.max_memory_bytes > 0 && self.memory_bytes > limits.max_memory_bytes {
            return false;
        }
        true
    }
}

pub trait ResourceProbe: Send + Sync {
    fn sample(&self) -> ResourceSample;
}

/// Best-effort probe over procfs; reports zeros where the platform offers
/// nothing, which admits work rather than starving it.
pub struct SystemResourceProbe;

impl ResourceProbe for SystemResourceProbe {
    fn sample(&self) -> ResourceSample {
        ResourceSample {
            cpu_percent: read_cpu_percent().unwrap_or(0.0),
            memory_bytes: read_rss_bytes().unwrap_or(0),
        }
    }
}

/// Fixed-value probe for tests and for forcing strategy decisions.
pub struct FixedResourceProbe(pub ResourceSample);

impl ResourceProbe for FixedResourceProbe {
    fn sample(&self) -> ResourceSample {
        self.0
    }
}

fn read_cpu_percent() -> Option<f64> {
    // one-minute load average scaled by core count
    let text = std::fs::read_to_string("/proc/loadavg").ok()?;
    let load: f64 = text.split_whitespace().next()?.parse().ok()?;
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1) as f64;
    Some((load / cores * 100.0).min(100.0))
}

fn read_rss_bytes() -> Option<u64> {
    let text = std::fs::read_to_string("/proc/self/status").ok()?;
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            let kb: u64 = rest
                .trim()
                .trim_end_matches("kB")
                .trim()
                .parse()
                .ok()?;
            return Some(kb * 1024);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_check() {
        let limits = ResourceLimits {
            max_cpu_percent: 50.0,
            max_memory_bytes: 1024,
        };
        assert!(ResourceSample {
            cpu_percent: 40.0,
            memory_bytes: 512
        }
        .within(&limits));
        assert!(!ResourceSample {
            cpu_percent: 60.0,
            memory_bytes: 512
        }
        .within(&limits));
        assert!(!ResourceSample {
            cpu_percent: 10.0,
            memory_bytes: 4096
        }
        .within(&limits));
    }

    #[test]
    fn unlimited_memory_admits_everything() {
        let limits = ResourceLimits::default();
        assert!(ResourceSample {
            cpu_percent: 10.0,
            memory_bytes: u64::MAX
        }
        .within(&limits));
    }

    #[test]
    fn system_probe_does_not_panic() {
        let _ = SystemResourceProbe.sample();
    }
}
