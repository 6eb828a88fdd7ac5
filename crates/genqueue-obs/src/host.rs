use std::fmt;

use genqueue_common::config::{parse_memory, RuntimeConfig};
use genqueue_common::Result;
use serde::Serialize;
use sysinfo::System;

use crate::gpu::{gpu_info, GpuInfo};

#[derive(Debug, Clone, Serialize)]
pub struct HostProfile {
    pub cpus: usize,
    pub cpu_usage_percent: f32,
    pub memory_total_bytes: u64,
    pub memory_used_bytes: u64,
    pub gpu: Option<GpuInfo>,
}

impl HostProfile {
    pub fn detect() -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();
        let cpus = sys.cpus().len();
        let cpu_usage_percent = if cpus == 0 {
            0.0
        } else {
            sys.cpus().iter().map(|c| c.cpu_usage()).sum::<f32>() / cpus as f32
        };
        Self {
            cpus,
            cpu_usage_percent,
            memory_total_bytes: sys.total_memory(),
            memory_used_bytes: sys.used_memory(),
            gpu: gpu_info(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Shortfall {
    Cpu { declared: usize, available: usize },
    Memory { declared: u64, available: u64 },
    Gpu { declared: String, found: Option<String> },
}

impl fmt::Display for Shortfall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Shortfall::Cpu { declared, available } => {
                write!(f, "runtime declares {declared} CPUs, host has {available}")
            }
            Shortfall::Memory { declared, available } => write!(
                f,
                "runtime declares {} MiB of memory, host has {} MiB",
                declared / 1024 / 1024,
                available / 1024 / 1024
            ),
            Shortfall::Gpu { declared, found: Some(found) } => {
                write!(f, "runtime declares a {declared} GPU, host has {found}")
            }
            Shortfall::Gpu { declared, found: None } => {
                write!(f, "runtime declares a {declared} GPU, none detected")
            }
        }
    }
}

/// Compares the declared runtime against `host`. Shortfalls are advisory:
/// the caller decides whether to warn or refuse.
pub fn check_requirements(runtime: &RuntimeConfig, host: &HostProfile) -> Result<Vec<Shortfall>> {
    let mut out = Vec::new();
    if host.cpus < runtime.cpu {
        out.push(Shortfall::Cpu { declared: runtime.cpu, available: host.cpus });
    }
    let memory = parse_memory(&runtime.memory)?;
    if host.memory_total_bytes < memory {
        out.push(Shortfall::Memory { declared: memory, available: host.memory_total_bytes });
    }
    if let Some(declared) = runtime.gpu.as_deref().filter(|g| !g.is_empty()) {
        let found = host.gpu.as_ref().map(|g| g.name.clone());
        let matches = found
            .as_deref()
            .is_some_and(|name| name.to_ascii_lowercase().contains(&declared.to_ascii_lowercase()));
        if !matches {
            out.push(Shortfall::Gpu { declared: declared.to_string(), found });
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(cpus: usize, mem_gib: u64, gpu: Option<&str>) -> HostProfile {
        HostProfile {
            cpus,
            cpu_usage_percent: 0.0,
            memory_total_bytes: mem_gib << 30,
            memory_used_bytes: 0,
            gpu: gpu.map(|name| GpuInfo { name: name.into(), memory_total_bytes: 24 << 30 }),
        }
    }

    #[test]
    fn matching_host_has_no_shortfalls() {
        let runtime = RuntimeConfig::default();
        let found = check_requirements(&runtime, &host(32, 64, Some("NVIDIA A10G"))).unwrap();
        assert!(found.is_empty(), "{found:?}");
    }

    #[test]
    fn reports_each_missing_resource() {
        let runtime = RuntimeConfig::default();
        let found = check_requirements(&runtime, &host(4, 8, None)).unwrap();
        assert_eq!(found.len(), 3);
        assert!(matches!(found[0], Shortfall::Cpu { declared: 16, available: 4 }));
        assert!(found[2].to_string().contains("none detected"));
    }

    #[test]
    fn gpu_class_mismatch_names_the_found_device() {
        let runtime = RuntimeConfig { cpu: 1, memory: "1Gi".into(), gpu: Some("A100".into()) };
        let found = check_requirements(&runtime, &host(2, 2, Some("NVIDIA A10G"))).unwrap();
        assert_eq!(found, vec![Shortfall::Gpu { declared: "A100".into(), found: Some("NVIDIA A10G".into()) }]);
    }

    #[test]
    fn detect_reads_the_current_host() {
        let profile = HostProfile::detect();
        assert!(profile.cpus >= 1);
        assert!(profile.memory_total_bytes > 0);
    }
}
