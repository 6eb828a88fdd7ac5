//! Observability utilities: prometheus metrics, GPU polling and host checks

pub mod gpu;
pub mod host;
pub mod metrics;

pub use gpu::{gpu_info, spawn_gpu_polling, GpuInfo};
pub use host::{check_requirements, HostProfile, Shortfall};

/// Registers every metric so `/metrics` lists them before first use.
pub fn init() {
    metrics::touch();
    gpu::touch();
}
