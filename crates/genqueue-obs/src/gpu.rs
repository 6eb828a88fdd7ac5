use once_cell::sync::Lazy;
use prometheus::{Gauge, IntGauge};
use serde::Serialize;

static GPU_UTIL: Lazy<Gauge> = Lazy::new(|| prometheus::register_gauge!("genqueue_gpu_utilization", "GPU utilization percent").unwrap());
static GPU_MEM_USED: Lazy<IntGauge> = Lazy::new(|| prometheus::register_int_gauge!("genqueue_gpu_memory_bytes", "GPU memory used (bytes)").unwrap());
static GPU_TEMP: Lazy<Gauge> = Lazy::new(|| prometheus::register_gauge!("genqueue_gpu_temperature_celsius", "GPU temperature in C").unwrap());

pub(crate) fn touch() {
    let _ = &*GPU_UTIL;
    let _ = &*GPU_MEM_USED;
    let _ = &*GPU_TEMP;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GpuInfo {
    pub name: String,
    pub memory_total_bytes: u64,
}

/// First NVIDIA device, when built with `nvidia` and NVML is present.
pub fn gpu_info() -> Option<GpuInfo> {
    #[cfg(feature = "nvidia")]
    {
        let nvml = nvml_wrapper::Nvml::init().ok()?;
        let device = nvml.device_by_index(0).ok()?;
        let name = device.name().ok()?;
        let memory_total_bytes = device.memory_info().map(|m| m.total).unwrap_or(0);
        return Some(GpuInfo { name, memory_total_bytes });
    }
    #[allow(unreachable_code)]
    None
}

pub fn spawn_gpu_polling() {
    #[cfg(feature = "nvidia")]
    tokio::spawn(async move {
        let nvml = match nvml_wrapper::Nvml::init() {
            Ok(n) => n,
            Err(e) => {
                tracing::debug!("NVML unavailable, GPU metrics disabled: {e}");
                return;
            }
        };
        let device = match nvml.device_by_index(0) { Ok(d) => d, Err(_) => return };
        loop {
            if let Ok(util) = device.utilization_rates() { GPU_UTIL.set(util.gpu as f64); }
            if let Ok(mem) = device.memory_info() { GPU_MEM_USED.set(mem.used as i64); }
            if let Ok(temp) = device.temperature(nvml_wrapper::enum_wrappers::device::TemperatureSensor::Gpu) { GPU_TEMP.set(temp as f64); }
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        }
    });
}
