use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};

use crate::generation::GenerationConfig;
use crate::{GenqueueError, Result};

pub const CONFIG_ENV: &str = "GENQUEUE_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub name: String,
    pub runtime: RuntimeConfig,
    pub volumes: Vec<VolumeConfig>,
    pub model: ModelConfig,
    pub generation: GenerationConfig,
    pub task_queue: TaskQueueConfig,
    pub server: ServerConfig,
}

/// Hardware the deployment declares it needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub cpu: usize,
    pub memory: String,
    pub gpu: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeConfig {
    pub name: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Mock,
    Llamacpp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    #[default]
    F16,
    F32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Hub name (`org/repo`) or a path to a checkpoint file.
    pub base_model: String,
    /// Volume holding the checkpoint cache.
    pub cache_volume: String,
    pub backend: BackendKind,
    pub precision: Precision,
    pub context_size: usize,
    pub gpu_layers: Option<usize>,
    pub bos_token_id: Option<u32>,
    /// File fetched by `genqueue pull`.
    pub checkpoint_file: Option<String>,
    pub revision: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskQueueConfig {
    pub outputs: Vec<String>,
    pub workers: usize,
    pub max_pending: usize,
    pub output_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: "openllama".into(),
            runtime: RuntimeConfig::default(),
            volumes: vec![VolumeConfig { name: "llama_weights".into(), path: PathBuf::from("./llama_weights") }],
            model: ModelConfig::default(),
            generation: GenerationConfig::default(),
            task_queue: TaskQueueConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self { cpu: 16, memory: "32Gi".into(), gpu: Some("A10G".into()) }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_model: "openlm-research/open_llama_7b".into(),
            cache_volume: "llama_weights".into(),
            backend: BackendKind::Llamacpp,
            precision: Precision::F16,
            context_size: 2048,
            gpu_layers: None,
            bos_token_id: Some(1),
            checkpoint_file: None,
            revision: "main".into(),
        }
    }
}

impl Default for TaskQueueConfig {
    fn default() -> Self {
        Self {
            outputs: vec!["output.txt".into()],
            workers: 1,
            max_pending: 64,
            output_dir: PathBuf::from("./outputs"),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind: "0.0.0.0:8080".into() }
    }
}

impl AppConfig {
    /// Reads the YAML file at `path` (or `$GENQUEUE_CONFIG`), falling back to
    /// defaults, then applies `GENQUEUE_*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.map(Path::to_path_buf).or_else(|| env::var_os(CONFIG_ENV).map(PathBuf::from));
        let mut cfg = match path {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        cfg.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| GenqueueError::Config(format!("reading {}: {e}", path.display())))?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).map_err(|e| GenqueueError::Config(e.to_string()))
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| GenqueueError::Config(e.to_string()))
    }

    fn apply_env(&mut self) {
        if let Ok(v) = env::var("GENQUEUE_MODEL") { self.model.base_model = v; }
        if let Ok(v) = env::var("GENQUEUE_CACHE_DIR") {
            let name = self.model.cache_volume.clone();
            match self.volumes.iter_mut().find(|vol| vol.name == name) {
                Some(vol) => vol.path = PathBuf::from(v),
                None => self.volumes.push(VolumeConfig { name, path: PathBuf::from(v) }),
            }
        }
        if let Ok(v) = env::var("GENQUEUE_OUTPUT_DIR") { self.task_queue.output_dir = PathBuf::from(v); }
        if let Ok(v) = env::var("GENQUEUE_BIND") { self.server.bind = v; }
        if let Ok(v) = env::var("GENQUEUE_BACKEND") {
            match v.to_ascii_lowercase().as_str() {
                "mock" => self.model.backend = BackendKind::Mock,
                "llamacpp" | "llama.cpp" => self.model.backend = BackendKind::Llamacpp,
                other => tracing::warn!("ignoring unknown GENQUEUE_BACKEND value {other:?}"),
            }
        }
        if let Some(v) = env::var("GENQUEUE_WORKERS").ok().and_then(|v| v.parse().ok()) { self.task_queue.workers = v; }
    }

    pub fn validate(&self) -> Result<()> {
        self.generation.validate()?;
        if self.task_queue.workers == 0 {
            return Err(GenqueueError::Config("task_queue.workers must be at least 1".into()));
        }
        if self.task_queue.max_pending == 0 {
            return Err(GenqueueError::Config("task_queue.max_pending must be at least 1".into()));
        }
        if self.task_queue.outputs.is_empty() {
            return Err(GenqueueError::Config("task_queue.outputs must name at least one file".into()));
        }
        for name in &self.task_queue.outputs {
            if !is_plain_file_name(name) {
                return Err(GenqueueError::Config(format!("output {name:?} must be a plain file name")));
            }
        }
        self.cache_dir()?;
        parse_memory(&self.runtime.memory)?;
        Ok(())
    }

    /// Directory of the volume the model cache lives on.
    pub fn cache_dir(&self) -> Result<&Path> {
        self.volumes
            .iter()
            .find(|v| v.name == self.model.cache_volume)
            .map(|v| v.path.as_path())
            .ok_or_else(|| GenqueueError::Config(format!("no volume named {:?}", self.model.cache_volume)))
    }

    /// The first declared output receives the generated text.
    pub fn primary_output(&self) -> &str {
        self.task_queue.outputs.first().map(String::as_str).unwrap_or("output.txt")
    }
}

pub fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
}

/// Parses a memory quantity such as `32Gi`, `512M` or `1048576` into bytes.
pub fn parse_memory(text: &str) -> Result<u64> {
    let text = text.trim();
    let split = text.find(|c: char| !c.is_ascii_digit()).unwrap_or(text.len());
    let (digits, suffix) = text.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| GenqueueError::Config(format!("invalid memory quantity {text:?}")))?;
    let multiplier: u64 = match suffix {
        "" => 1,
        "K" => 1_000,
        "M" => 1_000_000,
        "G" => 1_000_000_000,
        "T" => 1_000_000_000_000,
        "Ki" => 1 << 10,
        "Mi" => 1 << 20,
        "Gi" => 1 << 30,
        "Ti" => 1 << 40,
        _ => return Err(GenqueueError::Config(format!("unknown memory unit in {text:?}"))),
    };
    value
        .checked_mul(multiplier)
        .ok_or_else(|| GenqueueError::Config(format!("memory quantity {text:?} overflows")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_quantities() {
        assert_eq!(parse_memory("32Gi").unwrap(), 32 * 1024 * 1024 * 1024);
        assert_eq!(parse_memory("512M").unwrap(), 512_000_000);
        assert_eq!(parse_memory("1024").unwrap(), 1024);
        assert_eq!(parse_memory(" 2Ki ").unwrap(), 2048);
        assert!(parse_memory("Gi").is_err());
        assert!(parse_memory("12Xi").is_err());
        assert!(parse_memory("99999999999Ti").is_err());
    }

    #[test]
    fn defaults_describe_the_openllama_deployment() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.name, "openllama");
        assert_eq!(cfg.runtime.cpu, 16);
        assert_eq!(cfg.runtime.gpu.as_deref(), Some("A10G"));
        assert_eq!(cfg.cache_dir().unwrap(), Path::new("./llama_weights"));
        assert_eq!(cfg.primary_output(), "output.txt");
        assert_eq!(cfg.model.bos_token_id, Some(1));
        assert_eq!(cfg.model.backend, BackendKind::Llamacpp);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let cfg = AppConfig::from_yaml(
            "name: demo\ngeneration:\n  num_beams: 1\n  max_new_tokens: 16\ntask_queue:\n  workers: 2\n",
        )
        .unwrap();
        assert_eq!(cfg.name, "demo");
        assert_eq!(cfg.generation.num_beams, 1);
        assert_eq!(cfg.generation.top_k, 40);
        assert_eq!(cfg.task_queue.workers, 2);
        assert_eq!(cfg.task_queue.outputs, vec!["output.txt".to_string()]);
        assert_eq!(cfg.model.backend, BackendKind::Llamacpp);
    }

    #[test]
    fn rejects_unsafe_output_names_and_missing_volume() {
        let mut cfg = AppConfig::default();
        cfg.task_queue.outputs = vec!["../escape.txt".into()];
        assert!(matches!(cfg.validate(), Err(GenqueueError::Config(_))));

        let mut cfg = AppConfig::default();
        cfg.model.cache_volume = "missing".into();
        assert!(matches!(cfg.validate(), Err(GenqueueError::Config(_))));
    }

    #[test]
    fn shipped_llamacpp_config_is_valid() {
        let cfg = AppConfig::from_yaml(include_str!("../../../config/openllama.yaml")).unwrap();
        assert_eq!(cfg.model.backend, BackendKind::Llamacpp);
        assert_eq!(cfg.model.checkpoint_file.as_deref(), Some("open_llama_7b.gguf"));
        assert_eq!(cfg.generation, GenerationConfig::default());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn yaml_round_trip_preserves_backend_kind() {
        let mut cfg = AppConfig::default();
        cfg.model.backend = BackendKind::Mock;
        let text = cfg.to_yaml().unwrap();
        assert!(text.contains("backend: mock"));
        assert_eq!(AppConfig::from_yaml(&text).unwrap().model.backend, BackendKind::Mock);
    }
}
