//! One generation job: make sure the model is loaded, decode, write outputs.
//!
//! Everything here blocks; the queue calls it from `spawn_blocking`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use genqueue_backend::{InferenceBackend, LoadParams};
use genqueue_common::config::{AppConfig, ModelConfig};
use genqueue_common::generation::GenerationConfig;
use genqueue_common::{GenqueueError, Result};
use genqueue_obs::metrics;

use crate::checkpoint;
use crate::decode::{generate_text, GeneratedText};
use crate::output::OutputSink;
use crate::sampler::rng_from_seed;

#[derive(Debug, Clone, PartialEq)]
pub struct JobOutcome {
    pub text: String,
    pub outputs: Vec<String>,
    pub new_tokens: usize,
}

pub struct Worker {
    backend: Arc<dyn InferenceBackend>,
    model: ModelConfig,
    cache_dir: PathBuf,
    generation: GenerationConfig,
    sink: OutputSink,
    primary_output: String,
    /// Serializes the first load.
    load_lock: Mutex<()>,
    ready: AtomicBool,
}

impl Worker {
    pub fn new(backend: Arc<dyn InferenceBackend>, cfg: &AppConfig) -> Result<Self> {
        cfg.generation.validate()?;
        Ok(Self {
            backend,
            model: cfg.model.clone(),
            cache_dir: cfg.cache_dir()?.to_path_buf(),
            generation: cfg.generation.clone(),
            sink: OutputSink::new(cfg.task_queue.output_dir.clone(), cfg.task_queue.outputs.clone()),
            primary_output: cfg.primary_output().to_string(),
            load_lock: Mutex::new(()),
            ready: AtomicBool::new(false),
        })
    }

    pub fn sink(&self) -> &OutputSink { &self.sink }

    /// Never touches the backend, so it is safe to call while a forward
    /// pass holds it.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Loads the checkpoint on first use; later calls are no-ops.
    pub fn ensure_loaded(&self) -> Result<()> {
        if self.is_ready() {
            return Ok(());
        }
        let _guard = self.load_lock.lock().map_err(|_| GenqueueError::Message("model load lock poisoned".into()))?;
        if self.is_ready() {
            return Ok(());
        }
        let pinned = self
            .model
            .checkpoint_file
            .as_deref()
            .map(|file| checkpoint::download_target(&self.cache_dir, &self.model.base_model, file))
            .filter(|p| p.is_file());
        let path = if let Some(pinned) = pinned {
            pinned
        } else if self.backend.needs_checkpoint() {
            checkpoint::resolve(&self.model.base_model, &self.cache_dir)?
        } else {
            PathBuf::from(&self.model.base_model)
        };
        let params = LoadParams {
            n_ctx: self.model.context_size,
            gpu_layers: self.model.gpu_layers,
            precision: self.model.precision,
        };
        let start = Instant::now();
        let loaded = self.backend.load_model(&path, params)?;
        metrics::MODEL_LOAD_SECONDS.observe(start.elapsed().as_secs_f64());
        tracing::info!(
            target: "queue",
            "{} backend loaded {} (vocab {}) in {:.2}s",
            self.backend.name(),
            loaded.name,
            loaded.vocab_size,
            start.elapsed().as_secs_f64()
        );
        self.ready.store(true, Ordering::Release);
        Ok(())
    }

    pub fn generate(&self, prompt: &str) -> Result<GeneratedText> {
        self.ensure_loaded()?;
        let mut rng = rng_from_seed(self.generation.seed);
        let start = Instant::now();
        let out = generate_text(self.backend.as_ref(), prompt, &self.generation, self.model.bos_token_id, &mut rng)?;
        metrics::GENERATION_SECONDS.observe(start.elapsed().as_secs_f64());
        metrics::TOKENS_GENERATED.inc_by(out.new_tokens as u64);
        Ok(out)
    }

    /// Generates for `prompt` and writes the text to the primary output.
    pub fn run_task(&self, task_id: &str, prompt: &str) -> Result<JobOutcome> {
        let out = self.generate(prompt)?;
        tracing::info!(target: "queue", task_id, new_tokens = out.new_tokens, "{}", out.text);
        let path = self.sink.write(task_id, &self.primary_output, &out.text)?;
        tracing::debug!(target: "queue", task_id, "wrote {}", path.display());
        Ok(JobOutcome { text: out.text, outputs: vec![self.primary_output.clone()], new_tokens: out.new_tokens })
    }
}
