#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};

use genqueue_backend::mock::MockBackend;
use genqueue_backend::{ForwardOutput, InferenceBackend, LoadParams, ModelHandle, SequenceState, SpecialTokens};
use genqueue_common::config::{AppConfig, BackendKind};
use genqueue_common::Result;

pub fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("genqueue-{name}-{:016x}", rand::random::<u64>()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

pub fn test_config(root: &Path) -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.model.backend = BackendKind::Mock;
    cfg.volumes[0].path = root.join("weights");
    cfg.task_queue.output_dir = root.join("outputs");
    cfg.generation.seed = Some(11);
    cfg
}

/// Mock backend that can demand a checkpoint and hold forward passes until
/// the gate opens.
pub struct TestBackend {
    inner: MockBackend,
    needs_checkpoint: bool,
    gate: Option<Arc<Gate>>,
}

#[derive(Default)]
pub struct Gate {
    open: Mutex<bool>,
    cv: Condvar,
}

impl Gate {
    pub fn open(&self) {
        *self.open.lock().unwrap() = true;
        self.cv.notify_all();
    }

    fn wait(&self) {
        let mut open = self.open.lock().unwrap();
        while !*open {
            open = self.cv.wait(open).unwrap();
        }
    }
}

impl TestBackend {
    pub fn needing_checkpoint() -> Self {
        Self { inner: MockBackend::new(), needs_checkpoint: true, gate: None }
    }

    pub fn gated(gate: Arc<Gate>) -> Self {
        Self { inner: MockBackend::new(), needs_checkpoint: false, gate: Some(gate) }
    }
}

impl InferenceBackend for TestBackend {
    fn name(&self) -> &'static str { "test" }
    fn needs_checkpoint(&self) -> bool { self.needs_checkpoint }
    fn load_model(&self, path: &Path, params: LoadParams) -> Result<ModelHandle> { self.inner.load_model(path, params) }
    /// Like a backend that holds one lock for loading and forward passes.
    fn is_loaded(&self) -> bool {
        if let Some(gate) = &self.gate {
            gate.wait();
        }
        self.inner.is_loaded()
    }
    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<u32>> { self.inner.tokenize(text, add_bos) }
    fn detokenize(&self, tokens: &[u32], skip_special: bool) -> Result<String> { self.inner.detokenize(tokens, skip_special) }
    fn forward(&self, sequences: &[SequenceState]) -> Result<ForwardOutput> {
        if let Some(gate) = &self.gate {
            gate.wait();
        }
        self.inner.forward(sequences)
    }
    fn special_tokens(&self) -> SpecialTokens { self.inner.special_tokens() }
    fn vocab_size(&self) -> usize { self.inner.vocab_size() }
}

/// Backend whose next-token distribution is looked up by the tokens
/// generated after a one-token prompt. Unlisted continuations end the
/// sequence.
pub struct TableBackend {
    rows: HashMap<Vec<u32>, Vec<(u32, f32)>>,
}

impl TableBackend {
    pub const EOS: u32 = 2;
    pub const VOCAB: usize = 6;
    /// Logit of tokens a row does not list.
    const FLOOR: f32 = -30.0;

    pub fn new() -> Self {
        Self { rows: HashMap::new() }
    }

    /// `probs` are the next-token probabilities after `generated`.
    pub fn row(mut self, generated: &[u32], probs: &[(u32, f32)]) -> Self {
        self.rows.insert(generated.to_vec(), probs.to_vec());
        self
    }
}

impl InferenceBackend for TableBackend {
    fn name(&self) -> &'static str { "table" }
    fn needs_checkpoint(&self) -> bool { false }
    fn load_model(&self, _path: &Path, params: LoadParams) -> Result<ModelHandle> {
        Ok(ModelHandle { name: "table".into(), vocab_size: Self::VOCAB, n_ctx: params.n_ctx })
    }
    fn is_loaded(&self) -> bool { true }
    fn tokenize(&self, _text: &str, add_bos: bool) -> Result<Vec<u32>> {
        Ok(if add_bos { vec![1] } else { Vec::new() })
    }
    fn detokenize(&self, tokens: &[u32], _skip_special: bool) -> Result<String> {
        Ok(tokens.iter().map(|t| t.to_string()).collect::<Vec<_>>().join(" "))
    }
    fn forward(&self, sequences: &[SequenceState]) -> Result<ForwardOutput> {
        let logits = sequences
            .iter()
            .map(|seq| {
                let mut row = vec![Self::FLOOR; Self::VOCAB];
                let generated = &seq.tokens[1..];
                match self.rows.get(generated) {
                    Some(probs) => {
                        for &(token, p) in probs {
                            row[token as usize] = p.ln();
                        }
                    }
                    None => row[Self::EOS as usize] = 0.0,
                }
                row
            })
            .collect();
        Ok(ForwardOutput { logits })
    }
    fn special_tokens(&self) -> SpecialTokens {
        SpecialTokens { bos: Some(1), eos: Some(Self::EOS), pad: None }
    }
    fn vocab_size(&self) -> usize { Self::VOCAB }
}
