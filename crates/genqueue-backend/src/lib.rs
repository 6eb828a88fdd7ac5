use std::path::Path;

use genqueue_common::Result;

pub use genqueue_common::config::Precision;

#[derive(Debug, Clone)]
pub struct LoadParams {
    pub n_ctx: usize,
    pub gpu_layers: Option<usize>,
    /// Informational for GGUF checkpoints, whose tensor types are fixed in
    /// the file. Logged at load time.
    pub precision: Precision,
}

impl Default for LoadParams {
    fn default() -> Self {
        Self { n_ctx: 2048, gpu_layers: None, precision: Precision::F16 }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ModelHandle {
    pub name: String,
    pub vocab_size: usize,
    pub n_ctx: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpecialTokens {
    pub bos: Option<u32>,
    pub eos: Option<u32>,
    pub pad: Option<u32>,
}

impl SpecialTokens {
    /// Replaces the BOS id when `bos` is set; checkpoints with a wrong BOS in
    /// their tokenizer config get pinned this way.
    pub fn with_bos_override(mut self, bos: Option<u32>) -> Self {
        if bos.is_some() {
            self.bos = bos;
        }
        self
    }

    pub fn is_special(&self, token: u32) -> bool {
        [self.bos, self.eos, self.pad].contains(&Some(token))
    }
}

/// Full token context of one sequence; backends score its last position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SequenceState {
    pub tokens: Vec<u32>,
}

impl SequenceState {
    pub fn new(tokens: Vec<u32>) -> Self { Self { tokens } }
}

/// One row of next-token logits per input sequence, in input order.
#[derive(Debug, Clone, Default)]
pub struct ForwardOutput {
    pub logits: Vec<Vec<f32>>,
}

pub trait InferenceBackend: Send + Sync {
    fn name(&self) -> &'static str;
    /// Whether `load_model` needs a checkpoint file from the weights cache.
    fn needs_checkpoint(&self) -> bool { true }
    fn load_model(&self, path: &Path, params: LoadParams) -> Result<ModelHandle>;
    fn is_loaded(&self) -> bool;
    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<u32>>;
    fn detokenize(&self, tokens: &[u32], skip_special: bool) -> Result<String>;
    fn forward(&self, sequences: &[SequenceState]) -> Result<ForwardOutput>;
    fn special_tokens(&self) -> SpecialTokens;
    fn vocab_size(&self) -> usize;
}

#[cfg(feature = "mock")]
pub mod mock {
    use super::*;
    use genqueue_common::GenqueueError;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    pub const UNK: u32 = 0;
    pub const BOS: u32 = 1;
    pub const EOS: u32 = 2;
    const BYTE_OFFSET: u32 = 3;
    const VOCAB: usize = 256 + BYTE_OFFSET as usize;
    const SCRIPT_LOGIT: f32 = 8.0;

    pub const DEFAULT_SCRIPT: &str = "the laws of physics are the same for all observers.";

    /// Byte-level stand-in for a real checkpoint: it always continues the
    /// context with its script, then emits EOS.
    pub struct MockBackend {
        script: Vec<u32>,
        loaded: AtomicBool,
        forward_calls: AtomicUsize,
    }

    impl Default for MockBackend {
        fn default() -> Self { Self::new() }
    }

    impl MockBackend {
        pub fn new() -> Self { Self::with_script(DEFAULT_SCRIPT) }

        pub fn with_script(script: &str) -> Self {
            Self {
                script: encode_bytes(script),
                loaded: AtomicBool::new(false),
                forward_calls: AtomicUsize::new(0),
            }
        }

        pub fn forward_calls(&self) -> usize { self.forward_calls.load(Ordering::Relaxed) }

        /// Length of the longest script prefix the context ends with.
        fn progress(&self, tokens: &[u32]) -> usize {
            let max = self.script.len().min(tokens.len());
            (1..=max)
                .rev()
                .find(|&k| tokens.ends_with(&self.script[..k]))
                .unwrap_or(0)
        }
    }

    fn encode_bytes(text: &str) -> Vec<u32> {
        text.bytes().map(|b| b as u32 + BYTE_OFFSET).collect()
    }

    impl InferenceBackend for MockBackend {
        fn name(&self) -> &'static str { "mock" }

        fn needs_checkpoint(&self) -> bool { false }

        fn load_model(&self, path: &Path, params: LoadParams) -> Result<ModelHandle> {
            self.loaded.store(true, Ordering::Release);
            Ok(ModelHandle { name: path.display().to_string(), vocab_size: VOCAB, n_ctx: params.n_ctx })
        }

        fn is_loaded(&self) -> bool { self.loaded.load(Ordering::Acquire) }

        fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<u32>> {
            let mut tokens = Vec::with_capacity(text.len() + 1);
            if add_bos { tokens.push(BOS); }
            tokens.extend(encode_bytes(text));
            Ok(tokens)
        }

        fn detokenize(&self, tokens: &[u32], skip_special: bool) -> Result<String> {
            let mut bytes = Vec::with_capacity(tokens.len());
            for &t in tokens {
                match t {
                    t if t >= BYTE_OFFSET && (t as usize) < VOCAB => bytes.push((t - BYTE_OFFSET) as u8),
                    _ if skip_special => {}
                    UNK => bytes.extend_from_slice(b"<unk>"),
                    BOS => bytes.extend_from_slice(b"<s>"),
                    EOS => bytes.extend_from_slice(b"</s>"),
                    other => return Err(GenqueueError::Backend(format!("token {other} outside vocabulary"))),
                }
            }
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        }

        fn forward(&self, sequences: &[SequenceState]) -> Result<ForwardOutput> {
            self.forward_calls.fetch_add(1, Ordering::Relaxed);
            let logits = sequences
                .iter()
                .map(|seq| {
                    let mut row = vec![0.0_f32; VOCAB];
                    let k = self.progress(&seq.tokens);
                    let next = self.script.get(k).copied().unwrap_or(EOS);
                    row[next as usize] = SCRIPT_LOGIT;
                    row
                })
                .collect();
            Ok(ForwardOutput { logits })
        }

        fn special_tokens(&self) -> SpecialTokens {
            SpecialTokens { bos: Some(BOS), eos: Some(EOS), pad: Some(UNK) }
        }

        fn vocab_size(&self) -> usize { VOCAB }
    }

}
