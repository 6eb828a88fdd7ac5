//! llama.cpp backend for GGUF checkpoints.
//!
//! FFI is only compiled when `build.rs` finds `llama.h` (via `LLAMA_CPP_DIR`
//! or `third_party/llama.cpp`); otherwise every call reports a backend error.

use genqueue_backend::{ForwardOutput, InferenceBackend, LoadParams, ModelHandle, SequenceState, SpecialTokens};
use genqueue_common::{GenqueueError, Result};
use std::path::Path;
use std::sync::Mutex;

#[cfg(llama_ffi)]
#[allow(non_upper_case_globals, non_camel_case_types, non_snake_case, dead_code)]
mod ffi {
    include!(concat!(env!("OUT_DIR"), "/llama_bindings.rs"));
}

#[derive(Default)]
pub struct LlamaCppBackend {
    state: Mutex<Option<Loaded>>,
}

#[cfg(llama_ffi)]
struct Loaded {
    model: *mut ffi::llama_model,
    ctx: *mut ffi::llama_context,
    n_vocab: usize,
    n_ctx: usize,
    special: SpecialTokens,
}

// The raw handles are only touched while holding the backend mutex.
#[cfg(llama_ffi)]
unsafe impl Send for Loaded {}

#[cfg(llama_ffi)]
impl Drop for Loaded {
    fn drop(&mut self) {
        unsafe {
            ffi::llama_free(self.ctx);
            ffi::llama_free_model(self.model);
        }
    }
}

#[cfg(not(llama_ffi))]
#[allow(dead_code)]
struct Loaded {
    n_vocab: usize,
    special: SpecialTokens,
}

fn not_loaded() -> GenqueueError {
    GenqueueError::Backend("llama.cpp model not loaded".into())
}

impl LlamaCppBackend {
    pub fn new() -> Self { Self::default() }

    pub fn ffi_enabled() -> bool { cfg!(llama_ffi) }

    fn with_loaded<T>(&self, f: impl FnOnce(&mut Loaded) -> Result<T>) -> Result<T> {
        let mut guard = self
            .state
            .lock()
            .map_err(|_| GenqueueError::Backend("llama.cpp state poisoned".into()))?;
        let loaded = guard.as_mut().ok_or_else(not_loaded)?;
        f(loaded)
    }
}

#[cfg(llama_ffi)]
impl Loaded {
    fn open(path: &Path, params: &LoadParams) -> Result<Self> {
        use std::ffi::CString;
        let cpath = CString::new(path.to_string_lossy().as_bytes())
            .map_err(|_| GenqueueError::Checkpoint(format!("path {} contains a NUL byte", path.display())))?;
        unsafe {
            ffi::llama_backend_init();
            let mut mparams = ffi::llama_model_default_params();
            if let Some(layers) = params.gpu_layers {
                mparams.n_gpu_layers = layers as i32;
            }
            let model = ffi::llama_load_model_from_file(cpath.as_ptr(), mparams);
            if model.is_null() {
                return Err(GenqueueError::Checkpoint(format!("llama.cpp could not load {}", path.display())));
            }
            let mut cparams = ffi::llama_context_default_params();
            cparams.n_ctx = params.n_ctx as u32;
            cparams.n_batch = params.n_ctx as u32;
            let ctx = ffi::llama_new_context_with_model(model, cparams);
            if ctx.is_null() {
                ffi::llama_free_model(model);
                return Err(GenqueueError::Backend("llama_new_context_with_model failed".into()));
            }
            let special = SpecialTokens {
                bos: Some(ffi::llama_token_bos(model) as u32),
                eos: Some(ffi::llama_token_eos(model) as u32),
                pad: None,
            };
            Ok(Self { model, ctx, n_vocab: ffi::llama_n_vocab(model) as usize, n_ctx: params.n_ctx, special })
        }
    }

    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<u32>> {
        let bytes = text.as_bytes();
        let mut buf: Vec<ffi::llama_token> = vec![0; bytes.len() + 2];
        let mut n = unsafe {
            ffi::llama_tokenize(self.model, bytes.as_ptr().cast(), bytes.len() as i32, buf.as_mut_ptr(), buf.len() as i32, add_bos, false)
        };
        if n < 0 {
            buf.resize((-n) as usize, 0);
            n = unsafe {
                ffi::llama_tokenize(self.model, bytes.as_ptr().cast(), bytes.len() as i32, buf.as_mut_ptr(), buf.len() as i32, add_bos, false)
            };
        }
        if n < 0 {
            return Err(GenqueueError::Backend("llama_tokenize failed".into()));
        }
        buf.truncate(n as usize);
        Ok(buf.into_iter().map(|t| t as u32).collect())
    }

    fn piece(&self, token: u32) -> Vec<u8> {
        let mut buf: Vec<std::ffi::c_char> = vec![0; 32];
        let mut n = unsafe { ffi::llama_token_to_piece(self.model, token as ffi::llama_token, buf.as_mut_ptr(), buf.len() as i32) };
        if n < 0 {
            buf.resize((-n) as usize, 0);
            n = unsafe { ffi::llama_token_to_piece(self.model, token as ffi::llama_token, buf.as_mut_ptr(), buf.len() as i32) };
        }
        buf.truncate(n.max(0) as usize);
        buf.into_iter().map(|b| b as u8).collect()
    }

    /// Scores the last position of `tokens`. The KV cache is cleared first,
    /// so every sequence is evaluated from scratch.
    fn last_logits(&mut self, tokens: &[u32]) -> Result<Vec<f32>> {
        if tokens.is_empty() {
            return Err(GenqueueError::Backend("cannot evaluate an empty sequence".into()));
        }
        if tokens.len() > self.n_ctx {
            return Err(GenqueueError::Backend(format!(
                "sequence of {} tokens exceeds context size {}",
                tokens.len(),
                self.n_ctx
            )));
        }
        let mut toks: Vec<ffi::llama_token> = tokens.iter().map(|&t| t as ffi::llama_token).collect();
        unsafe {
            ffi::llama_kv_cache_clear(self.ctx);
            let batch = ffi::llama_batch_get_one(toks.as_mut_ptr(), toks.len() as i32, 0, 0);
            if ffi::llama_decode(self.ctx, batch) != 0 {
                return Err(GenqueueError::Backend("llama_decode failed".into()));
            }
            let logits = ffi::llama_get_logits_ith(self.ctx, toks.len() as i32 - 1);
            if logits.is_null() {
                return Err(GenqueueError::Backend("llama.cpp returned no logits".into()));
            }
            Ok(std::slice::from_raw_parts(logits, self.n_vocab).to_vec())
        }
    }
}

impl InferenceBackend for LlamaCppBackend {
    fn name(&self) -> &'static str { "llamacpp" }

    fn load_model(&self, path: &Path, params: LoadParams) -> Result<ModelHandle> {
        #[cfg(llama_ffi)]
        {
            tracing::info!(target: "backend", "loading {} (n_ctx={}, precision={:?})", path.display(), params.n_ctx, params.precision);
            let loaded = Loaded::open(path, &params)?;
            let handle = ModelHandle { name: path.display().to_string(), vocab_size: loaded.n_vocab, n_ctx: loaded.n_ctx };
            let mut guard = self
                .state
                .lock()
                .map_err(|_| GenqueueError::Backend("llama.cpp state poisoned".into()))?;
            *guard = Some(loaded);
            return Ok(handle);
        }
        #[cfg(not(llama_ffi))]
        {
            let _ = params;
            Err(GenqueueError::Backend(format!(
                "cannot load {}: built without llama.cpp (set LLAMA_CPP_DIR and rebuild)",
                path.display()
            )))
        }
    }

    fn is_loaded(&self) -> bool {
        self.state.lock().map(|g| g.is_some()).unwrap_or(false)
    }

    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<u32>> {
        #[cfg(llama_ffi)]
        return self.with_loaded(|l| l.tokenize(text, add_bos));
        #[cfg(not(llama_ffi))]
        {
            let _ = (text, add_bos);
            self.with_loaded(|_| Err(not_loaded()))
        }
    }

    fn detokenize(&self, tokens: &[u32], skip_special: bool) -> Result<String> {
        #[cfg(llama_ffi)]
        return self.with_loaded(|l| {
            let mut bytes = Vec::new();
            for &t in tokens {
                if skip_special && l.special.is_special(t) {
                    continue;
                }
                bytes.extend(l.piece(t));
            }
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        });
        #[cfg(not(llama_ffi))]
        {
            let _ = (tokens, skip_special);
            self.with_loaded(|_| Err(not_loaded()))
        }
    }

    fn forward(&self, sequences: &[SequenceState]) -> Result<ForwardOutput> {
        #[cfg(llama_ffi)]
        return self.with_loaded(|l| {
            let logits = sequences.iter().map(|s| l.last_logits(&s.tokens)).collect::<Result<Vec<_>>>()?;
            Ok(ForwardOutput { logits })
        });
        #[cfg(not(llama_ffi))]
        {
            let _ = sequences;
            self.with_loaded(|_| Err(not_loaded()))
        }
    }

    fn special_tokens(&self) -> SpecialTokens {
        self.with_loaded(|l| Ok(l.special)).unwrap_or_default()
    }

    fn vocab_size(&self) -> usize {
        self.with_loaded(|l| Ok(l.n_vocab)).unwrap_or(0)
    }
}
