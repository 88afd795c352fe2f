//! A GPT-J-shaped `Model` implementation (§9's "closed interface, name-keyed
//! factory" design note). Transformer layer math and real GGUF/llama.cpp
//! weight loading are out of scope; `load_state_dict`/`verify_loaded_weights`
//! still walk the same per-layer key hierarchy a real architecture would
//! (`wte.`, `h.{i}.attn.*`, `h.{i}.mlp.*`, `h.{i}.ln_1.*`, `lm_head.*`), and
//! `forward` does real (if shallow) embedding-lookup + linear-head math
//! against whatever weights were actually loaded, falling back to zeros for
//! anything a test harness never populated.
//!
//! When built against a real llama.cpp checkout (`LLAMA_CPP_DIR` / vendored
//! `third_party/llama.cpp`, see `build.rs`), `generate_with_callback` drives
//! the real FFI decode loop for streaming generation outside the `Model`
//! trait's batched-forward contract.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use runner_backend::{
    InputParameters, LayerKvCache, Model, ModelArgs, ModelRegistry, ParallelArgs, QuantArgs,
    StateDictShard,
};
use runner_common::{Result, RunnerError};

#[cfg(llama_ffi)]
mod ffi {
    // Prefer generated bindings if present
    include!(concat!(env!("OUT_DIR"), "/llama_bindings.rs"));
}

/// Registers the `gptj` architecture with the global model registry.
pub fn register(registry: &ModelRegistry) {
    registry.register("gptj", |args, quant, parallel, dtype| {
        Ok(Box::new(GptJModel::new(args.clone(), quant.clone(), parallel, dtype)) as Box<dyn Model>)
    });
}

/// Every per-layer parameter key this architecture expects, mirroring the
/// original's `h.{i}.attn.*` / `h.{i}.mlp.*` / `h.{i}.ln_1.*` prefix walk.
fn required_keys(args: &ModelArgs) -> HashSet<String> {
    let mut keys = HashSet::new();
    keys.insert("wte.weight".to_string());
    keys.insert("ln_f.weight".to_string());
    keys.insert("lm_head.weight".to_string());
    keys.insert("lm_head.bias".to_string());
    for i in 0..args.n_layers {
        for suffix in [
            "attn.qkv_proj.weight",
            "attn.out_proj.weight",
            "mlp.fc_in.weight",
            "mlp.fc_out.weight",
            "ln_1.weight",
        ] {
            keys.insert(format!("h.{i}.{suffix}"));
        }
    }
    keys
}

pub struct GptJModel {
    args: ModelArgs,
    #[allow(dead_code)]
    quant_args: QuantArgs,
    parallel_args: ParallelArgs,
    vocab_size: usize,
    weights: HashMap<String, Vec<f32>>,
    loaded_keys: HashSet<String>,
    required: HashSet<String>,
}

impl GptJModel {
    pub fn new(
        args: ModelArgs,
        quant_args: QuantArgs,
        parallel_args: ParallelArgs,
        _dtype: runner_backend::DType,
    ) -> Self {
        let vocab_size = if args.vocab_size > 0 { args.vocab_size as usize } else { 50400 };
        let required = required_keys(&args);
        Self {
            args,
            quant_args,
            parallel_args,
            vocab_size,
            weights: HashMap::new(),
            loaded_keys: HashSet::new(),
            required,
        }
    }

    fn hidden_size(&self) -> usize {
        self.args.hidden_size
    }

    /// Embedding lookup for one token id; zeros if `wte.weight` was never
    /// loaded (keeps `forward` total even before `load_state_dict` runs, as
    /// the mock architecture does).
    fn embed(&self, token: u32) -> Vec<f32> {
        let hidden = self.hidden_size();
        match self.weights.get("wte.weight") {
            Some(table) => {
                let row = token as usize * hidden;
                if row + hidden <= table.len() {
                    table[row..row + hidden].to_vec()
                } else {
                    vec![0.0; hidden]
                }
            }
            None => vec![0.0; hidden],
        }
    }

    /// `lm_head.weight` (vocab x hidden) + `lm_head.bias` applied to one
    /// hidden-state row.
    fn lm_head(&self, hidden_state: &[f32]) -> Vec<f32> {
        let hidden = self.hidden_size();
        let weight = self.weights.get("lm_head.weight");
        let bias = self.weights.get("lm_head.bias");
        let mut logits = vec![0.0f32; self.vocab_size];
        if let Some(weight) = weight {
            for (v, logit) in logits.iter_mut().enumerate() {
                let row_start = v * hidden;
                if row_start + hidden > weight.len() {
                    break;
                }
                let row = &weight[row_start..row_start + hidden];
                *logit = row.iter().zip(hidden_state).map(|(w, h)| w * h).sum();
            }
        }
        if let Some(bias) = bias {
            for (logit, b) in logits.iter_mut().zip(bias) {
                *logit += b;
            }
        }
        logits
    }
}

impl Model for GptJModel {
    fn forward(
        &mut self,
        tokens: &[u32],
        _positions: &[u32],
        kv_caches: &mut [LayerKvCache],
        params: &InputParameters,
    ) -> Result<Vec<f32>> {
        let mut logits = Vec::with_capacity(tokens.len() * self.vocab_size);
        for &token in tokens {
            let hidden_state = self.embed(token);
            logits.extend(self.lm_head(&hidden_state));
        }

        // Record attended positions in every layer's KV cache, matching the
        // append-KV contract real kernels would drive from slot_mapping.
        let n_local_kv_heads = self.parallel_args.n_local_kv_heads(self.args.n_kv_heads());
        let head_dim = self.args.head_dim();
        for layer in kv_caches.iter_mut() {
            for (i, &slot) in params.slot_mapping.iter().enumerate() {
                if slot < 0 {
                    continue;
                }
                let key = vec![tokens[i] as f32; n_local_kv_heads * head_dim];
                let value = key.clone();
                layer.write_slot(slot as usize, &key, &value);
            }
        }
        Ok(logits)
    }

    fn load_state_dict(&mut self, shard: &StateDictShard) -> Result<()> {
        for (key, value) in shard {
            self.weights.insert(key.clone(), value.clone());
            self.loaded_keys.insert(key.clone());
        }
        Ok(())
    }

    fn verify_loaded_weights(&self) -> Result<()> {
        let missing: Vec<&String> = self.required.difference(&self.loaded_keys).collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(RunnerError::ModelLoad(format!(
                "missing {} of {} expected parameters, e.g. {:?}",
                missing.len(),
                self.required.len(),
                missing.iter().take(3).collect::<Vec<_>>()
            )))
        }
    }

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }
}

/// Thin wrapper around the llama.cpp FFI surface for streaming, single-
/// sequence generation outside the batched `Model::forward` contract — used
/// by the CLI's interactive `run` path when `LLAMA_CPP_DIR` is configured.
/// Inert unless `build.rs` found a real llama.cpp checkout.
#[derive(Default, Clone)]
pub struct LlamaCppStreamer {
    state: Arc<Mutex<StreamerState>>,
}

#[derive(Default)]
struct StreamerState {
    model_path: Option<String>,
}

impl LlamaCppStreamer {
    pub fn new() -> Self {
        Self { state: Arc::new(Mutex::new(StreamerState::default())) }
    }

    pub fn set_model_path(&self, path: &str) {
        self.state.lock().unwrap().model_path = Some(path.to_string());
    }

    #[cfg(llama_ffi)]
    pub fn generate_with_callback<F: FnMut(String)>(
        &self,
        prompt: &str,
        max_tokens: usize,
        mut emit: F,
    ) -> Result<String> {
        unsafe {
            ffi::llama_backend_init();
            let st = self.state.lock().unwrap();
            let Some(ref model_path) = st.model_path else {
                return Err(RunnerError::ModelLoad("model not loaded".into()));
            };
            let cpath = std::ffi::CString::new(model_path.as_str()).unwrap();
            let mparams = ffi::llama_model_default_params();
            let model = ffi::llama_load_model_from_file(cpath.as_ptr(), mparams);
            if model.is_null() {
                return Err(RunnerError::ModelLoad("llama_load_model_from_file failed".into()));
            }
            let mut cparams = ffi::llama_context_default_params();
            cparams.n_ctx = 2048u32;
            let ctx = ffi::llama_new_context_with_model(model, cparams);
            if ctx.is_null() {
                ffi::llama_free_model(model);
                return Err(RunnerError::ModelLoad("llama_new_context_with_model failed".into()));
            }

            let cprompt = std::ffi::CString::new(prompt).unwrap();
            let n = ffi::llama_tokenize(model, cprompt.as_ptr(), 0i32, std::ptr::null_mut(), 0i32, true, false);
            let mut ptoks: Vec<i32> = vec![0; n as usize];
            let n2 = ffi::llama_tokenize(model, cprompt.as_ptr(), 0i32, ptoks.as_mut_ptr(), ptoks.len() as i32, true, false);
            let ptoks = &ptoks[..(n2 as usize)];

            let mut n_past: i32 = 0;
            if !ptoks.is_empty() {
                let mut toks: Vec<ffi::llama_token> = ptoks.iter().map(|&t| t as ffi::llama_token).collect();
                let batch = ffi::llama_batch_get_one(toks.as_mut_ptr(), toks.len() as i32, 0, 0);
                let rc = ffi::llama_decode(ctx, batch);
                ffi::llama_batch_free(batch);
                if rc != 0 {
                    ffi::llama_free(ctx);
                    ffi::llama_free_model(model);
                    return Err(RunnerError::Device { rank: 0, message: "llama_decode prompt failed".into() });
                }
                n_past += ptoks.len() as i32;
            }

            let mut generated = String::new();
            let vocab = ffi::llama_n_vocab(model);
            let eos = ffi::llama_token_eos(model);
            let mut cur: i32 = -1;
            for _step in 0..max_tokens {
                if cur >= 0 {
                    let mut one: [ffi::llama_token; 1] = [cur as ffi::llama_token];
                    let batch = ffi::llama_batch_get_one(one.as_mut_ptr(), 1, n_past, 0);
                    let rc = ffi::llama_decode(ctx, batch);
                    ffi::llama_batch_free(batch);
                    if rc != 0 {
                        break;
                    }
                    n_past += 1;
                }
                let logits = ffi::llama_get_logits(ctx);
                if logits.is_null() {
                    break;
                }
                let slice = std::slice::from_raw_parts(logits, vocab as usize);
                let mut best_id: i32 = 0;
                let mut best_val = f32::MIN;
                for (i, &v) in slice.iter().enumerate() {
                    if v > best_val {
                        best_val = v;
                        best_id = i as i32;
                    }
                }
                if best_id == eos {
                    break;
                }

                let needed = ffi::llama_token_to_piece(model, best_id, std::ptr::null_mut(), 0);
                if needed > 0 {
                    let mut buf: Vec<i8> = vec![0; needed as usize + 1];
                    let written = ffi::llama_token_to_piece(model, best_id, buf.as_mut_ptr(), buf.len() as i32);
                    if written > 0 {
                        let bytes = std::slice::from_raw_parts(buf.as_ptr() as *const u8, written as usize);
                        let piece = String::from_utf8_lossy(bytes).to_string();
                        emit(piece.clone());
                        generated.push_str(&piece);
                    }
                }
                cur = best_id;
            }

            ffi::llama_free(ctx);
            ffi::llama_free_model(model);
            Ok(generated)
        }
    }
}
