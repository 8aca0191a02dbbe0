use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

use crate::metadata::ModelCoreInfo;
use crate::sampling::SamplingParams;
use crate::token::Token;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptFlavor {
    #[default]
    ChatMl,
    Llama3,
    Phi3,
    Gemma,
    Plain,
}

impl FromStr for PromptFlavor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "chatml" | "qwen" => Ok(Self::ChatMl),
            "llama3" | "llama-3" => Ok(Self::Llama3),
            "phi3" | "phi-3" | "phi" => Ok(Self::Phi3),
            "gemma" => Ok(Self::Gemma),
            "plain" => Ok(Self::Plain),
            other => Err(format!("unknown prompt flavor: {other}")),
        }
    }
}

/// One stored chat message, as supplied by the caller's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    #[inline]
    pub fn system<S: Into<String>>(s: S) -> Self {
        Self {
            role: Role::System,
            content: s.into(),
        }
    }
    #[inline]
    pub fn user<S: Into<String>>(s: S) -> Self {
        Self {
            role: Role::User,
            content: s.into(),
        }
    }
    #[inline]
    pub fn assistant<S: Into<String>>(s: S) -> Self {
        Self {
            role: Role::Assistant,
            content: s.into(),
        }
    }
}

/// Context/threading parameters for `NativeEngine::load_model`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadParams {
    pub context_size: u32,
    pub threads: u32,
}

impl Default for LoadParams {
    fn default() -> Self {
        Self {
            context_size: 2048,
            threads: 4,
        }
    }
}

/// Narrow, synchronous contract over a native inference engine.
///
/// One implementor owns one set of model weights and one KV cache. None of
/// these calls are reentrant; the session core serializes every call.
pub trait NativeEngine {
    /// Load weights and create a fresh context, replacing any loaded model.
    fn load_model(&mut self, model_path: &Path, params: &LoadParams) -> Result<(), String>;

    /// Free the context and weights. Unloading with nothing loaded is a no-op.
    fn unload_model(&mut self) -> Result<(), String>;

    fn is_loaded(&self) -> bool;

    /// Active context window (n_ctx); 0 when nothing is loaded.
    fn context_size(&self) -> usize;

    /// Metadata scraped from the loaded model (terminators, template hints).
    fn model_info(&self) -> ModelCoreInfo {
        ModelCoreInfo::default()
    }

    /// Tokenize with special-token parsing; `add_bos` prepends the BOS marker.
    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<Token>, String>;

    /// Append `tokens` to the KV cache at the current position.
    /// A failure may leave the cache partially advanced.
    fn decode(&mut self, tokens: &[Token]) -> Result<(), String>;

    /// Sample the next token from the logits of the last decoded token.
    fn sample(&mut self) -> Result<Token, String>;

    /// Raw bytes of one token piece (may be a partial UTF-8 sequence).
    fn token_to_piece(&self, token: Token) -> Result<Vec<u8>, String>;

    /// Model's generic end-of-sequence token.
    fn eos_token(&self) -> Token;

    /// Rebuild the sampler chain from `params.normalized()`.
    fn reset_sampler(&mut self, params: &SamplingParams);

    /// Drop every cached token while keeping the model loaded.
    fn clear_context(&mut self);
}

impl<E: NativeEngine + ?Sized> NativeEngine for Box<E> {
    fn load_model(&mut self, model_path: &Path, params: &LoadParams) -> Result<(), String> {
        (**self).load_model(model_path, params)
    }
    fn unload_model(&mut self) -> Result<(), String> {
        (**self).unload_model()
    }
    fn is_loaded(&self) -> bool {
        (**self).is_loaded()
    }
    fn context_size(&self) -> usize {
        (**self).context_size()
    }
    fn model_info(&self) -> ModelCoreInfo {
        (**self).model_info()
    }
    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<Token>, String> {
        (**self).tokenize(text, add_bos)
    }
    fn decode(&mut self, tokens: &[Token]) -> Result<(), String> {
        (**self).decode(tokens)
    }
    fn sample(&mut self) -> Result<Token, String> {
        (**self).sample()
    }
    fn token_to_piece(&self, token: Token) -> Result<Vec<u8>, String> {
        (**self).token_to_piece(token)
    }
    fn eos_token(&self) -> Token {
        (**self).eos_token()
    }
    fn reset_sampler(&mut self, params: &SamplingParams) {
        (**self).reset_sampler(params)
    }
    fn clear_context(&mut self) {
        (**self).clear_context()
    }
}
