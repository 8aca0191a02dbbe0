//! Session engine: conversation bookkeeping around one native engine.
//!
//! `SessionEngine` is synchronous and single-owner. The worker lane in
//! `crate::worker` owns one and feeds it commands in FIFO order; it can also
//! be driven directly from a single thread.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

use microllm_abi::backend::NativeEngine;
use microllm_abi::sampling::SamplingParams;
use microllm_abi::token::Token;

use crate::config::SessionConfig;
use crate::conversation::{ConversationState, ConversationView, PendingConversation};
use crate::error::{Result, SessionError};
use crate::format::PromptFormatter;
use crate::worker::stop::StopSignal;

// Child modules hold the handlers as `impl SessionEngine<B>` blocks.
mod decode;
mod isolated;
mod lifecycle;
mod prefill;
mod turn;
mod utils;

pub const DEFAULT_MAX_TOKENS: usize = 256;

/// One generation request, conversational or isolated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    pub max_tokens: usize,
    pub sampling: SamplingParams,
    /// Extra stop strings on top of the chat template's own.
    pub stop_sequences: Vec<String>,
    /// Run against a fresh context and leave the conversation untouched.
    pub isolated: bool,
    /// System prompt for isolated runs; `None` uses the configured default.
    pub system_prompt: Option<String>,
}

impl GenerationRequest {
    pub fn new<S: Into<String>>(prompt: S) -> Self {
        Self {
            prompt: prompt.into(),
            max_tokens: DEFAULT_MAX_TOKENS,
            sampling: SamplingParams::default(),
            stop_sequences: Vec::new(),
            isolated: false,
            system_prompt: None,
        }
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.max_tokens = n;
        self
    }

    pub fn sampling(mut self, params: SamplingParams) -> Self {
        self.sampling = params;
        self
    }

    pub fn stop_sequences<I, S>(mut self, stops: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stop_sequences = stops.into_iter().map(Into::into).collect();
        self
    }

    pub fn isolated(mut self, system_prompt: Option<String>) -> Self {
        self.isolated = true;
        self.system_prompt = system_prompt;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.max_tokens == 0 {
            return Err(SessionError::InvalidRequest(
                "max_tokens must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Why the generation loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    EndOfSequence,
    Terminator,
    StopSequence,
    MaxTokens,
    ContextFull,
    DecodeFailed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationResult {
    pub text: String,
    /// Tokens sampled and kept (terminators excluded).
    pub token_count: usize,
    /// Tokens decoded before the first sample.
    pub prompt_token_count: usize,
    pub finish: FinishReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationOutcome {
    /// Deferred until a model is loaded.
    pub pending: bool,
    pub prompt_token_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadOutcome {
    pub context_size: usize,
    pub load_time_ms: u64,
    pub file_size_bytes: u64,
    /// Result of replaying a conversation requested before the load.
    pub replayed_conversation: Option<ConversationOutcome>,
}

/// Session = {native engine} + {prompt formatter} + {conversation state}.
pub struct SessionEngine<B: NativeEngine> {
    backend: B,
    config: SessionConfig,
    formatter: PromptFormatter,
    terminators: HashSet<Token>,
    state: ConversationState,
    pending: Option<PendingConversation>,
    loaded: Arc<AtomicBool>,
}

impl<B: NativeEngine> SessionEngine<B> {
    pub fn new(backend: B, config: SessionConfig) -> Self {
        let language = config.resolve_language("");
        let flavor = config.prompt_flavor.unwrap_or_default();
        let loaded = Arc::new(AtomicBool::new(backend.is_loaded()));
        Self {
            backend,
            formatter: PromptFormatter::new(flavor),
            config,
            terminators: HashSet::new(),
            state: ConversationState::new(language),
            pending: None,
            loaded,
        }
    }

    /// Flag mirroring `is_model_loaded`, readable from any thread.
    pub fn loaded_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.loaded)
    }

    #[inline]
    pub fn is_model_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    #[inline]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    #[inline]
    pub fn formatter(&self) -> &PromptFormatter {
        &self.formatter
    }

    #[inline]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn conversation(&self) -> ConversationView {
        ConversationView::of(&self.state, &self.pending)
    }

    /// Run one request; `request.isolated` picks the path.
    pub fn generate(
        &mut self,
        request: &GenerationRequest,
        stop: &StopSignal,
    ) -> Result<GenerationResult> {
        if request.isolated {
            self.generate_isolated(request, stop)
        } else {
            self.converse(request, stop)
        }
    }

    /// Called by the worker when a command panicked part-way.
    pub(crate) fn poison_cache(&mut self) {
        self.state.mark_stale();
        self.publish_loaded();
    }

    #[inline]
    fn publish_loaded(&self) {
        self.loaded.store(self.backend.is_loaded(), Ordering::Release);
    }

    #[inline]
    fn require_loaded(&self) -> Result<()> {
        if self.backend.is_loaded() {
            Ok(())
        } else {
            Err(SessionError::NotLoaded)
        }
    }

    #[inline]
    fn is_terminator(&self, token: Token) -> bool {
        self.terminators.contains(&token)
    }
}
