//! MicroLLM session core.
//!
//! Keeps a conversation text buffer and a native engine's KV cache in lockstep
//! across incremental chat turns, full history replacement, model reloads and
//! isolated one-off generations.

pub mod config;
pub mod conversation;
pub mod engine;
pub mod error;
pub mod format;
pub mod plugin;
pub mod utils;
pub mod worker;

pub use config::SessionConfig;
pub use conversation::{ConversationState, ConversationView, PendingConversation};
pub use engine::{
    ConversationOutcome, FinishReason, GenerationRequest, GenerationResult, LoadOutcome,
    SessionEngine,
};
pub use error::{DecodeStage, Result, SessionError};
pub use format::{FormattedPrompt, PromptFormatter};
pub use plugin::PluginEngine;
pub use worker::SessionHandle;
pub use worker::stop::{CancelRegistry, StopSignal};

pub use microllm_abi::{Message, NativeEngine, PromptFlavor, Role, SamplingParams, Token};
