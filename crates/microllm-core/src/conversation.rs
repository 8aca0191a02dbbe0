//! Conversation State and the Pending-Conversation Queue.
//!
//! `buffer` is authoritative: it holds exactly the text decoded into the
//! engine's KV cache. When the cache is known to have drifted (partial decode,
//! failed restore, panic) `cache_stale` is raised and the next conversational
//! command rebuilds the cache from `buffer` before doing anything else.

use serde::{Deserialize, Serialize};

use microllm_abi::backend::Message;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationState {
    pub(crate) buffer: String,
    pub(crate) initialized: bool,
    pub(crate) language: String,
    pub(crate) cache_stale: bool,
    /// Tokens resident in the cache for `buffer`.
    pub(crate) token_count: usize,
}

impl ConversationState {
    pub fn new<S: Into<String>>(language: S) -> Self {
        Self {
            buffer: String::new(),
            initialized: false,
            language: language.into(),
            cache_stale: false,
            token_count: 0,
        }
    }

    #[inline]
    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    #[inline]
    pub fn language(&self) -> &str {
        &self.language
    }

    #[inline]
    pub fn is_cache_stale(&self) -> bool {
        self.cache_stale
    }

    #[inline]
    pub fn token_count(&self) -> usize {
        self.token_count
    }

    /// Drop the history but keep the target language.
    pub(crate) fn clear(&mut self) {
        self.buffer.clear();
        self.initialized = false;
        self.cache_stale = false;
        self.token_count = 0;
    }

    /// Record text whose tokens were just decoded behind the current buffer.
    pub(crate) fn commit(&mut self, text: &str, tokens: usize) {
        self.buffer.push_str(text);
        self.token_count += tokens;
    }

    /// Replace the whole buffer after a successful from-scratch decode.
    pub(crate) fn replace(&mut self, text: String, tokens: usize) {
        self.buffer = text;
        self.token_count = tokens;
        self.cache_stale = false;
    }

    #[inline]
    pub(crate) fn mark_stale(&mut self) {
        self.cache_stale = true;
    }

    #[inline]
    pub(crate) fn needs_rebuild(&self) -> bool {
        self.cache_stale || self.buffer.is_empty()
    }
}

/// Language/history requested while no model was loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingConversation {
    pub language: String,
    pub messages: Vec<Message>,
}

/// Everything an isolated generation must hand back untouched.
#[derive(Debug, Clone)]
pub(crate) struct Snapshot {
    pub(crate) state: ConversationState,
    pub(crate) pending: Option<PendingConversation>,
}

impl Snapshot {
    pub(crate) fn take(state: &ConversationState, pending: &Option<PendingConversation>) -> Self {
        Self {
            state: state.clone(),
            pending: pending.clone(),
        }
    }

    /// Whether the restored conversation needs its cache rebuilt.
    #[inline]
    pub(crate) fn has_cache(&self) -> bool {
        self.state.initialized && !self.state.buffer.is_empty()
    }
}

/// Read-only copy of the session's conversation, for hosts and tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationView {
    pub buffer: String,
    pub initialized: bool,
    pub language: String,
    pub cache_stale: bool,
    pub token_count: usize,
    pub pending: Option<PendingConversation>,
}

impl ConversationView {
    pub(crate) fn of(state: &ConversationState, pending: &Option<PendingConversation>) -> Self {
        Self {
            buffer: state.buffer.clone(),
            initialized: state.initialized,
            language: state.language.clone(),
            cache_stale: state.cache_stale,
            token_count: state.token_count,
            pending: pending.clone(),
        }
    }
}
