//! Session configuration with `MICROLLM_*` environment overrides.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use microllm_abi::backend::PromptFlavor;
use microllm_abi::token::Token;

use crate::format::language::resolve_language;

const ENV_DEFAULT_LANGUAGE: &str = "MICROLLM_DEFAULT_LANGUAGE";
const ENV_PROMPT_FLAVOR: &str = "MICROLLM_PROMPT_FLAVOR";
const ENV_MAX_DECODE_TOKENS: &str = "MICROLLM_MAX_DECODE_TOKENS";
const ENV_PLUGIN_PATH: &str = "MICROLLM_PLUGIN_PATH";

pub const DEFAULT_LANGUAGE: &str = "English";

pub const DEFAULT_ISOLATED_SYSTEM_PROMPT: &str =
    "You are a helpful assistant. Follow the instructions exactly and reply with the result only.";

static DEFAULT_LANGUAGES: Lazy<Vec<String>> = Lazy::new(|| {
    [
        "English",
        "French",
        "Spanish",
        "German",
        "Italian",
        "Portuguese",
        "Dutch",
        "Polish",
        "Russian",
        "Ukrainian",
        "Turkish",
        "Arabic",
        "Hebrew",
        "Hindi",
        "Bengali",
        "Chinese",
        "Japanese",
        "Korean",
        "Vietnamese",
        "Thai",
        "Indonesian",
        "Swedish",
        "Greek",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Used when a requested language is empty or unknown.
    pub default_language: String,
    /// Recognised target languages; empty accepts anything non-blank.
    pub supported_languages: Vec<String>,
    /// System prompt for isolated generations that bring none.
    pub isolated_system_prompt: String,
    /// Forces a chat template; otherwise the model hint decides.
    pub prompt_flavor: Option<PromptFlavor>,
    /// Extra end-of-turn token ids on top of what the model reports.
    pub extra_terminator_tokens: Vec<i32>,
    /// Upper bound applied to every request's `max_tokens`.
    pub max_decode_tokens: Option<usize>,
    /// Native engine plugin library.
    pub plugin_path: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_language: DEFAULT_LANGUAGE.to_string(),
            supported_languages: DEFAULT_LANGUAGES.clone(),
            isolated_system_prompt: DEFAULT_ISOLATED_SYSTEM_PROMPT.to_string(),
            prompt_flavor: None,
            extra_terminator_tokens: Vec::new(),
            max_decode_tokens: None,
            plugin_path: None,
        }
    }
}

impl SessionConfig {
    /// Defaults overridden by `MICROLLM_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup (environment, settings store, ...).
    /// Unparseable values are ignored with a warning.
    pub fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(lang) = lookup(ENV_DEFAULT_LANGUAGE) {
            if !lang.trim().is_empty() {
                self.default_language = lang.trim().to_string();
            }
        }
        if let Some(flavor) = lookup(ENV_PROMPT_FLAVOR) {
            match flavor.parse::<PromptFlavor>() {
                Ok(f) => self.prompt_flavor = Some(f),
                Err(e) => tracing::warn!(%e, "ignoring {ENV_PROMPT_FLAVOR}"),
            }
        }
        if let Some(max) = lookup(ENV_MAX_DECODE_TOKENS) {
            match max.trim().parse::<usize>() {
                Ok(n) => self.max_decode_tokens = Some(n.max(1)),
                Err(e) => tracing::warn!(%e, value = %max, "ignoring {ENV_MAX_DECODE_TOKENS}"),
            }
        }
        if let Some(path) = lookup(ENV_PLUGIN_PATH) {
            self.plugin_path = Some(PathBuf::from(path));
        }
        self
    }

    /// Resolve a requested target language, falling back to `default_language`
    /// for blank or unrecognised names. Known names come back in canonical case.
    pub fn resolve_language(&self, requested: &str) -> String {
        resolve_language(&self.default_language, &self.supported_languages, requested)
    }

    pub(crate) fn extra_terminators(&self) -> impl Iterator<Item = Token> + '_ {
        self.extra_terminator_tokens.iter().copied().map(Token)
    }

    /// Clamp a request budget to the configured decode cap.
    pub(crate) fn step_limit(&self, max_tokens: usize) -> usize {
        match self.max_decode_tokens {
            Some(cap) => max_tokens.min(cap.max(1)),
            None => max_tokens,
        }
    }
}
