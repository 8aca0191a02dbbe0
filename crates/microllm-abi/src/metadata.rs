//! Engine-agnostic model metadata.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::backend::PromptFlavor;

/// Minimal, normalized view the session core expects from any engine after a load.
/// Engines can park extra info under `raw`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelCoreInfo {
    /// Display name if known (e.g., "Qwen2.5 0.5B Instruct").
    pub name: Option<String>,
    /// Family / architecture hint (e.g., "llama", "qwen2", "phi3", "gemma").
    pub family: Option<String>,

    /// Training context length if known.
    pub context_length: Option<u32>,

    pub eos_token_id: Option<i32>,
    pub bos_token_id: Option<i32>,

    /// Template-specific end tokens distinct from the generic EOS
    /// (e.g. `<|im_end|>`, `<|eot_id|>`, `<end_of_turn>`).
    pub terminator_token_ids: Vec<i32>,

    /// Native chat template string if provided by the model.
    pub chat_template: Option<String>,
    /// Hint for which prompt wrapper to use.
    pub prompt_flavor_hint: Option<PromptFlavor>,

    /// Anything else the engine scraped (simple flattened map).
    pub raw: HashMap<String, String>,
}

impl ModelCoreInfo {
    /// Guess a prompt flavor from the chat template text when no explicit hint exists.
    pub fn infer_flavor(&self) -> Option<PromptFlavor> {
        if self.prompt_flavor_hint.is_some() {
            return self.prompt_flavor_hint;
        }
        let tpl = self.chat_template.as_deref()?;
        if tpl.contains("<|im_start|>") {
            Some(PromptFlavor::ChatMl)
        } else if tpl.contains("<|start_header_id|>") {
            Some(PromptFlavor::Llama3)
        } else if tpl.contains("<|end|>") && tpl.contains("<|assistant|>") {
            Some(PromptFlavor::Phi3)
        } else if tpl.contains("<start_of_turn>") {
            Some(PromptFlavor::Gemma)
        } else {
            None
        }
    }
}
