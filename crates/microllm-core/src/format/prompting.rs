//! Chat templates: role segments and turn markers per model family.

use microllm_abi::backend::Role;

/// Renders role-delimited segments for one chat template.
pub trait ChatTemplate: Send + Sync {
    /// One complete segment, closing marker included.
    fn segment(&self, role: Role, content: &str) -> String;

    /// Marker that opens the assistant's reply.
    fn assistant_open(&self) -> &'static str;

    /// Marker that closes the assistant's reply.
    fn assistant_close(&self) -> &'static str;

    /// Strings that mean the model has started a new segment.
    fn stop_strings(&self) -> &'static [&'static str];
}

#[inline]
fn role_tag(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

/// `<|im_start|>role\n...<|im_end|>\n` (Qwen, SmolLM, many fine-tunes).
pub struct ChatMlFormat;

impl ChatTemplate for ChatMlFormat {
    fn segment(&self, role: Role, content: &str) -> String {
        format!("<|im_start|>{}\n{}<|im_end|>\n", role_tag(role), content)
    }
    fn assistant_open(&self) -> &'static str {
        "<|im_start|>assistant\n"
    }
    fn assistant_close(&self) -> &'static str {
        "<|im_end|>\n"
    }
    fn stop_strings(&self) -> &'static [&'static str] {
        &["<|im_end|>", "<|im_start|>"]
    }
}

/// Llama 3 header blocks.
pub struct Llama3Format;

impl ChatTemplate for Llama3Format {
    fn segment(&self, role: Role, content: &str) -> String {
        format!(
            "<|start_header_id|>{}<|end_header_id|>\n\n{}<|eot_id|>",
            role_tag(role),
            content
        )
    }
    fn assistant_open(&self) -> &'static str {
        "<|start_header_id|>assistant<|end_header_id|>\n\n"
    }
    fn assistant_close(&self) -> &'static str {
        "<|eot_id|>"
    }
    fn stop_strings(&self) -> &'static [&'static str] {
        &["<|eot_id|>", "<|start_header_id|>"]
    }
}

/// Phi-3 style.
pub struct Phi3Format;

impl ChatTemplate for Phi3Format {
    fn segment(&self, role: Role, content: &str) -> String {
        format!("<|{}|>\n{}<|end|>\n", role_tag(role), content)
    }
    fn assistant_open(&self) -> &'static str {
        "<|assistant|>\n"
    }
    fn assistant_close(&self) -> &'static str {
        "<|end|>\n"
    }
    fn stop_strings(&self) -> &'static [&'static str] {
        &["<|end|>", "<|user|>", "<|endoftext|>"]
    }
}

/// Gemma turns. There is no system role; system text goes in a user turn.
pub struct GemmaFormat;

impl ChatTemplate for GemmaFormat {
    fn segment(&self, role: Role, content: &str) -> String {
        let tag = match role {
            Role::System | Role::User => "user",
            Role::Assistant => "model",
        };
        format!("<start_of_turn>{tag}\n{content}<end_of_turn>\n")
    }
    fn assistant_open(&self) -> &'static str {
        "<start_of_turn>model\n"
    }
    fn assistant_close(&self) -> &'static str {
        "<end_of_turn>\n"
    }
    fn stop_strings(&self) -> &'static [&'static str] {
        &["<end_of_turn>", "<start_of_turn>"]
    }
}

/// Plain `Role: text` lines for base models without a template.
pub struct PlainFormat;

impl ChatTemplate for PlainFormat {
    fn segment(&self, role: Role, content: &str) -> String {
        let label = match role {
            Role::System => "System",
            Role::User => "User",
            Role::Assistant => "Assistant",
        };
        format!("{label}: {content}\n")
    }
    fn assistant_open(&self) -> &'static str {
        "Assistant:"
    }
    fn assistant_close(&self) -> &'static str {
        "\n"
    }
    fn stop_strings(&self) -> &'static [&'static str] {
        &["\nUser:", "\nSystem:"]
    }
}
