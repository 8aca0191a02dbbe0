use microllm_abi::backend::{Message, PromptFlavor, Role};

use crate::format::format::FormattedPrompt;
use crate::format::language::{preamble_text, reinforcement_text};
use crate::format::prompting::{
    ChatMlFormat, ChatTemplate, GemmaFormat, Llama3Format, Phi3Format, PlainFormat,
};

/// Factory: pick the chat template for a flavor.
pub fn select_template(flavor: PromptFlavor) -> Box<dyn ChatTemplate> {
    match flavor {
        PromptFlavor::ChatMl => Box::new(ChatMlFormat),
        PromptFlavor::Llama3 => Box::new(Llama3Format),
        PromptFlavor::Phi3 => Box::new(Phi3Format),
        PromptFlavor::Gemma => Box::new(GemmaFormat),
        PromptFlavor::Plain => Box::new(PlainFormat),
    }
}

/// Stateless renderer for every piece of text the session decodes.
pub struct PromptFormatter {
    flavor: PromptFlavor,
    template: Box<dyn ChatTemplate>,
}

impl Default for PromptFormatter {
    fn default() -> Self {
        Self::new(PromptFlavor::default())
    }
}

impl std::fmt::Debug for PromptFormatter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromptFormatter")
            .field("flavor", &self.flavor)
            .finish()
    }
}

impl PromptFormatter {
    pub fn new(flavor: PromptFlavor) -> Self {
        Self {
            flavor,
            template: select_template(flavor),
        }
    }

    #[inline]
    pub fn flavor(&self) -> PromptFlavor {
        self.flavor
    }

    #[inline]
    pub fn render(&self, role: Role, content: &str) -> String {
        self.template.segment(role, content)
    }

    /// Language constraint that opens a conversation.
    pub fn preamble(&self, language: &str) -> String {
        self.render(Role::System, &preamble_text(language))
    }

    /// Language constraint re-emitted after a history replay.
    pub fn reinforcement(&self, language: &str) -> String {
        self.render(Role::System, &reinforcement_text(language))
    }

    /// New user segment followed by the assistant opening marker.
    pub fn turn_delta(&self, user: &str) -> String {
        let mut out = self.render(Role::User, user);
        out.push_str(self.template.assistant_open());
        out
    }

    #[inline]
    pub fn assistant_close(&self) -> &'static str {
        self.template.assistant_close()
    }

    pub fn stop_sequences(&self) -> Vec<String> {
        self.template
            .stop_strings()
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    /// Full replacement text: preamble, non-empty history in order, reinforcement.
    pub fn conversation(&self, language: &str, messages: &[Message]) -> String {
        let mut out = self.preamble(language);
        for m in messages.iter().filter(|m| !m.content.is_empty()) {
            out.push_str(&self.render(m.role, &m.content));
        }
        out.push_str(&self.reinforcement(language));
        out
    }

    /// One-off prompt with no conversational history. Carries no stop
    /// strings; the caller's own set applies.
    pub fn isolated(&self, system_prompt: &str, prompt: &str) -> FormattedPrompt {
        let mut text = String::new();
        if !system_prompt.trim().is_empty() {
            text.push_str(&self.render(Role::System, system_prompt));
        }
        text.push_str(&self.turn_delta(prompt));
        FormattedPrompt::new(text)
    }
}
