//! Prompt Formatter: chat templates plus the language constraint blocks.

pub mod format;
pub mod language;
pub mod prompt_format;
pub mod prompting;

pub use format::FormattedPrompt;
pub use prompt_format::{PromptFormatter, select_template};
pub use prompting::ChatTemplate;
