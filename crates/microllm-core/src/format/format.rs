//! Rendered prompt carrier passed from the formatter to the generation loop.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormattedPrompt {
    pub text: String,
    /// Textual stop sentinels the generation loop enforces on its output.
    pub stop_sequences: Vec<String>,
    /// Whether the text starts a fresh sequence (BOS) or extends the cache.
    pub add_bos: bool,
}

impl FormattedPrompt {
    pub fn new<T: Into<String>>(text: T) -> Self {
        Self {
            text: text.into(),
            stop_sequences: Vec::new(),
            add_bos: true,
        }
    }

    /// Append stop strings, skipping empties and duplicates.
    pub fn with_stops<I, S>(mut self, stops: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for s in stops {
            let s = s.into();
            if !s.is_empty() && !self.stop_sequences.contains(&s) {
                self.stop_sequences.push(s);
            }
        }
        self
    }
}
