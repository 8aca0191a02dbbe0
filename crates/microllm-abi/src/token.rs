use serde::{Deserialize, Serialize};

/// Wrapper for a model token (ID). Using a newtype avoids accidental
/// mixing with unrelated `i32`s and keeps conversions explicit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Token(pub i32);

// i32 matches llama.cpp's `llama_token` and what native engines hand across the C ABI.

impl From<i32> for Token {
    #[inline]
    fn from(value: i32) -> Self {
        Token(value)
    }
}

impl From<Token> for i32 {
    #[inline]
    fn from(token: Token) -> i32 {
        token.0
    }
}

/// Convert raw ids coming back from a native call.
#[inline]
pub fn tokens_from_raw(raw: &[i32]) -> Vec<Token> {
    raw.iter().copied().map(Token).collect()
}

/// Flatten tokens for a native call.
#[inline]
pub fn tokens_to_raw(tokens: &[Token]) -> Vec<i32> {
    tokens.iter().map(|t| t.0).collect()
}
