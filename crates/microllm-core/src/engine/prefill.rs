use microllm_abi::backend::NativeEngine;
use microllm_abi::token::Token;

use super::SessionEngine;
use crate::error::{DecodeStage, Result, SessionError};

impl<B: NativeEngine> SessionEngine<B> {
    pub(super) fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<Token>> {
        self.backend
            .tokenize(text, add_bos)
            .map_err(SessionError::Tokenize)
    }

    /// Fail without touching the cache if `extra` tokens do not fit behind `resident`.
    pub(super) fn check_budget(&self, resident: usize, extra: usize) -> Result<()> {
        let capacity = self.backend.context_size();
        let needed = resident + extra;
        if needed > capacity {
            tracing::warn!(needed, capacity, "context budget exceeded");
            return Err(SessionError::ContextOverflow { needed, capacity });
        }
        Ok(())
    }

    /// Decode `delta` behind the buffer and commit it; returns tokens decoded.
    ///
    /// A stale cache or an empty buffer is rebuilt from scratch first, so the
    /// cache ends up holding `buffer + delta` with a leading BOS. Otherwise
    /// only the delta is decoded, without BOS. Nothing is committed unless the
    /// decode succeeds; a failed decode marks the cache stale.
    pub(super) fn commit_delta(&mut self, delta: &str, stage: DecodeStage) -> Result<usize> {
        if self.state.needs_rebuild() {
            let rebuilding = !self.state.buffer.is_empty();
            let text = format!("{}{}", self.state.buffer, delta);
            let tokens = self.tokenize(&text, true)?;
            self.check_budget(0, tokens.len())?;

            if rebuilding {
                tracing::info!(
                    buffer_bytes = self.state.buffer.len(),
                    tokens = tokens.len(),
                    "rebuilding stale cache from conversation buffer"
                );
            }
            self.backend.clear_context();
            if let Err(reason) = self.backend.decode(&tokens) {
                self.state.mark_stale();
                let stage = if rebuilding { DecodeStage::Rebuild } else { stage };
                tracing::error!(%stage, %reason, "decode failed");
                return Err(SessionError::Decode { stage, reason });
            }
            self.state.replace(text, tokens.len());
            return Ok(tokens.len());
        }

        let tokens = self.tokenize(delta, false)?;
        self.check_budget(self.state.token_count, tokens.len())?;
        if let Err(reason) = self.backend.decode(&tokens) {
            // Native decode is batched; part of the delta may have landed.
            self.state.mark_stale();
            tracing::error!(%stage, %reason, "decode failed");
            return Err(SessionError::Decode { stage, reason });
        }
        self.state.commit(delta, tokens.len());
        tracing::debug!(tokens = tokens.len(), resident = self.state.token_count, "delta decoded");
        Ok(tokens.len())
    }
}
