use microllm_abi::backend::NativeEngine;

use super::decode::Generated;
use super::{FinishReason, GenerationRequest, GenerationResult, SessionEngine};
use crate::error::{DecodeStage, Result, SessionError};
use crate::worker::stop::StopSignal;

impl<B: NativeEngine> SessionEngine<B> {
    /// One incremental chat turn against the running conversation.
    pub fn converse(
        &mut self,
        request: &GenerationRequest,
        stop: &StopSignal,
    ) -> Result<GenerationResult> {
        request.validate()?;
        self.require_loaded()?;
        if stop.is_cancelled() {
            return Err(SessionError::Cancelled);
        }

        let initializing = !self.state.initialized;
        let mut delta = String::new();
        if initializing {
            self.state.clear();
            delta.push_str(&self.formatter.preamble(&self.state.language));
        }
        delta.push_str(&self.formatter.turn_delta(&request.prompt));

        let prompt_token_count = self.commit_delta(&delta, DecodeStage::Delta)?;
        if initializing {
            self.state.initialized = true;
            tracing::info!(language = %self.state.language, "conversation initialized");
        }

        self.backend.reset_sampler(&request.sampling);
        let mut stops = self.formatter.stop_sequences();
        for s in &request.stop_sequences {
            if !s.is_empty() && !stops.contains(s) {
                stops.push(s.clone());
            }
        }
        let step_limit = self.config.step_limit(request.max_tokens);
        let generated = self.run_generation(&stops, self.state.token_count, step_limit, stop);

        self.close_assistant_turn(&generated);

        Ok(GenerationResult {
            text: generated.text,
            token_count: generated.sampled,
            prompt_token_count,
            finish: generated.finish,
        })
    }

    /// Commit the reply plus the closing marker, decoding the marker first.
    ///
    /// The buffer is authoritative: the text is committed even when the marker
    /// cannot be decoded, or when the reply ended inside a multi-byte
    /// character, and the cache is then marked stale.
    fn close_assistant_turn(&mut self, generated: &Generated) {
        let close = self.formatter.assistant_close();
        let text = format!("{}{close}", generated.decoded_text);
        let reply_tokens = generated.decoded;

        if generated.finish == FinishReason::DecodeFailed || !generated.text_matches_cache {
            tracing::debug!(
                finish = ?generated.finish,
                "reply not reproducible from cache; marked stale"
            );
            self.state.commit(&text, reply_tokens);
            self.state.mark_stale();
            return;
        }

        let resident = self.state.token_count + reply_tokens;
        let decoded = self
            .tokenize(close, false)
            .and_then(|tokens| {
                self.check_budget(resident, tokens.len())?;
                Ok(tokens)
            })
            .and_then(|tokens| {
                self.backend
                    .decode(&tokens)
                    .map(|_| tokens.len())
                    .map_err(|reason| SessionError::Decode {
                        stage: DecodeStage::Delta,
                        reason,
                    })
            });

        match decoded {
            Ok(n) => self.state.commit(&text, reply_tokens + n),
            Err(e) => {
                tracing::warn!(error = %e, "closing marker not decoded; cache marked stale");
                self.state.commit(&text, reply_tokens);
                self.state.mark_stale();
            }
        }
    }
}
