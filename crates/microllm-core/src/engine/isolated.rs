use microllm_abi::backend::NativeEngine;

use super::{GenerationRequest, GenerationResult, SessionEngine};
use crate::conversation::Snapshot;
use crate::error::{DecodeStage, Result, SessionError};
use crate::worker::stop::StopSignal;

impl<B: NativeEngine> SessionEngine<B> {
    /// One-off generation on a fresh context; the conversation is restored after.
    ///
    /// Restore problems are logged and never reach the caller. If the cache
    /// cannot be rebuilt it is marked stale and the next turn rebuilds it.
    pub fn generate_isolated(
        &mut self,
        request: &GenerationRequest,
        stop: &StopSignal,
    ) -> Result<GenerationResult> {
        request.validate()?;
        self.require_loaded()?;
        if stop.is_cancelled() {
            return Err(SessionError::Cancelled);
        }

        let snapshot = Snapshot::take(&self.state, &self.pending);
        let result = self.run_isolated(request, stop);
        self.restore(snapshot);
        result
    }

    fn run_isolated(
        &mut self,
        request: &GenerationRequest,
        stop: &StopSignal,
    ) -> Result<GenerationResult> {
        self.backend.reset_sampler(&request.sampling);
        self.backend.clear_context();

        let system = request
            .system_prompt
            .as_deref()
            .unwrap_or(&self.config.isolated_system_prompt);
        let prompt = self
            .formatter
            .isolated(system, &request.prompt)
            .with_stops(request.stop_sequences.iter().cloned());

        let tokens = self.tokenize(&prompt.text, prompt.add_bos)?;
        self.check_budget(0, tokens.len())?;
        self.backend
            .decode(&tokens)
            .map_err(|reason| SessionError::Decode {
                stage: DecodeStage::Isolated,
                reason,
            })?;
        tracing::debug!(prompt_tokens = tokens.len(), "isolated prompt decoded");

        let step_limit = self.config.step_limit(request.max_tokens);
        let generated = self.run_generation(&prompt.stop_sequences, tokens.len(), step_limit, stop);
        Ok(GenerationResult {
            text: generated.text,
            token_count: generated.sampled,
            prompt_token_count: tokens.len(),
            finish: generated.finish,
        })
    }

    fn restore(&mut self, snapshot: Snapshot) {
        self.backend.clear_context();
        let has_cache = snapshot.has_cache();
        self.state = snapshot.state;
        self.pending = snapshot.pending;

        if !has_cache {
            self.state.token_count = 0;
            return;
        }

        let rebuilt = self.tokenize(&self.state.buffer, true).and_then(|tokens| {
            self.backend
                .decode(&tokens)
                .map(|_| tokens.len())
                .map_err(|reason| SessionError::Decode {
                    stage: DecodeStage::Rebuild,
                    reason,
                })
        });
        match rebuilt {
            Ok(n) => {
                self.state.token_count = n;
                self.state.cache_stale = false;
                tracing::debug!(tokens = n, "conversation cache restored");
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "failed to restore conversation after isolated generation"
                );
                self.state.mark_stale();
            }
        }
    }
}
