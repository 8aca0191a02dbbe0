use std::path::Path;
use std::time::Instant;

use microllm_abi::backend::{LoadParams, Message, NativeEngine};
use microllm_abi::token::Token;

use super::{ConversationOutcome, LoadOutcome, SessionEngine};
use crate::conversation::{ConversationState, PendingConversation};
use crate::error::{DecodeStage, Result, SessionError};
use crate::format::PromptFormatter;

impl<B: NativeEngine> SessionEngine<B> {
    /// Load weights, reset the conversation, then replay any pending one.
    pub fn load_model(
        &mut self,
        path: &Path,
        context_size: u32,
        threads: u32,
    ) -> Result<LoadOutcome> {
        let file_size_bytes = match std::fs::metadata(path) {
            Ok(meta) if meta.is_file() => meta.len(),
            Ok(_) => {
                return Err(SessionError::ModelNotFound {
                    path: path.display().to_string(),
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SessionError::ModelNotFound {
                    path: path.display().to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };
        if context_size == 0 {
            return Err(SessionError::InvalidRequest(
                "context_size must be greater than zero".into(),
            ));
        }
        let threads = if threads == 0 {
            num_cpus::get() as u32
        } else {
            threads
        };
        let params = LoadParams {
            context_size,
            threads,
        };

        tracing::info!(path = %path.display(), context_size, threads, "loading model");
        let started = Instant::now();

        // A new model invalidates whatever the old cache held.
        self.state.clear();
        self.terminators.clear();
        let loaded = self.backend.load_model(path, &params);
        self.publish_loaded();
        if let Err(e) = loaded {
            tracing::error!(path = %path.display(), error = %e, "model load failed");
            return Err(SessionError::LoadFailed(e));
        }
        let load_time_ms = started.elapsed().as_millis() as u64;

        let info = self.backend.model_info();
        self.terminators = info
            .terminator_token_ids
            .iter()
            .copied()
            .map(Token)
            .chain(self.config.extra_terminators())
            .collect();
        let flavor = self
            .config
            .prompt_flavor
            .or_else(|| info.infer_flavor())
            .unwrap_or_default();
        self.formatter = PromptFormatter::new(flavor);

        let context_size = self.backend.context_size();
        tracing::info!(
            context_size,
            load_time_ms,
            file_size_bytes,
            ?flavor,
            terminators = self.terminators.len(),
            "model loaded"
        );

        let replayed_conversation = match self.pending.take() {
            Some(p) => match self.apply_conversation(&p.language, &p.messages) {
                Ok(outcome) => {
                    tracing::info!(
                        language = %p.language,
                        messages = p.messages.len(),
                        "pending conversation replayed"
                    );
                    Some(outcome)
                }
                Err(e) => {
                    tracing::warn!(error = %e, "pending conversation replay failed");
                    self.state.language = p.language;
                    None
                }
            },
            None => None,
        };

        Ok(LoadOutcome {
            context_size,
            load_time_ms,
            file_size_bytes,
            replayed_conversation,
        })
    }

    /// Free the model. Conversation and pending request are dropped either way.
    pub fn unload_model(&mut self) -> Result<()> {
        let unloaded = self.backend.unload_model();
        self.state = ConversationState::new(self.config.resolve_language(""));
        self.pending = None;
        self.terminators.clear();
        self.publish_loaded();
        match unloaded {
            Ok(()) => {
                tracing::info!("model unloaded");
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "model unload failed");
                Err(SessionError::UnloadFailed(e))
            }
        }
    }

    /// Forget the history; language and any pending request survive.
    pub fn reset_conversation(&mut self) -> Result<()> {
        self.require_loaded()?;
        self.state.clear();
        self.backend.clear_context();
        tracing::debug!("conversation reset");
        Ok(())
    }

    /// Replace the whole conversation, or defer it until a model is loaded.
    pub fn set_conversation(
        &mut self,
        language: &str,
        messages: Vec<Message>,
    ) -> Result<ConversationOutcome> {
        let language = self.config.resolve_language(language);
        self.pending = Some(PendingConversation {
            language: language.clone(),
            messages: messages.clone(),
        });

        if !self.backend.is_loaded() {
            tracing::info!(%language, "no model loaded; conversation deferred");
            return Ok(ConversationOutcome {
                pending: true,
                prompt_token_count: 0,
            });
        }

        self.apply_conversation(&language, &messages)
    }

    /// Tokenize first so a tokenizer failure leaves everything as it was.
    fn apply_conversation(
        &mut self,
        language: &str,
        messages: &[Message],
    ) -> Result<ConversationOutcome> {
        let text = self.formatter.conversation(language, messages);
        let tokens = self.tokenize(&text, true)?;
        self.check_budget(0, tokens.len())?;

        self.backend.clear_context();
        if let Err(reason) = self.backend.decode(&tokens) {
            self.state.mark_stale();
            tracing::error!(%reason, "conversation decode failed");
            return Err(SessionError::Decode {
                stage: DecodeStage::Conversation,
                reason,
            });
        }

        self.state.replace(text, tokens.len());
        self.state.initialized = true;
        self.state.language = language.to_string();
        tracing::info!(
            %language,
            messages = messages.len(),
            prompt_tokens = tokens.len(),
            "conversation set"
        );
        Ok(ConversationOutcome {
            pending: false,
            prompt_token_count: tokens.len(),
        })
    }
}
