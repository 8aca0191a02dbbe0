use microllm_abi::backend::NativeEngine;

use super::utils::{first_stop_hit, utf8_valid_prefix_len};
use super::{FinishReason, SessionEngine};
use crate::utils::debug::dump_bytes;
use crate::worker::stop::StopSignal;

/// What one run of the generation loop produced.
pub(super) struct Generated {
    /// Caller-facing text, cut at the first stop sequence.
    pub(super) text: String,
    /// Text of exactly the tokens decoded back into the cache.
    pub(super) decoded_text: String,
    /// Tokens sampled and kept.
    pub(super) sampled: usize,
    /// Tokens decoded back into the cache.
    pub(super) decoded: usize,
    /// False when the decoded bytes are not valid UTF-8, so `decoded_text`
    /// cannot reproduce the cache on a rebuild.
    pub(super) text_matches_cache: bool,
    pub(super) finish: FinishReason,
}

impl<B: NativeEngine> SessionEngine<B> {
    /// sample -> stop checks -> decode, at most `step_limit` times.
    ///
    /// Expects the prompt already resident in the cache behind `resident`
    /// tokens. Decode failures end the loop but keep the partial output.
    pub(super) fn run_generation(
        &mut self,
        stops: &[String],
        resident: usize,
        step_limit: usize,
        stop: &StopSignal,
    ) -> Generated {
        let capacity = self.backend.context_size();
        let eos = self.backend.eos_token();

        let mut out_text = String::new();
        let mut staging_bytes: Vec<u8> = Vec::with_capacity(64);
        let mut decoded_bytes: Vec<u8> = Vec::with_capacity(1024);
        let mut sampled = 0usize;
        let mut decoded = 0usize;
        let mut finish = FinishReason::MaxTokens;

        for step in 0..step_limit {
            if stop.is_cancelled() {
                tracing::info!(step, "generation cancelled");
                finish = FinishReason::Cancelled;
                break;
            }

            let token = match self.backend.sample() {
                Ok(t) => t,
                Err(reason) => {
                    tracing::warn!(step, %reason, "sampling failed; keeping partial output");
                    finish = FinishReason::DecodeFailed;
                    break;
                }
            };
            tracing::trace!(step, token = token.0, "sampled");

            if token == eos {
                finish = FinishReason::EndOfSequence;
                break;
            }
            if self.is_terminator(token) {
                finish = FinishReason::Terminator;
                break;
            }

            let piece = match self.backend.token_to_piece(token) {
                Ok(p) => p,
                Err(reason) => {
                    tracing::warn!(step, %reason, "token_to_piece failed; keeping partial output");
                    finish = FinishReason::DecodeFailed;
                    break;
                }
            };
            sampled += 1;

            // Emit only the valid UTF-8 prefix; a split character waits for its tail.
            let checked = out_text.len();
            staging_bytes.extend_from_slice(&piece);
            let valid_len = utf8_valid_prefix_len(&staging_bytes);
            if valid_len > 0 {
                let taken: Vec<u8> = staging_bytes.drain(..valid_len).collect();
                out_text.push_str(&String::from_utf8_lossy(&taken));
            }
            if let Some(at) = first_stop_hit(&out_text, stops, checked) {
                out_text.truncate(at);
                staging_bytes.clear();
                finish = FinishReason::StopSequence;
                break;
            }

            if resident + decoded >= capacity {
                tracing::warn!(resident, decoded, capacity, "context full during generation");
                finish = FinishReason::ContextFull;
                break;
            }
            if let Err(reason) = self.backend.decode(&[token]) {
                tracing::warn!(
                    step,
                    %reason,
                    "decode of sampled token failed; keeping partial output"
                );
                finish = FinishReason::DecodeFailed;
                break;
            }
            decoded += 1;
            decoded_bytes.extend_from_slice(&piece);
        }

        if !staging_bytes.is_empty() {
            dump_bytes("generation tail", &staging_bytes);
            out_text.push_str(&String::from_utf8_lossy(&staging_bytes));
        }

        let (decoded_text, text_matches_cache) = match String::from_utf8(decoded_bytes) {
            Ok(text) => (text, true),
            Err(e) => {
                let bytes = e.as_bytes();
                dump_bytes("decoded tail", bytes);
                // A split trailing character is dropped; anything else is replaced.
                let text = match e.utf8_error().error_len() {
                    None => String::from_utf8_lossy(&bytes[..e.utf8_error().valid_up_to()]),
                    Some(_) => String::from_utf8_lossy(bytes),
                };
                (text.into_owned(), false)
            }
        };

        tracing::debug!(
            ?finish,
            sampled,
            decoded,
            chars = out_text.chars().count(),
            "generation finished"
        );
        Generated {
            text: out_text,
            decoded_text,
            sampled,
            decoded,
            text_matches_cache,
            finish,
        }
    }
}
