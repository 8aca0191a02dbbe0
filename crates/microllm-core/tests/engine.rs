mod common;

use microllm_abi::metadata::ModelCoreInfo;
use microllm_abi::testing::{IM_END, ScriptedEngine};
use microllm_abi::token::Token;
use microllm_core::{
    DecodeStage, FinishReason, GenerationRequest, Message, PromptFlavor, PromptFormatter,
    SessionConfig, SessionEngine, SessionError, StopSignal,
};

use common::{MODEL_BYTES, engine, model_file};

fn turn(prompt: &str) -> GenerationRequest {
    GenerationRequest::new(prompt)
}

#[test]
fn buffer_tracks_cache_across_turns() {
    let (mut s, probe, _model) = engine(SessionConfig::default());
    for prompt in ["Hello", "How are you?", "Bye"] {
        let r = s.converse(&turn(prompt), &StopSignal::never()).unwrap();
        assert_eq!(r.finish, FinishReason::EndOfSequence);
        assert!(r.text.starts_with("reply-"));
        let view = s.conversation();
        assert_eq!(probe.kv_text(), view.buffer);
        assert_eq!(probe.kv_len(), view.token_count);
        assert!(!view.cache_stale);
    }
    let view = s.conversation();
    assert!(view.initialized);
    assert!(view.buffer.starts_with("<|im_start|>system\n"));
    assert!(view.buffer.ends_with("<|im_end|>\n"));
}

#[test]
fn only_the_first_turn_uses_bos() {
    let (mut s, probe, _model) = engine(SessionConfig::default());
    s.converse(&turn("one"), &StopSignal::never()).unwrap();
    s.converse(&turn("two"), &StopSignal::never()).unwrap();

    let log = probe.tokenize_log();
    let with_bos: Vec<_> = log.iter().filter(|(_, bos)| *bos).collect();
    assert_eq!(with_bos.len(), 1);
    assert!(with_bos[0].0.contains("Respond only in English"));
    assert!(log.iter().any(|(t, bos)| !bos && t.contains("<|im_start|>user\ntwo")));
}

#[test]
fn load_reports_size_and_context() {
    let (backend, probe) = ScriptedEngine::new();
    let mut s = SessionEngine::new(backend, SessionConfig::default());
    let model = model_file();
    let out = s.load_model(model.path(), 1024, 0).unwrap();
    assert_eq!(out.context_size, 1024);
    assert_eq!(out.file_size_bytes, MODEL_BYTES.len() as u64);
    assert!(out.replayed_conversation.is_none());
    let loads = probe.loads();
    assert_eq!(loads.len(), 1);
    assert!(loads[0].1.threads >= 1);
    assert!(s.is_model_loaded());
}

#[test]
fn missing_model_is_not_found() {
    let (backend, probe) = ScriptedEngine::new();
    let mut s = SessionEngine::new(backend, SessionConfig::default());
    let err = s
        .load_model(std::path::Path::new("/definitely/not/here.gguf"), 2048, 4)
        .unwrap_err();
    assert!(matches!(err, SessionError::ModelNotFound { .. }));
    assert!(!s.is_model_loaded());
    assert!(probe.loads().is_empty());
}

#[test]
fn native_load_failure_is_reported() {
    let (backend, probe) = ScriptedEngine::new();
    probe.fail_load(Some("bad magic"));
    let mut s = SessionEngine::new(backend, SessionConfig::default());
    let model = model_file();
    let err = s.load_model(model.path(), 2048, 4).unwrap_err();
    assert!(matches!(err, SessionError::LoadFailed(ref m) if m == "bad magic"));
    assert!(!s.is_model_loaded());
}

#[test]
fn stop_sequence_truncates_output() {
    let (mut s, probe, _model) = engine(SessionConfig::default());
    probe.set_reply(|_| "Hello STOP world".into());
    let r = s
        .converse(&turn("hi").stop_sequences(["STOP"]), &StopSignal::never())
        .unwrap();
    assert_eq!(r.text, "Hello ");
    assert_eq!(r.finish, FinishReason::StopSequence);
    // The buffer holds what was decoded, which stops short of the final stop token.
    assert_eq!(probe.kv_text(), s.conversation().buffer);
}

#[test]
fn generation_respects_token_budget() {
    let (mut s, probe, _model) = engine(SessionConfig::default());
    probe.set_end_token(None);
    let r = s
        .converse(&turn("count").max_tokens(5), &StopSignal::never())
        .unwrap();
    assert_eq!(r.token_count, 5);
    assert_eq!(r.finish, FinishReason::MaxTokens);
    assert_eq!(probe.kv_text(), s.conversation().buffer);
}

#[test]
fn configured_decode_cap_clamps_requests() {
    let config = SessionConfig {
        max_decode_tokens: Some(3),
        ..Default::default()
    };
    let (mut s, probe, _model) = engine(config);
    probe.set_end_token(None);
    let r = s
        .converse(&turn("count").max_tokens(100), &StopSignal::never())
        .unwrap();
    assert_eq!(r.token_count, 3);
    assert_eq!(r.finish, FinishReason::MaxTokens);
}

#[test]
fn zero_token_budget_is_rejected() {
    let (mut s, _probe, _model) = engine(SessionConfig::default());
    let err = s
        .converse(&turn("hi").max_tokens(0), &StopSignal::never())
        .unwrap_err();
    assert!(matches!(err, SessionError::InvalidRequest(_)));
    assert!(!s.conversation().initialized);
}

#[test]
fn model_terminators_end_generation() {
    let (backend, probe) = ScriptedEngine::new();
    probe.set_model_info(ModelCoreInfo {
        terminator_token_ids: vec![IM_END.0],
        ..Default::default()
    });
    probe.set_reply(|_| "ok".into());
    probe.set_end_token(Some(IM_END));
    let mut s = SessionEngine::new(backend, SessionConfig::default());
    let model = model_file();
    s.load_model(model.path(), 2048, 4).unwrap();

    let r = s.converse(&turn("hi"), &StopSignal::never()).unwrap();
    assert_eq!(r.text, "ok");
    assert_eq!(r.token_count, 2);
    assert_eq!(r.finish, FinishReason::Terminator);
}

#[test]
fn configured_terminators_end_generation() {
    let config = SessionConfig {
        extra_terminator_tokens: vec![5],
        ..Default::default()
    };
    let (mut s, probe, _model) = engine(config);
    probe.set_reply(|_| "fin".into());
    probe.set_end_token(Some(Token(5)));
    let r = s.converse(&turn("hi"), &StopSignal::never()).unwrap();
    assert_eq!(r.text, "fin");
    assert_eq!(r.finish, FinishReason::Terminator);
}

#[test]
fn unlisted_end_marker_is_caught_by_template_stops() {
    let (mut s, probe, _model) = engine(SessionConfig::default());
    probe.set_reply(|_| "ok".into());
    probe.set_end_token(Some(IM_END));
    let r = s.converse(&turn("hi"), &StopSignal::never()).unwrap();
    assert_eq!(r.text, "ok");
    assert_eq!(r.finish, FinishReason::StopSequence);
    assert_eq!(probe.kv_text(), s.conversation().buffer);
}

#[test]
fn split_multibyte_characters_survive() {
    let (mut s, probe, _model) = engine(SessionConfig::default());
    probe.set_byte_level(true);
    probe.set_reply(|_| "héllo wörld ✓".into());
    let r = s.converse(&turn("hi"), &StopSignal::never()).unwrap();
    assert_eq!(r.text, "héllo wörld ✓");
    assert_eq!(r.token_count, "héllo wörld ✓".len());
    let view = s.conversation();
    assert!(view.buffer.contains("héllo wörld ✓<|im_end|>\n"));
    assert_eq!(probe.kv_text(), view.buffer);
}

#[test]
fn reply_cut_inside_a_character_keeps_buffer_and_cache_in_step() {
    let (mut s, probe, _model) = engine(SessionConfig::default());
    s.converse(&turn("Hello"), &StopSignal::never()).unwrap();
    probe.set_byte_level(true);
    probe.set_reply(|_| "é".into());

    let r = s
        .converse(&turn("accent?").max_tokens(1), &StopSignal::never())
        .unwrap();
    assert_eq!(r.finish, FinishReason::MaxTokens);
    assert_eq!(r.token_count, 1);
    let view = s.conversation();
    assert!(!view.buffer.contains('\u{FFFD}'));
    assert!(view.buffer.ends_with("<|im_start|>assistant\n<|im_end|>\n"));
    assert!(view.cache_stale);

    // The restore rebuilds from the buffer, so the cache matches it again.
    s.generate_isolated(&turn("Translate: oui").isolated(None), &StopSignal::never())
        .unwrap();
    let restored = s.conversation();
    assert_eq!(restored.buffer, view.buffer);
    assert!(!restored.cache_stale);
    assert_eq!(probe.kv_text(), restored.buffer);
    let kv_restored = probe.kv_tokens();

    // A second isolated call now leaves the cache exactly as it found it.
    s.generate_isolated(&turn("Translate: non").isolated(None), &StopSignal::never())
        .unwrap();
    assert_eq!(probe.kv_tokens(), kv_restored);

    probe.set_byte_level(false);
    s.converse(&turn("next"), &StopSignal::never()).unwrap();
    let next = s.conversation();
    assert!(!next.cache_stale);
    assert!(!next.buffer.contains('\u{FFFD}'));
    assert_eq!(probe.kv_text(), next.buffer);
}

#[test]
fn reply_cut_inside_a_character_heals_on_next_turn() {
    let (mut s, probe, _model) = engine(SessionConfig::default());
    probe.set_byte_level(true);
    probe.set_reply(|_| "ü".into());
    s.converse(&turn("umlaut?").max_tokens(1), &StopSignal::never())
        .unwrap();
    assert!(s.conversation().cache_stale);

    probe.set_reply(|_| "ok".into());
    s.converse(&turn("again"), &StopSignal::never()).unwrap();
    let view = s.conversation();
    assert!(!view.cache_stale);
    assert_eq!(probe.kv_text(), view.buffer);
    assert_eq!(probe.kv_len(), view.token_count);
}

#[test]
fn tokenize_failure_changes_nothing() {
    let (mut s, probe, _model) = engine(SessionConfig::default());
    s.converse(&turn("Hello"), &StopSignal::never()).unwrap();
    let before = s.conversation();
    let decodes = probe.decode_calls();

    probe.fail_tokenize_containing(Some("poison"));
    let err = s
        .converse(&turn("poison pill"), &StopSignal::never())
        .unwrap_err();
    assert!(matches!(err, SessionError::Tokenize(_)));
    assert_eq!(s.conversation(), before);
    assert_eq!(probe.decode_calls(), decodes);
    assert_eq!(probe.kv_text(), before.buffer);
}

#[test]
fn decode_failure_keeps_buffer_and_heals_on_next_turn() {
    let (mut s, probe, _model) = engine(SessionConfig::default());
    s.converse(&turn("Hello"), &StopSignal::never()).unwrap();
    let before = s.conversation();

    probe.fail_decode_containing(Some("boom"));
    let err = s.converse(&turn("boom"), &StopSignal::never()).unwrap_err();
    assert!(matches!(
        err,
        SessionError::Decode {
            stage: DecodeStage::Delta,
            ..
        }
    ));
    let after = s.conversation();
    assert_eq!(after.buffer, before.buffer);
    assert!(after.cache_stale);
    assert_ne!(probe.kv_text(), after.buffer);

    probe.fail_decode_containing(None);
    let r = s.converse(&turn("next"), &StopSignal::never()).unwrap();
    let healed = s.conversation();
    assert!(!healed.cache_stale);
    assert!(!healed.buffer.contains("boom"));
    assert!(healed.buffer.starts_with(&before.buffer));
    assert_eq!(probe.kv_text(), healed.buffer);
    // The rebuild re-decodes everything that came before the new turn.
    assert!(r.prompt_token_count > before.token_count);
}

#[test]
fn context_overflow_is_reported_before_decoding() {
    let (backend, probe) = ScriptedEngine::new();
    let mut s = SessionEngine::new(backend, SessionConfig::default());
    let model = model_file();
    s.load_model(model.path(), 64, 1).unwrap();
    let decodes = probe.decode_calls();

    let err = s
        .converse(&turn(&"x".repeat(200)), &StopSignal::never())
        .unwrap_err();
    assert!(matches!(err, SessionError::ContextOverflow { capacity: 64, .. }));
    assert_eq!(probe.decode_calls(), decodes);
    let view = s.conversation();
    assert!(!view.initialized);
    assert!(view.buffer.is_empty());
}

#[test]
fn generation_stops_when_context_fills() {
    let formatter = PromptFormatter::new(PromptFlavor::ChatMl);
    let delta = format!("{}{}", formatter.preamble("English"), formatter.turn_delta("Hi"));
    let (probe_engine, _) = ScriptedEngine::new();
    let mut sizing = SessionEngine::new(probe_engine, SessionConfig::default());
    let model = model_file();
    sizing.load_model(model.path(), 4096, 1).unwrap();
    let prompt_tokens = {
        use microllm_abi::backend::NativeEngine;
        sizing.backend().tokenize(&delta, true).unwrap().len()
    };

    let (backend, probe) = ScriptedEngine::new();
    probe.set_end_token(None);
    let mut s = SessionEngine::new(backend, SessionConfig::default());
    s.load_model(model.path(), (prompt_tokens + 5) as u32, 1).unwrap();
    let r = s
        .converse(&turn("Hi").max_tokens(100), &StopSignal::never())
        .unwrap();
    assert_eq!(r.finish, FinishReason::ContextFull);
    assert_eq!(r.token_count, 6);
    assert_eq!(probe.kv_len(), prompt_tokens + 5);
}

#[test]
fn set_conversation_replays_history_with_reinforcement() {
    let (mut s, probe, _model) = engine(SessionConfig::default());
    let out = s
        .set_conversation(
            "french",
            vec![
                Message::user("Bonjour"),
                Message::assistant(""),
                Message::assistant("Salut !"),
            ],
        )
        .unwrap();
    assert!(!out.pending);
    let view = s.conversation();
    assert_eq!(view.language, "French");
    assert!(view.initialized);
    assert_eq!(out.prompt_token_count, view.token_count);
    assert!(view.buffer.contains("<|im_start|>assistant\nSalut !<|im_end|>\n"));
    assert!(view.buffer.ends_with(
        "<|im_start|>system\nReminder: from now on, reply only in French.<|im_end|>\n"
    ));
    assert_eq!(probe.kv_text(), view.buffer);
}

#[test]
fn set_conversation_failures_keep_previous_conversation() {
    let (mut s, probe, _model) = engine(SessionConfig::default());
    s.converse(&turn("Hello"), &StopSignal::never()).unwrap();
    let before = s.conversation();

    probe.fail_tokenize_containing(Some("secret"));
    let err = s
        .set_conversation("German", vec![Message::user("secret")])
        .unwrap_err();
    assert!(matches!(err, SessionError::Tokenize(_)));
    let after = s.conversation();
    assert_eq!(after.buffer, before.buffer);
    assert_eq!(after.language, "English");
    assert!(!after.cache_stale);
    assert_eq!(probe.kv_text(), after.buffer);

    probe.fail_tokenize_containing(None);
    probe.fail_decode_containing(Some("secret"));
    let err = s
        .set_conversation("German", vec![Message::user("secret")])
        .unwrap_err();
    assert!(matches!(
        err,
        SessionError::Decode {
            stage: DecodeStage::Conversation,
            ..
        }
    ));
    let after = s.conversation();
    assert_eq!(after.buffer, before.buffer);
    assert_eq!(after.language, "English");
    assert!(after.initialized);
    assert!(after.cache_stale);

    probe.fail_decode_containing(None);
    s.converse(&turn("still here?"), &StopSignal::never()).unwrap();
    assert_eq!(probe.kv_text(), s.conversation().buffer);
}

#[test]
fn isolated_generation_leaves_conversation_untouched() {
    let (mut s, probe, _model) = engine(SessionConfig::default());
    s.converse(&turn("Hello"), &StopSignal::never()).unwrap();
    let before = s.conversation();
    let kv_before = probe.kv_tokens();

    let r = s
        .generate_isolated(
            &turn("Translate: Hello").isolated(Some("You translate.".into())),
            &StopSignal::never(),
        )
        .unwrap();
    assert!(r.text.starts_with("reply-"));
    assert!(r.prompt_token_count > 0);

    assert_eq!(s.conversation(), before);
    assert_eq!(probe.kv_tokens(), kv_before);
    let isolated_prompt = probe
        .tokenize_log()
        .into_iter()
        .find(|(t, _)| t.contains("Translate: Hello"))
        .unwrap();
    assert!(isolated_prompt.1);
    assert!(isolated_prompt.0.starts_with("<|im_start|>system\nYou translate.<|im_end|>\n"));
    assert!(!isolated_prompt.0.contains("Respond only in"));
}

#[test]
fn isolated_generation_without_conversation_leaves_cache_empty() {
    let (mut s, probe, _model) = engine(SessionConfig::default());
    s.generate_isolated(&turn("Translate: Hi").isolated(None), &StopSignal::never())
        .unwrap();
    let view = s.conversation();
    assert!(!view.initialized);
    assert!(view.buffer.is_empty());
    assert_eq!(view.token_count, 0);
    assert_eq!(probe.kv_len(), 0);
    assert!(
        probe
            .tokenize_log()
            .iter()
            .any(|(t, _)| t.contains(microllm_core::config::DEFAULT_ISOLATED_SYSTEM_PROMPT))
    );
}

#[test]
fn failed_restore_self_heals_on_next_turn() {
    let (mut s, probe, _model) = engine(SessionConfig::default());
    s.converse(&turn("Hello"), &StopSignal::never()).unwrap();
    let before = s.conversation();

    // Only the restore decodes text containing the first user turn.
    probe.fail_decode_containing(Some("user\nHello"));
    let r = s
        .generate_isolated(&turn("Translate: Bonjour").isolated(None), &StopSignal::never())
        .unwrap();
    assert_eq!(r.finish, FinishReason::EndOfSequence);
    let after = s.conversation();
    assert_eq!(after.buffer, before.buffer);
    assert!(after.cache_stale);

    probe.fail_decode_containing(None);
    s.converse(&turn("Again"), &StopSignal::never()).unwrap();
    let healed = s.conversation();
    assert!(!healed.cache_stale);
    assert_eq!(probe.kv_text(), healed.buffer);
}

#[test]
fn isolated_tokenize_failure_restores_conversation() {
    let (mut s, probe, _model) = engine(SessionConfig::default());
    s.converse(&turn("Hello"), &StopSignal::never()).unwrap();
    let before = s.conversation();
    let kv_before = probe.kv_tokens();

    probe.fail_tokenize_containing(Some("Translate"));
    let err = s
        .generate_isolated(&turn("Translate: Hi").isolated(None), &StopSignal::never())
        .unwrap_err();
    assert!(matches!(err, SessionError::Tokenize(_)));
    assert_eq!(s.conversation(), before);
    assert_eq!(probe.kv_tokens(), kv_before);
}

#[test]
fn isolated_decode_failure_restores_conversation() {
    let (mut s, probe, _model) = engine(SessionConfig::default());
    s.converse(&turn("Hello"), &StopSignal::never()).unwrap();
    let before = s.conversation();
    let kv_before = probe.kv_tokens();

    probe.fail_decode_containing(Some("Translate"));
    let err = s
        .generate_isolated(&turn("Translate: Hi").isolated(None), &StopSignal::never())
        .unwrap_err();
    assert!(matches!(
        err,
        SessionError::Decode {
            stage: DecodeStage::Isolated,
            ..
        }
    ));
    assert_eq!(s.conversation(), before);
    assert_eq!(probe.kv_tokens(), kv_before);
}

#[test]
fn isolated_overflow_restores_conversation() {
    let (mut s, probe, _model) = engine(SessionConfig::default());
    s.converse(&turn("Hello"), &StopSignal::never()).unwrap();
    let before = s.conversation();
    let kv_before = probe.kv_tokens();
    let decodes = probe.decode_calls();

    let err = s
        .generate_isolated(&turn(&"x".repeat(3000)).isolated(None), &StopSignal::never())
        .unwrap_err();
    assert!(matches!(err, SessionError::ContextOverflow { capacity: 2048, .. }));
    // Only the restore decoded anything.
    assert_eq!(probe.decode_calls(), decodes + 1);
    assert_eq!(s.conversation(), before);
    assert_eq!(probe.kv_tokens(), kv_before);
}

#[test]
fn isolated_output_stops_at_caller_stop_sequence() {
    let (mut s, probe, _model) = engine(SessionConfig::default());
    probe.set_reply(|_| "Bonjour\nHello again".into());
    let r = s
        .generate_isolated(
            &turn("Translate: Hello").isolated(None).stop_sequences(["\n"]),
            &StopSignal::never(),
        )
        .unwrap();
    assert_eq!(r.text, "Bonjour");
    assert_eq!(r.finish, FinishReason::StopSequence);
}

#[test]
fn cancelled_signal_refuses_to_start() {
    let (mut s, probe, _model) = engine(SessionConfig::default());
    let registry = microllm_core::CancelRegistry::new();
    let stop = StopSignal::issue(&registry);
    registry.cancel_all();
    let decodes = probe.decode_calls();
    let err = s.converse(&turn("hi"), &stop).unwrap_err();
    assert!(matches!(err, SessionError::Cancelled));
    assert_eq!(probe.decode_calls(), decodes);
    assert!(!s.conversation().initialized);
}

#[test]
fn not_loaded_operations() {
    let (backend, _probe) = ScriptedEngine::new();
    let mut s = SessionEngine::new(backend, SessionConfig::default());
    assert!(matches!(
        s.converse(&turn("hi"), &StopSignal::never()),
        Err(SessionError::NotLoaded)
    ));
    assert!(matches!(
        s.generate_isolated(&turn("hi").isolated(None), &StopSignal::never()),
        Err(SessionError::NotLoaded)
    ));
    let out = s.set_conversation("Spanish", vec![]).unwrap();
    assert!(out.pending);
    assert!(matches!(s.reset_conversation(), Err(SessionError::NotLoaded)));
    assert_eq!(s.conversation().pending.unwrap().language, "Spanish");
}

#[test]
fn reset_keeps_language_and_pending_while_unload_clears_them() {
    let (mut s, probe, _model) = engine(SessionConfig::default());
    s.set_conversation("Italian", vec![Message::user("Ciao")]).unwrap();
    s.converse(&turn("Come stai?"), &StopSignal::never()).unwrap();

    s.reset_conversation().unwrap();
    let view = s.conversation();
    assert!(view.buffer.is_empty());
    assert!(!view.initialized);
    assert_eq!(view.language, "Italian");
    assert!(view.pending.is_some());
    assert_eq!(probe.kv_len(), 0);

    // Next turn re-initializes in the kept language.
    s.converse(&turn("Ancora"), &StopSignal::never()).unwrap();
    assert!(s.conversation().buffer.contains("Respond only in Italian"));

    s.unload_model().unwrap();
    let view = s.conversation();
    assert!(view.buffer.is_empty());
    assert_eq!(view.language, "English");
    assert!(view.pending.is_none());
    assert!(!s.is_model_loaded());
}

#[test]
fn model_hint_and_config_pick_the_template() {
    let (backend, probe) = ScriptedEngine::new();
    probe.set_model_info(ModelCoreInfo {
        prompt_flavor_hint: Some(PromptFlavor::Llama3),
        ..Default::default()
    });
    let mut s = SessionEngine::new(backend, SessionConfig::default());
    let model = model_file();
    s.load_model(model.path(), 2048, 4).unwrap();
    s.converse(&turn("hi"), &StopSignal::never()).unwrap();
    assert_eq!(s.formatter().flavor(), PromptFlavor::Llama3);
    assert!(s.conversation().buffer.starts_with("<|start_header_id|>system"));

    let config = SessionConfig {
        prompt_flavor: Some(PromptFlavor::Gemma),
        ..Default::default()
    };
    let (backend, probe) = ScriptedEngine::new();
    probe.set_model_info(ModelCoreInfo {
        prompt_flavor_hint: Some(PromptFlavor::Llama3),
        ..Default::default()
    });
    let mut s = SessionEngine::new(backend, config);
    s.load_model(model.path(), 2048, 4).unwrap();
    s.converse(&turn("hi"), &StopSignal::never()).unwrap();
    let view = s.conversation();
    assert!(view.buffer.starts_with("<start_of_turn>user\n"));
    assert!(view.buffer.ends_with("<end_of_turn>\n"));
    assert_eq!(probe.kv_text(), view.buffer);
}

#[test]
fn reload_replaces_model_and_clears_history() {
    let (mut s, probe, model) = engine(SessionConfig::default());
    s.converse(&turn("Hello"), &StopSignal::never()).unwrap();
    s.load_model(model.path(), 1024, 2).unwrap();
    let view = s.conversation();
    assert!(view.buffer.is_empty());
    assert!(!view.initialized);
    assert_eq!(probe.loads().len(), 2);
    assert_eq!(probe.kv_len(), 0);
}
