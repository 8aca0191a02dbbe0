#![allow(dead_code)]

use std::io::Write;

use microllm_abi::testing::{EngineProbe, ScriptedEngine};
use microllm_core::{SessionConfig, SessionEngine, SessionHandle};
use tempfile::NamedTempFile;

pub const MODEL_BYTES: &[u8] = b"GGUF\x03\x00\x00\x00scripted-model";

/// A real file on disk for `load_model` to stat.
pub fn model_file() -> NamedTempFile {
    let mut f = NamedTempFile::new().unwrap();
    f.write_all(MODEL_BYTES).unwrap();
    f.flush().unwrap();
    f
}

pub fn engine(
    config: SessionConfig,
) -> (SessionEngine<ScriptedEngine>, EngineProbe, NamedTempFile) {
    let (backend, probe) = ScriptedEngine::new();
    let mut engine = SessionEngine::new(backend, config);
    let model = model_file();
    engine.load_model(model.path(), 2048, 4).unwrap();
    (engine, probe, model)
}

pub fn handle(config: SessionConfig) -> (SessionHandle, EngineProbe) {
    let (backend, probe) = ScriptedEngine::new();
    (SessionHandle::spawn(backend, config).unwrap(), probe)
}

pub async fn loaded_handle(config: SessionConfig) -> (SessionHandle, EngineProbe, NamedTempFile) {
    let (session, probe) = handle(config);
    let model = model_file();
    session.load_model(model.path(), 2048, 4).await.unwrap();
    (session, probe, model)
}
