use core::ffi::c_void;
use std::ffi::CString;
use std::path::Path;
use std::slice;
use std::sync::Arc;

use microllm_abi::backend::{LoadParams, NativeEngine};
use microllm_abi::ffi::{ERR_OK, EngineApi, EngineString};
use microllm_abi::metadata::ModelCoreInfo;
use microllm_abi::sampling::SamplingParams;
use microllm_abi::token::{Token, tokens_from_raw, tokens_to_raw};

use super::loader::LoadedPlugin;
use crate::config::SessionConfig;
use crate::error::{Result, SessionError};

/// `NativeEngine` backed by a dynamically loaded engine library.
pub struct PluginEngine {
    plugin: Arc<LoadedPlugin>,
    engine: *mut c_void,
}

// SAFETY: the engine pointer is only touched by the one thread that owns the
// session; the library never calls back into us.
unsafe impl Send for PluginEngine {}

impl Drop for PluginEngine {
    fn drop(&mut self) {
        if !self.engine.is_null() {
            unsafe { (self.api().destroy)(self.engine) };
            self.engine = std::ptr::null_mut();
        }
    }
}

fn make_cstring(s: &str) -> std::result::Result<CString, String> {
    CString::new(s).map_err(|_| "string contains interior NUL".to_string())
}

unsafe fn take_engine_bytes(api: &EngineApi, s: EngineString) -> Vec<u8> {
    if s.ptr.is_null() {
        return Vec::new();
    }
    let out = unsafe { slice::from_raw_parts(s.ptr as *const u8, s.len) }.to_vec();
    unsafe { (api.free_string)(s) };
    out
}

impl PluginEngine {
    /// Open the library at `path` and create one engine instance (no model yet).
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let plugin = LoadedPlugin::open(path.as_ref())?;
        let engine = unsafe { (plugin.api.engine.create)() };
        if engine.is_null() {
            let msg = last_error(&plugin.api.engine);
            return Err(SessionError::Plugin(if msg.is_empty() {
                "engine create failed".into()
            } else {
                msg
            }));
        }
        Ok(Self { plugin, engine })
    }

    /// Open the library named by `SessionConfig::plugin_path`.
    pub fn from_config(config: &SessionConfig) -> Result<Self> {
        let path = config.plugin_path.as_deref().ok_or_else(|| {
            SessionError::Plugin("no engine library configured (MICROLLM_PLUGIN_PATH)".into())
        })?;
        Self::open(path)
    }

    #[inline]
    fn api(&self) -> &EngineApi {
        &self.plugin.api.engine
    }

    fn error_or(&self, fallback: &str) -> String {
        let msg = last_error(self.api());
        if msg.is_empty() {
            fallback.to_string()
        } else {
            msg
        }
    }
}

fn last_error(api: &EngineApi) -> String {
    let bytes = unsafe { take_engine_bytes(api, (api.last_error)()) };
    String::from_utf8_lossy(&bytes).into_owned()
}

impl NativeEngine for PluginEngine {
    fn load_model(
        &mut self,
        model_path: &Path,
        params: &LoadParams,
    ) -> std::result::Result<(), String> {
        let cpath = make_cstring(model_path.to_str().ok_or("model path not valid UTF-8")?)?;
        let rc = unsafe {
            (self.api().load_model)(
                self.engine,
                cpath.as_ptr(),
                params.context_size,
                params.threads,
            )
        };
        if rc == ERR_OK {
            Ok(())
        } else {
            Err(self.error_or("load_model failed"))
        }
    }

    fn unload_model(&mut self) -> std::result::Result<(), String> {
        let rc = unsafe { (self.api().unload_model)(self.engine) };
        if rc == ERR_OK {
            Ok(())
        } else {
            Err(self.error_or("unload_model failed"))
        }
    }

    fn is_loaded(&self) -> bool {
        unsafe { (self.api().is_loaded)(self.engine) }
    }

    fn context_size(&self) -> usize {
        let n = unsafe { (self.api().context_size)(self.engine) };
        usize::try_from(n).unwrap_or(0)
    }

    fn model_info(&self) -> ModelCoreInfo {
        let bytes =
            unsafe { take_engine_bytes(self.api(), (self.api().model_info_json)(self.engine)) };
        if bytes.is_empty() {
            return ModelCoreInfo::default();
        }
        match serde_json::from_slice::<ModelCoreInfo>(&bytes) {
            Ok(info) => info,
            Err(e) => {
                tracing::warn!(error = %e, "malformed model info JSON from engine");
                ModelCoreInfo::default()
            }
        }
    }

    fn tokenize(&self, text: &str, add_bos: bool) -> std::result::Result<Vec<Token>, String> {
        let ctext = make_cstring(text)?;
        let arr = unsafe { (self.api().tokenize)(self.engine, ctext.as_ptr(), add_bos) };
        if arr.ptr.is_null() {
            return Err(self.error_or("tokenize failed"));
        }
        let tokens = tokens_from_raw(unsafe { slice::from_raw_parts(arr.ptr, arr.len) });
        unsafe { (self.api().free_ints)(arr) };
        Ok(tokens)
    }

    fn decode(&mut self, tokens: &[Token]) -> std::result::Result<(), String> {
        if tokens.is_empty() {
            return Ok(());
        }
        let raw = tokens_to_raw(tokens);
        let rc = unsafe { (self.api().decode)(self.engine, raw.as_ptr(), raw.len()) };
        if rc == ERR_OK {
            Ok(())
        } else {
            Err(self.error_or(&format!("decode failed (status {rc})")))
        }
    }

    fn sample(&mut self) -> std::result::Result<Token, String> {
        let tok = unsafe { (self.api().sample)(self.engine) };
        if tok >= 0 {
            Ok(Token(tok))
        } else {
            Err(self.error_or("sample failed"))
        }
    }

    fn token_to_piece(&self, token: Token) -> std::result::Result<Vec<u8>, String> {
        let s = unsafe { (self.api().token_to_piece)(self.engine, token.0) };
        if s.ptr.is_null() {
            let msg = last_error(self.api());
            return if msg.is_empty() { Ok(Vec::new()) } else { Err(msg) };
        }
        Ok(unsafe { take_engine_bytes(self.api(), s) })
    }

    fn eos_token(&self) -> Token {
        Token(unsafe { (self.api().eos_token)(self.engine) })
    }

    fn reset_sampler(&mut self, params: &SamplingParams) {
        let p = params.normalized();
        let temperature = if p.greedy { 0.0 } else { p.temperature.unwrap_or(0.0) };
        let top_p = p.top_p.unwrap_or(1.0);
        let top_k = p.top_k.map(|k| k as i32).unwrap_or(0);
        unsafe { (self.api().reset_sampler)(self.engine, temperature, top_p, top_k, p.seed) };
    }

    fn clear_context(&mut self) {
        unsafe { (self.api().clear_context)(self.engine) };
    }
}
