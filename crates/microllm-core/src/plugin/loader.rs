use std::path::Path;
use std::sync::Arc;

use libloading::Library;
use microllm_abi::ffi::{ENGINE_ENTRY_SYMBOL, MICROLLM_ABI_VERSION, PluginApi, PluginEntryFn};

use crate::error::{Result, SessionError};

/// An opened engine library and the vtable it exported.
pub(crate) struct LoadedPlugin {
    pub(crate) api: &'static PluginApi,
    // Keeps `api` mapped; must outlive every engine created from it.
    _lib: Library,
}

// SAFETY: the vtable is immutable static data inside the library.
unsafe impl Send for LoadedPlugin {}
unsafe impl Sync for LoadedPlugin {}

impl LoadedPlugin {
    pub(crate) fn open(path: &Path) -> Result<Arc<Self>> {
        if !path.exists() {
            return Err(SessionError::Plugin(format!(
                "engine library not found: {}",
                path.display()
            )));
        }
        let lib = unsafe { Library::new(path) }.map_err(|e| {
            SessionError::Plugin(format!("failed to load {}: {e}", path.display()))
        })?;
        let plugin = Self::init(lib)?;
        tracing::info!(path = %path.display(), "engine library loaded");
        Ok(Arc::new(plugin))
    }

    fn init(lib: Library) -> Result<Self> {
        let entry: libloading::Symbol<PluginEntryFn> = unsafe {
            lib.get(ENGINE_ENTRY_SYMBOL.as_bytes()).map_err(|e| {
                SessionError::Plugin(format!("missing symbol {ENGINE_ENTRY_SYMBOL}: {e}"))
            })?
        };

        let api_ptr = unsafe { entry() };
        if api_ptr.is_null() {
            return Err(SessionError::Plugin("engine entry returned null".into()));
        }

        let api: &'static PluginApi = unsafe { &*api_ptr };
        if api.info.abi_version != MICROLLM_ABI_VERSION {
            return Err(SessionError::Plugin(format!(
                "ABI mismatch: host={} plugin={}",
                MICROLLM_ABI_VERSION, api.info.abi_version
            )));
        }

        Ok(Self { api, _lib: lib })
    }
}
