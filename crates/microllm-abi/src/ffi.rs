use core::ffi::{c_char, c_void};

/// Bump this when you break the ABI. Host checks it at load time.
pub const MICROLLM_ABI_VERSION: u32 = 1;

pub const ENGINE_ENTRY_SYMBOL: &str = "microllm_engine_entry_v1";

pub const ERR_OK: i32 = 0;
pub const ERR_FAIL: i32 = 1;

/// Engine-owned UTF-8 (or raw byte) buffer; release with `free_string`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct EngineString {
    pub ptr: *mut c_char,
    pub len: usize,
}

/// Engine-owned token buffer; release with `free_ints`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Int32Array {
    pub ptr: *mut i32,
    pub len: usize,
}

#[repr(C)]
pub struct EngineInfo {
    pub abi_version: u32,
    pub id: *const c_char,     // "llama.cpp"
    pub semver: *const c_char, // "0.1.0"
}

// ---------- Function pointer types (C ABI) ----------

/// Returns an opaque engine instance (no model loaded yet).
pub type CreateEngineFn = unsafe extern "C" fn() -> *mut c_void;
pub type DestroyEngineFn = unsafe extern "C" fn(engine: *mut c_void);

/// Returns ERR_OK on success.
pub type LoadModelFn = unsafe extern "C" fn(
    engine: *mut c_void,
    model_path: *const c_char,
    context_size: u32,
    threads: u32,
) -> i32;
pub type UnloadModelFn = unsafe extern "C" fn(engine: *mut c_void) -> i32;
pub type IsLoadedFn = unsafe extern "C" fn(engine: *mut c_void) -> bool;
pub type ContextSizeFn = unsafe extern "C" fn(engine: *mut c_void) -> i32; // 0 if none

/// JSON for `microllm_abi::metadata::ModelCoreInfo`.
pub type ModelInfoJsonFn = unsafe extern "C" fn(engine: *mut c_void) -> EngineString;

/// `ptr == null` signals failure; an empty, non-null array is a valid result.
pub type TokenizeFn =
    unsafe extern "C" fn(engine: *mut c_void, text: *const c_char, add_bos: bool) -> Int32Array;
pub type FreeIntsFn = unsafe extern "C" fn(arr: Int32Array);

/// Returns ERR_OK (0) or the native decode status code.
pub type DecodeFn =
    unsafe extern "C" fn(engine: *mut c_void, tokens: *const i32, len: usize) -> i32;

/// Returns next token id (>= 0) or a negative error code.
pub type SampleFn = unsafe extern "C" fn(engine: *mut c_void) -> i32;

pub type TokenToPieceFn = unsafe extern "C" fn(engine: *mut c_void, token_id: i32) -> EngineString;
pub type EosTokenFn = unsafe extern "C" fn(engine: *mut c_void) -> i32;

pub type ResetSamplerFn = unsafe extern "C" fn(
    engine: *mut c_void,
    temperature: f32,
    top_p: f32,
    top_k: i32,
    seed: u32,
);
pub type ClearContextFn = unsafe extern "C" fn(engine: *mut c_void);

pub type LastErrorFn = unsafe extern "C" fn() -> EngineString;
pub type FreeStringFn = unsafe extern "C" fn(s: EngineString);

// ---------- VTable ----------

#[repr(C)]
pub struct EngineApi {
    pub create: CreateEngineFn,
    pub destroy: DestroyEngineFn,

    pub load_model: LoadModelFn,
    pub unload_model: UnloadModelFn,
    pub is_loaded: IsLoadedFn,
    pub context_size: ContextSizeFn,
    pub model_info_json: ModelInfoJsonFn,

    pub tokenize: TokenizeFn,
    pub free_ints: FreeIntsFn,
    pub decode: DecodeFn,
    pub sample: SampleFn,
    pub token_to_piece: TokenToPieceFn,
    pub eos_token: EosTokenFn,

    pub reset_sampler: ResetSamplerFn,
    pub clear_context: ClearContextFn,

    // Diagnostics & memory management
    pub last_error: LastErrorFn,
    pub free_string: FreeStringFn,
}

#[repr(C)]
pub struct PluginApi {
    pub info: EngineInfo,
    pub engine: EngineApi,
}

/// Plugin must export `microllm_engine_entry_v1` returning a pointer to a static `PluginApi`.
pub type PluginEntryFn = unsafe extern "C" fn() -> *const PluginApi;
