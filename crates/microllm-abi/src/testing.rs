//! Deterministic in-process engine for tests.
//!
//! Tokenization is one token per `char`, with a handful of special markers
//! recognised as single tokens. The KV cache is a plain `Vec<Token>`, so tests
//! can read back exactly which text was decoded. Replies are a pure function of
//! the decoded prompt, which makes cache contamination observable.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::backend::{LoadParams, NativeEngine};
use crate::metadata::ModelCoreInfo;
use crate::sampling::SamplingParams;
use crate::token::Token;

pub const BOS: Token = Token(1);
pub const EOS: Token = Token(2);

/// Special markers tokenized as a single id each.
pub const SPECIALS: &[(&str, i32)] = &[
    ("<|im_end|>", 3),
    ("<|im_start|>", 4),
    ("<|eot_id|>", 5),
    ("<end_of_turn>", 6),
    ("<|end|>", 7),
];

pub const IM_END: Token = Token(3);

const BYTE_BASE: i32 = 256;
const CHAR_BASE: i32 = 1_000;

type ReplyFn = Box<dyn Fn(&str) -> String + Send>;

struct State {
    loaded: bool,
    context_size: usize,
    model_info: ModelCoreInfo,
    kv: Vec<Token>,
    /// KV position where the current generation started, if one is running.
    generation_start: Option<usize>,
    /// Last sampled token, used to recognise single-token generation decodes.
    last_sampled: Option<Token>,

    reply: ReplyFn,
    emit_end: Option<Token>,
    byte_level: bool,
    sample_delay: Duration,

    fail_load: Option<String>,
    fail_tokenize_containing: Option<String>,
    fail_decode_containing: Option<String>,
    fail_decode_after: Option<usize>,

    decode_calls: usize,
    clear_calls: usize,
    tokenize_log: Vec<(String, bool)>,
    sampler_resets: Vec<SamplingParams>,
    loads: Vec<(String, LoadParams)>,
}

impl State {
    fn new() -> Self {
        Self {
            loaded: false,
            context_size: 0,
            model_info: ModelCoreInfo::default(),
            kv: Vec::new(),
            generation_start: None,
            last_sampled: None,
            reply: Box::new(default_reply),
            emit_end: Some(EOS),
            byte_level: false,
            sample_delay: Duration::ZERO,
            fail_load: None,
            fail_tokenize_containing: None,
            fail_decode_containing: None,
            fail_decode_after: None,
            decode_calls: 0,
            clear_calls: 0,
            tokenize_log: Vec::new(),
            sampler_resets: Vec::new(),
            loads: Vec::new(),
        }
    }
}

/// `reply-NNNN.` where NNNN depends on every decoded prompt character.
fn default_reply(prompt: &str) -> String {
    let mut h = DefaultHasher::new();
    prompt.hash(&mut h);
    format!("reply-{:04}.", h.finish() % 10_000)
}

fn piece_of(token: Token) -> Vec<u8> {
    let id = token.0;
    if let Some((s, _)) = SPECIALS.iter().find(|(_, sid)| *sid == id) {
        return s.as_bytes().to_vec();
    }
    if (BYTE_BASE..BYTE_BASE + 256).contains(&id) {
        return vec![(id - BYTE_BASE) as u8];
    }
    if id >= CHAR_BASE {
        if let Some(c) = char::from_u32((id - CHAR_BASE) as u32) {
            return c.to_string().into_bytes();
        }
    }
    Vec::new()
}

fn text_of(tokens: &[Token]) -> String {
    let bytes: Vec<u8> = tokens.iter().flat_map(|t| piece_of(*t)).collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

fn tokenize_text(text: &str) -> Vec<Token> {
    let mut out = Vec::with_capacity(text.len());
    let mut rest = text;
    'outer: while !rest.is_empty() {
        for (s, id) in SPECIALS {
            if let Some(tail) = rest.strip_prefix(s) {
                out.push(Token(*id));
                rest = tail;
                continue 'outer;
            }
        }
        let mut chars = rest.chars();
        if let Some(c) = chars.next() {
            out.push(Token(CHAR_BASE + c as i32));
        }
        rest = chars.as_str();
    }
    out
}

/// Engine half; move it into the session.
pub struct ScriptedEngine {
    state: Arc<Mutex<State>>,
}

/// Test half; inspects the cache and injects faults.
#[derive(Clone)]
pub struct EngineProbe {
    state: Arc<Mutex<State>>,
}

impl ScriptedEngine {
    pub fn new() -> (Self, EngineProbe) {
        let state = Arc::new(Mutex::new(State::new()));
        (
            Self {
                state: Arc::clone(&state),
            },
            EngineProbe { state },
        )
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl NativeEngine for ScriptedEngine {
    fn load_model(&mut self, model_path: &Path, params: &LoadParams) -> Result<(), String> {
        let mut s = self.lock();
        if let Some(msg) = s.fail_load.clone() {
            return Err(msg);
        }
        s.loads.push((model_path.to_string_lossy().into_owned(), *params));
        s.loaded = true;
        s.context_size = params.context_size as usize;
        s.kv.clear();
        s.generation_start = None;
        s.last_sampled = None;
        Ok(())
    }

    fn unload_model(&mut self) -> Result<(), String> {
        let mut s = self.lock();
        s.loaded = false;
        s.context_size = 0;
        s.kv.clear();
        s.generation_start = None;
        Ok(())
    }

    fn is_loaded(&self) -> bool {
        self.lock().loaded
    }

    fn context_size(&self) -> usize {
        self.lock().context_size
    }

    fn model_info(&self) -> ModelCoreInfo {
        self.lock().model_info.clone()
    }

    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<Token>, String> {
        let mut s = self.lock();
        if !s.loaded {
            return Err("model not loaded".into());
        }
        s.tokenize_log.push((text.to_string(), add_bos));
        if let Some(needle) = &s.fail_tokenize_containing {
            if text.contains(needle.as_str()) {
                return Err(format!("tokenize rejected text containing {needle:?}"));
            }
        }
        let mut out = Vec::with_capacity(text.len() + 1);
        if add_bos {
            out.push(BOS);
        }
        out.extend(tokenize_text(text));
        Ok(out)
    }

    fn decode(&mut self, tokens: &[Token]) -> Result<(), String> {
        let mut guard = self.lock();
        let s = &mut *guard;
        if !s.loaded {
            return Err("context not loaded".into());
        }
        s.decode_calls += 1;

        let failing = match (&s.fail_decode_containing, s.fail_decode_after) {
            (Some(needle), _) if text_of(tokens).contains(needle.as_str()) => true,
            (_, Some(0)) => true,
            _ => false,
        };
        if let Some(n) = s.fail_decode_after.as_mut() {
            *n = n.saturating_sub(1);
        }
        if failing {
            // Native decode is batched; half the tokens land before the failure.
            let half = tokens.len() / 2;
            s.kv.extend_from_slice(&tokens[..half]);
            s.generation_start = None;
            return Err("decode failed (status 1)".into());
        }

        if s.kv.len() + tokens.len() > s.context_size {
            return Err(format!(
                "context overflow: {} + {} > {}",
                s.kv.len(),
                tokens.len(),
                s.context_size
            ));
        }

        let continues_generation =
            tokens.len() == 1 && s.generation_start.is_some() && s.last_sampled == Some(tokens[0]);
        if !continues_generation {
            s.generation_start = None;
        }
        s.kv.extend_from_slice(tokens);
        Ok(())
    }

    fn sample(&mut self) -> Result<Token, String> {
        let delay = self.lock().sample_delay;
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        let mut guard = self.lock();
        let s = &mut *guard;
        if !s.loaded {
            return Err("context not loaded".into());
        }
        let kv_len = s.kv.len();
        let start = *s.generation_start.get_or_insert(kv_len);
        let prompt = text_of(&s.kv[..start]);
        let produced = s.kv.len() - start;
        let reply = (s.reply)(&prompt);

        let script: Vec<Token> = if s.byte_level {
            reply.bytes().map(|b| Token(BYTE_BASE + b as i32)).collect()
        } else {
            tokenize_text(&reply)
        };

        let token = match script.get(produced) {
            Some(t) => *t,
            None => match s.emit_end {
                Some(end) => end,
                // Endless: keep cycling the reply.
                None if !script.is_empty() => script[produced % script.len()],
                None => Token(CHAR_BASE + '.' as i32),
            },
        };
        s.last_sampled = Some(token);
        Ok(token)
    }

    fn token_to_piece(&self, token: Token) -> Result<Vec<u8>, String> {
        Ok(piece_of(token))
    }

    fn eos_token(&self) -> Token {
        EOS
    }

    fn reset_sampler(&mut self, params: &SamplingParams) {
        self.lock().sampler_resets.push(params.normalized());
    }

    fn clear_context(&mut self) {
        let mut s = self.lock();
        s.clear_calls += 1;
        s.kv.clear();
        s.generation_start = None;
    }
}

impl EngineProbe {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Text of everything resident in the KV cache (BOS/EOS render empty).
    pub fn kv_text(&self) -> String {
        text_of(&self.lock().kv)
    }

    pub fn kv_tokens(&self) -> Vec<Token> {
        self.lock().kv.clone()
    }

    pub fn kv_len(&self) -> usize {
        self.lock().kv.len()
    }

    /// Replace the reply policy; it receives the decoded prompt text.
    pub fn set_reply<F>(&self, f: F)
    where
        F: Fn(&str) -> String + Send + 'static,
    {
        self.lock().reply = Box::new(f);
    }

    /// Token emitted after the reply is exhausted; `None` never ends.
    pub fn set_end_token(&self, end: Option<Token>) {
        self.lock().emit_end = end;
    }

    /// Emit replies one byte per token instead of one char per token.
    pub fn set_byte_level(&self, on: bool) {
        self.lock().byte_level = on;
    }

    pub fn set_sample_delay(&self, delay: Duration) {
        self.lock().sample_delay = delay;
    }

    pub fn set_model_info(&self, info: ModelCoreInfo) {
        self.lock().model_info = info;
    }

    pub fn fail_load(&self, msg: Option<&str>) {
        self.lock().fail_load = msg.map(str::to_string);
    }

    pub fn fail_tokenize_containing(&self, needle: Option<&str>) {
        self.lock().fail_tokenize_containing = needle.map(str::to_string);
    }

    pub fn fail_decode_containing(&self, needle: Option<&str>) {
        self.lock().fail_decode_containing = needle.map(str::to_string);
    }

    /// Let `n` more decode calls succeed, then fail every following call.
    pub fn fail_decode_after(&self, n: Option<usize>) {
        self.lock().fail_decode_after = n;
    }

    pub fn decode_calls(&self) -> usize {
        self.lock().decode_calls
    }

    pub fn clear_calls(&self) -> usize {
        self.lock().clear_calls
    }

    /// Every `(text, add_bos)` pair passed to `tokenize`, oldest first.
    pub fn tokenize_log(&self) -> Vec<(String, bool)> {
        self.lock().tokenize_log.clone()
    }

    pub fn sampler_resets(&self) -> Vec<SamplingParams> {
        self.lock().sampler_resets.clone()
    }

    pub fn loads(&self) -> Vec<(String, LoadParams)> {
        self.lock().loads.clone()
    }

    pub fn is_loaded(&self) -> bool {
        self.lock().loaded
    }
}
