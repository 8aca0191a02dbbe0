use serde::{Deserialize, Serialize};

/// Sampler knobs handed to `NativeEngine::reset_sampler`.
/// Engines build their sampler chain from the *normalized* form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    /// If true, pick argmax and ignore the stochastic knobs.
    pub greedy: bool,
    pub temperature: Option<f32>, // > 0.0 enables temperature scaling
    pub top_k: Option<u32>,       // >= 1 keeps the K most likely candidates
    pub top_p: Option<f32>,       // (0, 1) nucleus sampling; 1.0 is a no-op
    /// Seed for the final distribution sampler.
    pub seed: u32,
}

pub const DEFAULT_SEED: u32 = 42;

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            greedy: false,
            temperature: Some(0.7),
            top_k: Some(40),
            top_p: Some(0.9),
            seed: DEFAULT_SEED,
        }
    }
}

impl SamplingParams {
    /// Build from the raw caller triple (temperature, top-p, top-k).
    pub fn from_triple(temperature: f32, top_p: f32, top_k: i32) -> Self {
        Self {
            greedy: false,
            temperature: Some(temperature),
            top_k: u32::try_from(top_k).ok(),
            top_p: Some(top_p),
            seed: DEFAULT_SEED,
        }
    }

    /// Deterministic argmax sampling.
    pub fn greedy() -> Self {
        Self {
            greedy: true,
            temperature: None,
            top_k: None,
            top_p: None,
            seed: DEFAULT_SEED,
        }
    }

    /// Returns a conflict-free version of these parameters.
    ///
    /// Rules (same order a native chain is assembled: top-k -> top-p -> temp -> dist):
    /// - top_k < 1 -> dropped
    /// - top_p outside (0, 1) -> dropped (1.0 keeps everything anyway)
    /// - temperature <= 0 or NaN -> greedy
    /// - greedy drops every other knob
    pub fn normalized(&self) -> Self {
        let mut p = self.clone();

        if let Some(k) = p.top_k {
            if k < 1 {
                p.top_k = None;
            }
        }
        if let Some(tp) = p.top_p {
            if !(tp > 0.0 && tp < 1.0) {
                p.top_p = None;
            }
        }
        match p.temperature {
            Some(t) if t > 0.0 => {}
            _ => p.greedy = true,
        }

        if p.greedy {
            p.temperature = None;
            p.top_k = None;
            p.top_p = None;
        }
        p
    }
}
