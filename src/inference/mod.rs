pub mod gpt2;

#[cfg(test)]
pub mod testing;

use anyhow::Result;

pub const MAX_NEW_TOKENS: usize = 150;
pub const TEMPERATURE: f64 = 0.7;
pub const TOP_P: f64 = 0.9;

/// Decoding knobs for a single generation. Not request-configurable; only the
/// seed can be pinned, and only from process configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParameters {
    pub max_new_tokens: usize,
    pub temperature: f64,
    pub top_p: f64,
    pub do_sample: bool,
    pub seed: Option<u64>,
}

impl Default for GenerationParameters {
    fn default() -> Self {
        Self {
            max_new_tokens: MAX_NEW_TOKENS,
            temperature: TEMPERATURE,
            top_p: TOP_P,
            do_sample: true,
            seed: None,
        }
    }
}

impl GenerationParameters {
    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    /// `None` selects greedy argmax decoding.
    pub fn sampling_temperature(&self) -> Option<f64> {
        self.do_sample.then_some(self.temperature)
    }

    pub fn sampling_top_p(&self) -> Option<f64> {
        self.do_sample.then_some(self.top_p)
    }

    pub fn resolve_seed(&self) -> u64 {
        self.seed.unwrap_or_else(rand::random)
    }
}

/// Blocking causal-LM engine. One instance is shared process-wide, so
/// implementations serialize whatever internal state sampling mutates.
pub trait LanguageModel: Send + Sync {
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    /// Returns `tokens` followed by the newly sampled continuation.
    fn generate(&self, tokens: &[u32], params: &GenerationParameters) -> Result<Vec<u32>>;

    /// Detokenizes with model control tokens removed.
    fn decode(&self, tokens: &[u32]) -> Result<String>;

    /// Maximum number of positions the model attends over.
    fn max_context(&self) -> usize;
}

#[cfg(test)]
mod tests {
    use super::GenerationParameters;

    #[test]
    fn defaults_match_fixed_sampling_profile() {
        let params = GenerationParameters::default();
        assert_eq!(params.max_new_tokens, 150);
        assert_eq!(params.sampling_temperature(), Some(0.7));
        assert_eq!(params.sampling_top_p(), Some(0.9));
        assert!(params.do_sample);
        assert!(params.seed.is_none());
    }

    #[test]
    fn greedy_disables_temperature_and_nucleus() {
        let params = GenerationParameters {
            do_sample: false,
            ..GenerationParameters::default()
        };
        assert_eq!(params.sampling_temperature(), None);
        assert_eq!(params.sampling_top_p(), None);
    }

    #[test]
    fn pinned_seed_is_reused() {
        let params = GenerationParameters::default().with_seed(Some(42));
        assert_eq!(params.resolve_seed(), 42);
        assert_eq!(params.resolve_seed(), 42);
    }
}
