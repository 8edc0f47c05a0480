use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use super::{GenerationParameters, LanguageModel};

/// What the scripted model appends after the prompt.
pub enum Script {
    /// Echo the prompt, then append this text.
    Continue(String),
    /// Drop the prompt and emit only this text.
    Replace(String),
    /// Append one word picked with the request's seed.
    Pick(Vec<&'static str>),
    Fail(String),
    Panic,
}

/// Byte-level stand-in for a causal LM: one token per UTF-8 byte.
pub struct ScriptedModel {
    script: Script,
    max_context: usize,
    generate_calls: AtomicUsize,
    last_input: Mutex<Vec<u32>>,
}

impl ScriptedModel {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            max_context: 1 << 20,
            generate_calls: AtomicUsize::new(0),
            last_input: Mutex::new(Vec::new()),
        }
    }

    pub fn continuing(text: &str) -> Self {
        Self::new(Script::Continue(text.to_string()))
    }

    pub fn with_max_context(mut self, max_context: usize) -> Self {
        self.max_context = max_context;
        self
    }

    pub fn generate_calls(&self) -> usize {
        self.generate_calls.load(Ordering::SeqCst)
    }

    pub fn last_input_text(&self) -> String {
        let tokens = self.last_input.lock().expect("last_input lock").clone();
        bytes_to_text(&tokens)
    }
}

impl LanguageModel for ScriptedModel {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        Ok(text.bytes().map(u32::from).collect())
    }

    fn generate(&self, tokens: &[u32], params: &GenerationParameters) -> Result<Vec<u32>> {
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_input.lock().expect("last_input lock") = tokens.to_vec();

        let (mut out, tail) = match &self.script {
            Script::Continue(text) => (tokens.to_vec(), text.clone()),
            Script::Replace(text) => (Vec::new(), text.clone()),
            Script::Pick(words) => {
                let mut rng = StdRng::seed_from_u64(params.resolve_seed());
                let word = words.choose(&mut rng).copied().unwrap_or_default();
                (tokens.to_vec(), format!(" {word}"))
            }
            Script::Fail(reason) => return Err(anyhow!("{reason}")),
            Script::Panic => panic!("scripted model panicked"),
        };
        out.extend(tail.bytes().map(u32::from));
        Ok(out)
    }

    fn decode(&self, tokens: &[u32]) -> Result<String> {
        Ok(bytes_to_text(tokens))
    }

    fn max_context(&self) -> usize {
        self.max_context
    }
}

fn bytes_to_text(tokens: &[u32]) -> String {
    let bytes: Vec<u8> = tokens.iter().map(|t| *t as u8).collect();
    String::from_utf8_lossy(&bytes).into_owned()
}
