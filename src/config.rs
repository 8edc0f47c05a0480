use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use candle::Device;

use crate::conversation::EmptyMessagePolicy;
use crate::prompts::PromptTemplate;

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:5000";
const DEFAULT_MODEL_ID: &str = "distilgpt2";
const DEFAULT_ASSETS_DB_PATH: &str = "assetsdb";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    /// Local snapshot directory (`MODEL_DIR`).
    Dir(PathBuf),
    /// Hugging Face hub repo id (`MODEL_ID`).
    Hub(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSpec {
    Cpu,
    Cuda(usize),
}

impl DeviceSpec {
    pub fn open(self) -> Result<Device> {
        match self {
            DeviceSpec::Cpu => Ok(Device::Cpu),
            DeviceSpec::Cuda(id) => Device::new_cuda(id)
                .with_context(|| format!("CUDA:{id} unavailable (built without `cuda`?)")),
        }
    }
}

impl FromStr for DeviceSpec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        match s.as_str() {
            "cpu" => Ok(DeviceSpec::Cpu),
            "cuda" | "gpu" => Ok(DeviceSpec::Cuda(0)),
            other => other
                .strip_prefix("cuda:")
                .and_then(|id| id.parse().ok())
                .map(DeviceSpec::Cuda)
                .ok_or_else(|| anyhow!("unknown device `{other}` (expected cpu, cuda or cuda:N)")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub model: ModelSource,
    pub device: DeviceSpec,
    pub assets_db_path: PathBuf,
    pub template: PromptTemplate,
    pub empty_message: EmptyMessagePolicy,
    pub seed: Option<u64>,
}

impl AppConfig {
    /// Reads `.env` (if any) and then the process environment.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let model = match get("MODEL_DIR") {
            Some(dir) => ModelSource::Dir(PathBuf::from(dir)),
            None => ModelSource::Hub(get("MODEL_ID").unwrap_or_else(|| DEFAULT_MODEL_ID.into())),
        };

        Ok(Self {
            bind_addr: get("BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.into()),
            model,
            device: parse_or("DEVICE", get("DEVICE"), DeviceSpec::Cpu)?,
            assets_db_path: PathBuf::from(
                get("ASSETS_DB_PATH").unwrap_or_else(|| DEFAULT_ASSETS_DB_PATH.into()),
            ),
            template: parse_or("PROMPT_TEMPLATE", get("PROMPT_TEMPLATE"), PromptTemplate::default())?,
            empty_message: parse_or(
                "EMPTY_MESSAGE_POLICY",
                get("EMPTY_MESSAGE_POLICY"),
                EmptyMessagePolicy::default(),
            )?,
            seed: get("GENERATION_SEED")
                .map(|raw| {
                    raw.trim()
                        .parse::<u64>()
                        .with_context(|| format!("GENERATION_SEED `{raw}` is not a u64"))
                })
                .transpose()?,
        })
    }
}

fn parse_or<T>(key: &str, raw: Option<String>, default: T) -> Result<T>
where
    T: FromStr<Err = anyhow::Error>,
{
    match raw {
        Some(raw) => raw.parse().with_context(|| format!("invalid {key}")),
        None => Ok(default),
    }
}
