use clap::Parser;
use std::path::PathBuf;
use tracing::Level;

pub const DEFAULT_CHAT_MODEL: &str = "gemini-1.5-flash";

/// Deutsch mit Mari: a German tutor in the terminal.
#[derive(Parser, Debug, Default)]
#[command(version, about)]
pub struct Args {
    /// Directory holding the saved sessions (overrides MARI_DATA_DIR).
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
    /// Directory with the prompt files (overrides PROMPTS_PATH).
    #[arg(long)]
    pub prompts: Option<PathBuf>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

#[derive(Clone, Debug)]
pub struct Config {
    pub gemini_api_key: Option<String>,
    /// When set, one-shot calls go to a running `mari-api` instead of Gemini.
    pub gateway_url: Option<String>,
    pub chat_model: String,
    pub live_model: Option<String>,
    pub live_voice: Option<String>,
    pub data_dir: PathBuf,
    pub input_device: Option<String>,
    pub output_device: Option<String>,
    pub log_level: Level,
    pub prompts_path: PathBuf,
}

fn non_empty(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    /// Loads configuration from the environment, with `args` taking precedence.
    pub fn from_env(args: &Args) -> Result<Self, ConfigError> {
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let gemini_api_key = non_empty("GEMINI_API_KEY");
        let gateway_url = non_empty("GATEWAY_URL");
        if gemini_api_key.is_none() && gateway_url.is_none() {
            return Err(ConfigError::MissingVar(
                "GEMINI_API_KEY must be set unless GATEWAY_URL is".to_string(),
            ));
        }

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        let data_dir = args
            .data_dir
            .clone()
            .or_else(|| non_empty("MARI_DATA_DIR").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("./.mari"));
        let prompts_path = args
            .prompts
            .clone()
            .or_else(|| non_empty("PROMPTS_PATH").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("./prompts"));

        Ok(Self {
            gemini_api_key,
            gateway_url,
            chat_model: non_empty("CHAT_MODEL").unwrap_or_else(|| DEFAULT_CHAT_MODEL.to_string()),
            live_model: non_empty("LIVE_MODEL"),
            live_voice: non_empty("LIVE_VOICE"),
            data_dir,
            input_device: non_empty("INPUT_DEVICE"),
            output_device: non_empty("OUTPUT_DEVICE"),
            log_level,
            prompts_path,
        })
    }
}
