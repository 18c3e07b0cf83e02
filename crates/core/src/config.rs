use std::env;
use std::fs;
use std::path::PathBuf;

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub store: StoreConfig,
    pub telegram: TelegramConfig,
    pub crm: CrmConfig,
    pub llm: LlmConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct StoreConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct TelegramConfig {
    pub bot_token: SecretString,
    pub poll_timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct CrmConfig {
    pub api_base: String,
    pub api_key: SecretString,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub api_key: Option<SecretString>,
    pub base_url: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig {
                url: "sqlite://dossier.db".to_owned(),
                max_connections: 5,
                timeout_secs: 30,
            },
            telegram: TelegramConfig { bot_token: String::new().into(), poll_timeout_secs: 30 },
            crm: CrmConfig {
                api_base: "https://api.attio.com".to_owned(),
                api_key: String::new().into(),
                timeout_secs: 30,
            },
            llm: LlmConfig {
                api_key: None,
                base_url: None,
                model: "claude-sonnet-4-5".to_owned(),
                timeout_secs: 30,
                max_retries: 2,
            },
            logging: LoggingConfig { level: "info".to_owned(), format: LogFormat::Compact },
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    store: Option<StorePatch>,
    telegram: Option<TelegramPatch>,
    crm: Option<CrmPatch>,
    llm: Option<LlmPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct StorePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct TelegramPatch {
    bot_token: Option<String>,
    poll_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct CrmPatch {
    api_base: Option<String>,
    api_key: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    timeout_secs: Option<u64>,
    max_retries: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

impl AppConfig {
    /// Defaults, then the TOML file (if any), then environment variables.
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        let path = options
            .config_path
            .clone()
            .or_else(|| {
                let default = PathBuf::from("dossier.toml");
                default.exists().then_some(default)
            });

        if let Some(path) = path {
            if path.exists() {
                let raw = fs::read_to_string(&path)
                    .map_err(|source| ConfigError::ReadFile { path: path.clone(), source })?;
                let patch: ConfigPatch = toml::from_str(&raw)
                    .map_err(|source| ConfigError::ParseFile { path: path.clone(), source })?;
                config.apply_patch(patch);
            } else if options.require_file {
                return Err(ConfigError::MissingConfigFile(path));
            }
        } else if options.require_file {
            return Err(ConfigError::MissingConfigFile(PathBuf::from("dossier.toml")));
        }

        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(store) = patch.store {
            if let Some(url) = store.url {
                self.store.url = url;
            }
            if let Some(max_connections) = store.max_connections {
                self.store.max_connections = max_connections;
            }
            if let Some(timeout_secs) = store.timeout_secs {
                self.store.timeout_secs = timeout_secs;
            }
        }
        if let Some(telegram) = patch.telegram {
            if let Some(token) = telegram.bot_token {
                self.telegram.bot_token = token.into();
            }
            if let Some(poll_timeout_secs) = telegram.poll_timeout_secs {
                self.telegram.poll_timeout_secs = poll_timeout_secs;
            }
        }
        if let Some(crm) = patch.crm {
            if let Some(api_base) = crm.api_base {
                self.crm.api_base = api_base;
            }
            if let Some(api_key) = crm.api_key {
                self.crm.api_key = api_key.into();
            }
            if let Some(timeout_secs) = crm.timeout_secs {
                self.crm.timeout_secs = timeout_secs;
            }
        }
        if let Some(llm) = patch.llm {
            if let Some(api_key) = llm.api_key {
                self.llm.api_key = Some(api_key.into());
            }
            if let Some(base_url) = llm.base_url {
                self.llm.base_url = Some(base_url);
            }
            if let Some(model) = llm.model {
                self.llm.model = model;
            }
            if let Some(timeout_secs) = llm.timeout_secs {
                self.llm.timeout_secs = timeout_secs;
            }
            if let Some(max_retries) = llm.max_retries {
                self.llm.max_retries = max_retries;
            }
        }
        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env(&mut self) {
        if let Ok(url) = env::var("DOSSIER_STORE_URL") {
            self.store.url = url;
        }
        if let Ok(token) = env::var("DOSSIER_TELEGRAM_BOT_TOKEN") {
            self.telegram.bot_token = token.into();
        }
        if let Ok(api_base) = env::var("DOSSIER_CRM_API_BASE") {
            self.crm.api_base = api_base;
        }
        if let Ok(api_key) = env::var("DOSSIER_CRM_API_KEY") {
            self.crm.api_key = api_key.into();
        }
        if let Ok(api_key) = env::var("DOSSIER_LLM_API_KEY") {
            self.llm.api_key = Some(api_key.into());
        }
        if let Ok(model) = env::var("DOSSIER_LLM_MODEL") {
            self.llm.model = model;
        }
        if let Ok(level) = env::var("DOSSIER_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = env::var("DOSSIER_LOG_FORMAT") {
            if let Ok(format) = format.parse() {
                self.logging.format = format;
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.store.url.trim().is_empty() {
            return Err(ConfigError::Validation("store.url must not be empty".to_owned()));
        }
        if self.store.max_connections == 0 {
            return Err(ConfigError::Validation(
                "store.max_connections must be at least 1".to_owned(),
            ));
        }
        if self.crm.api_base.trim().is_empty() {
            return Err(ConfigError::Validation("crm.api_base must not be empty".to_owned()));
        }
        Ok(())
    }

    pub fn telegram_token_present(&self) -> bool {
        !self.telegram.bot_token.expose_secret().trim().is_empty()
    }

    pub fn crm_key_present(&self) -> bool {
        !self.crm.api_key.expose_secret().trim().is_empty()
    }
}
