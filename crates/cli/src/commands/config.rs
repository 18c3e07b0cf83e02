use dossier_core::config::{AppConfig, LoadOptions, LogFormat};

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("configuration error: {error}"),
    };

    let format = match config.logging.format {
        LogFormat::Compact => "compact",
        LogFormat::Pretty => "pretty",
        LogFormat::Json => "json",
    };

    [
        "effective configuration:".to_owned(),
        format!("  store.url              = {}", config.store.url),
        format!("  store.max_connections  = {}", config.store.max_connections),
        format!("  telegram.bot_token     = {}", redact(config.telegram_token_present())),
        format!("  telegram.poll_timeout  = {}s", config.telegram.poll_timeout_secs),
        format!("  crm.api_base           = {}", config.crm.api_base),
        format!("  crm.api_key            = {}", redact(config.crm_key_present())),
        format!("  llm.model              = {}", config.llm.model),
        format!("  llm.api_key            = {}", redact(config.llm.api_key.is_some())),
        format!("  logging.level          = {}", config.logging.level),
        format!("  logging.format         = {format}"),
    ]
    .join("\n")
}

fn redact(present: bool) -> &'static str {
    if present {
        "******** (set)"
    } else {
        "(not set)"
    }
}
