use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use dossier_agent::KeywordClassifier;
use dossier_core::config::{AppConfig, LoadOptions, LogFormat, LoggingConfig};
use dossier_core::machine::SessionEngine;
use dossier_crm::HttpCrmClient;
use dossier_store::{SqlitePendingStore, SqliteSessionStore};
use dossier_telegram::{EventRouter, HttpTelegramApi, ReconnectPolicy, UpdateRunner};

pub fn run(config_path: Option<PathBuf>) -> Result<()> {
    let config = AppConfig::load(LoadOptions { config_path, require_file: false })
        .context("loading configuration")?;
    init_tracing(&config.logging);

    if !config.telegram_token_present() {
        anyhow::bail!("telegram.bot_token is not configured (set DOSSIER_TELEGRAM_BOT_TOKEN)");
    }
    if !config.crm_key_present() {
        anyhow::bail!("crm.api_key is not configured (set DOSSIER_CRM_API_KEY)");
    }

    let runtime = tokio::runtime::Runtime::new().context("starting tokio runtime")?;
    runtime.block_on(async move {
        let pool = dossier_store::connect_with_settings(
            &config.store.url,
            config.store.max_connections,
            config.store.timeout_secs,
        )
        .await
        .context("connecting to the session store")?;
        dossier_store::migrations::run_pending(&pool)
            .await
            .context("running store migrations")?;

        // The classifier is pluggable; without a wired LLM provider the
        // deterministic keyword fallback drives the conversation.
        if config.llm.api_key.is_some() {
            warn!(
                event_name = "run.llm_fallback",
                model = %config.llm.model,
                "llm.api_key is set but no provider client is wired; using the keyword classifier"
            );
        }

        let crm = Arc::new(HttpCrmClient::new(
            config.crm.api_base.clone(),
            config.crm.api_key.clone(),
            config.crm.timeout_secs,
        ));
        let engine = Arc::new(SessionEngine::new(
            Arc::new(SqliteSessionStore::new(pool.clone())),
            Arc::new(SqlitePendingStore::new(pool)),
            Arc::new(KeywordClassifier::new()),
            crm.clone(),
            crm,
        ));

        let api = Arc::new(HttpTelegramApi::new(
            config.telegram.bot_token.clone(),
            config.telegram.poll_timeout_secs,
        ));
        let router = Arc::new(EventRouter::new(engine, api.clone()));
        let runner = UpdateRunner::new(api, router, ReconnectPolicy::default());

        info!(event_name = "run.started", "dossier update loop starting");
        tokio::select! {
            result = runner.start() => result,
            _ = tokio::signal::ctrl_c() => {
                info!(event_name = "run.shutdown", "shutdown requested");
                Ok(())
            }
        }
    })
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(logging.level.clone()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match logging.format {
        LogFormat::Compact => builder.compact().init(),
        LogFormat::Pretty => builder.pretty().init(),
        LogFormat::Json => builder.json().init(),
    }
}
