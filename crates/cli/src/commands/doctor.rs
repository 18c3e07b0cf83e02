use serde::Serialize;

use dossier_core::config::{AppConfig, LoadOptions};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: &'static str,
    status: CheckStatus,
    details: String,
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

/// Returns the rendered report and whether every non-skipped check passed.
pub fn run(json_output: bool) -> (String, bool) {
    let report = build_report();
    let healthy = report.overall_status == CheckStatus::Pass;

    let output = if json_output {
        serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!("{{\"overall_status\":\"fail\",\"summary\":\"doctor serialization failed: {error}\"}}")
        })
    } else {
        render_human(&report)
    };
    (output, healthy)
}

fn build_report() -> DoctorReport {
    let mut checks = Vec::new();

    match AppConfig::load(LoadOptions::default()) {
        Ok(config) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Pass,
                details: "configuration loaded and validated".to_owned(),
            });
            checks.push(token_check(
                "telegram_token",
                config.telegram_token_present(),
                "DOSSIER_TELEGRAM_BOT_TOKEN",
            ));
            checks.push(token_check("crm_api_key", config.crm_key_present(), "DOSSIER_CRM_API_KEY"));
            checks.push(store_check(&config));
        }
        Err(error) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Fail,
                details: error.to_string(),
            });
        }
    }

    let overall_status = if checks.iter().any(|check| check.status == CheckStatus::Fail) {
        CheckStatus::Fail
    } else {
        CheckStatus::Pass
    };
    let summary = match overall_status {
        CheckStatus::Pass => "all checks passed".to_owned(),
        _ => "one or more checks failed".to_owned(),
    };
    DoctorReport { overall_status, summary, checks }
}

fn token_check(name: &'static str, present: bool, env_var: &str) -> DoctorCheck {
    if present {
        DoctorCheck { name, status: CheckStatus::Pass, details: "token configured".to_owned() }
    } else {
        DoctorCheck {
            name,
            status: CheckStatus::Skipped,
            details: format!("not configured (set {env_var})"),
        }
    }
}

fn store_check(config: &AppConfig) -> DoctorCheck {
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(error) => {
            return DoctorCheck {
                name: "store_connectivity",
                status: CheckStatus::Fail,
                details: format!("could not start runtime: {error}"),
            };
        }
    };

    let result: Result<(), String> = runtime.block_on(async {
        let pool = dossier_store::connect_with_settings(
            &config.store.url,
            config.store.max_connections,
            config.store.timeout_secs,
        )
        .await
        .map_err(|error| error.to_string())?;
        dossier_store::migrations::run_pending(&pool)
            .await
            .map_err(|error| error.to_string())?;
        Ok(())
    });

    match result {
        Ok(()) => DoctorCheck {
            name: "store_connectivity",
            status: CheckStatus::Pass,
            details: format!("connected and migrated `{}`", config.store.url),
        },
        Err(details) => {
            DoctorCheck { name: "store_connectivity", status: CheckStatus::Fail, details }
        }
    }
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = vec![format!("dossier doctor — {}", report.summary)];
    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Fail => "FAIL",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("  [{marker:>4}] {}: {}", check.name, check.details));
    }
    lines.join("\n")
}
