//! Doctor command: local diagnostics.

use clap::Args;
use serde_json::{json, Value};

use berth::catalog::Catalog;

use crate::client::DaemonClient;
use crate::error::CliError;
use crate::utils::{emit, GlobalOptions};

/// Run local diagnostics.
#[derive(Args)]
pub struct DoctorCommand {}

struct Check {
    name: &'static str,
    ok: bool,
    detail: String,
}

impl DoctorCommand {
    /// Execute the command.
    pub fn execute(&self, global: &GlobalOptions) -> Result<(), CliError> {
        let mut checks = Vec::new();

        let settings = match global.settings() {
            Ok(settings) => settings,
            Err(e) => {
                // Without settings nothing else can run.
                checks.push(Check {
                    name: "config",
                    ok: false,
                    detail: e.to_string(),
                });
                return finish(global, &checks);
            }
        };

        checks.push(Check {
            name: "data-dir",
            ok: settings.data_dir.is_dir(),
            detail: settings.data_dir.display().to_string(),
        });

        match Catalog::from_config(&settings.config_file) {
            Ok(catalog) => {
                let warnings = catalog.warnings();
                checks.push(Check {
                    name: "catalog",
                    ok: true,
                    detail: if warnings.is_empty() {
                        format!("{} service types", catalog.len())
                    } else {
                        format!("{} warning(s): {}", warnings.len(), warnings.join("; "))
                    },
                });
            }
            Err(e) => checks.push(Check {
                name: "catalog",
                ok: false,
                detail: e.to_string(),
            }),
        }

        let token_path = settings.token_path();
        checks.push(Check {
            name: "auth-token",
            ok: true,
            detail: if token_path.exists() {
                token_path.display().to_string()
            } else {
                "no token yet; it is minted on first daemon start".to_string()
            },
        });

        let state_path = settings.state_path();
        let state_ok = !state_path.exists()
            || std::fs::read_to_string(&state_path)
                .map(|raw| serde_json::from_str::<Value>(&raw).is_ok())
                .unwrap_or(false);
        checks.push(Check {
            name: "state-snapshot",
            ok: state_ok,
            detail: if state_path.exists() {
                state_path.display().to_string()
            } else {
                "no snapshot yet".to_string()
            },
        });

        let client = DaemonClient::from_settings(&settings);
        match client.get("/status") {
            Ok(body) => checks.push(Check {
                name: "daemon",
                ok: true,
                detail: format!(
                    "up {}s at {}",
                    body.get("uptime").and_then(Value::as_u64).unwrap_or(0),
                    client.base_url()
                ),
            }),
            Err(_) => checks.push(Check {
                name: "daemon",
                ok: false,
                detail: format!("unreachable at {}", client.base_url()),
            }),
        }

        finish(global, &checks)
    }
}

fn finish(global: &GlobalOptions, checks: &[Check]) -> Result<(), CliError> {
    let lines: Vec<String> = checks
        .iter()
        .map(|check| {
            format!(
                "{} {:<16} {}",
                if check.ok { "ok " } else { "FAIL" },
                check.name,
                check.detail
            )
        })
        .collect();
    let payload = json!({
        "checks": checks
            .iter()
            .map(|c| json!({ "name": c.name, "ok": c.ok, "detail": c.detail }))
            .collect::<Vec<_>>(),
    });
    emit(global, &lines.join("\n"), &payload);

    let failed = checks.iter().filter(|check| !check.ok).count();
    if failed > 0 {
        return Err(CliError::SemanticFailure(format!(
            "{failed} check(s) failed"
        )));
    }
    Ok(())
}
