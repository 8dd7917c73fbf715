//! Stable process identity
//!
//! A controller's name is the `origin` stamped into every message it
//! forwards; downstream idempotency keys on it. A restarted process MUST
//! resume the same name, so the identity comes from the environment and
//! never from anything random.

use std::sync::OnceLock;

use log::warn;

/// Cache so every caller sees one consistent identity per process
static ORIGIN: OnceLock<String> = OnceLock::new();

/// Returns this process's stable origin name.
///
/// Resolution order:
/// 1. `NODE_ID` env var (explicit override)
/// 2. `POD_NAME` env var (Kubernetes)
/// 3. `HOSTNAME` env var (CLI/VM deployments)
///
/// With none set, the literal `"unknown"` is used and a warning logged:
/// duplicate detection across a restart only works if the deployment pins
/// one of the variables.
pub fn origin_name() -> String {
    ORIGIN
        .get_or_init(|| {
            let base = std::env::var("NODE_ID")
                .ok()
                .or_else(|| std::env::var("POD_NAME").ok())
                .or_else(|| std::env::var("HOSTNAME").ok());

            let base = match base {
                Some(v) if !v.is_empty() => v,
                _ => {
                    warn!("No NODE_ID/POD_NAME/HOSTNAME set; origin falls back to 'unknown'");
                    "unknown".to_string()
                }
            };

            // Sanitize: origins travel inside wire messages and file names.
            base.chars()
                .map(|c| {
                    if c.is_alphanumeric() || c == '-' || c == '_' {
                        c.to_ascii_lowercase()
                    } else {
                        '-'
                    }
                })
                .collect::<String>()
                .trim_matches('-')
                .to_string()
        })
        .clone()
}
