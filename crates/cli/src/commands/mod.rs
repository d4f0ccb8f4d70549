pub mod config;
pub mod doctor;
pub mod history;
pub mod migrate;
pub mod seed;

use serde::Serialize;
use tokio::runtime::Runtime;
use toolcrib_core::config::{AppConfig, LoadOptions};

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: u8,
    pub output: String,
}

#[derive(Debug, Serialize)]
struct CommandOutcome {
    command: String,
    status: String,
    error_class: Option<String>,
    message: String,
}

impl CommandResult {
    pub fn success(command: &str, message: impl Into<String>) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "ok".to_string(),
            error_class: None,
            message: message.into(),
        };
        Self { exit_code: 0, output: serialize_payload(&payload) }
    }

    pub fn failure(
        command: &str,
        error_class: &str,
        message: impl Into<String>,
        exit_code: u8,
    ) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "error".to_string(),
            error_class: Some(error_class.to_string()),
            message: message.into(),
        };
        Self { exit_code, output: serialize_payload(&payload) }
    }

    /// Pretty-printed report for commands whose output is more than a status line.
    pub fn report(exit_code: u8, report: &impl Serialize) -> Self {
        Self { exit_code, output: serialize_pretty(report) }
    }
}

/// Loads config and a single-threaded runtime, the shared preamble of every DB-backed command.
pub(crate) fn prepare(command: &str) -> Result<(AppConfig, Runtime), CommandResult> {
    let config = AppConfig::load(LoadOptions::default()).map_err(|error| {
        CommandResult::failure(
            command,
            "config_validation",
            format!("configuration issue: {error}"),
            2,
        )
    })?;

    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().map_err(
        |error| {
            CommandResult::failure(
                command,
                "runtime_init",
                format!("failed to initialize async runtime: {error}"),
                3,
            )
        },
    )?;

    Ok((config, runtime))
}

fn serialize_payload(payload: &impl Serialize) -> String {
    serde_json::to_string(payload).unwrap_or_else(|error| serialization_failure(&error))
}

fn serialize_pretty(payload: &impl Serialize) -> String {
    serde_json::to_string_pretty(payload).unwrap_or_else(|error| serialization_failure(&error))
}

fn serialization_failure(error: &serde_json::Error) -> String {
    format!(
        "{{\"command\":\"unknown\",\"status\":\"error\",\"error_class\":\"serialization\",\"message\":\"{}\"}}",
        error.to_string().replace('\\', "\\\\").replace('"', "\\\"")
    )
}
