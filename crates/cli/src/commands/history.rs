use serde::Serialize;
use toolcrib_core::{
    ApprovalDecision, ErrorKind, LedgerVerification, NoopNotificationDispatcher, Request,
    RequestId, StatusHistoryEntry, WorkflowError, WorkflowService,
};
use toolcrib_db::{connect_with_config, SqlRequestStorage};

use crate::commands::{prepare, CommandResult};

#[derive(Debug, Serialize)]
struct HistoryReport {
    command: &'static str,
    status: &'static str,
    request: Request,
    entries: Vec<StatusHistoryEntry>,
    decisions: Vec<ApprovalDecision>,
    verification: LedgerVerification,
}

pub fn run(request_id: &str) -> CommandResult {
    let (config, runtime) = match prepare("history") {
        Ok(prepared) => prepared,
        Err(failure) => return failure,
    };
    let request_id = RequestId(request_id.trim().to_string());

    let result = runtime.block_on(async {
        let pool = connect_with_config(&config.database)
            .await
            .map_err(|error| ("db_connectivity", error.to_string(), 4u8))?;

        let service =
            WorkflowService::new(SqlRequestStorage::new(pool.clone()), NoopNotificationDispatcher);
        let report = load_report(&service, &request_id).await.map_err(|error| {
            match error.kind() {
                ErrorKind::NotFound => ("not_found", error.to_string(), 7u8),
                _ => ("history_read", error.to_string(), 5u8),
            }
        });
        pool.close().await;
        report
    });

    match result {
        Ok(report) => {
            let exit_code = if report.verification.valid { 0 } else { 8 };
            CommandResult::report(exit_code, &report)
        }
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("history", error_class, message, exit_code)
        }
    }
}

async fn load_report(
    service: &WorkflowService<SqlRequestStorage, NoopNotificationDispatcher>,
    request_id: &RequestId,
) -> Result<HistoryReport, WorkflowError> {
    let request = service.get(request_id).await?;
    let entries = service.entries_for(request_id).await?;
    let decisions = service.decisions_for(request_id).await?;
    let verification = service.verify_history(request_id).await?;
    let status = if verification.valid { "ok" } else { "tampered" };

    Ok(HistoryReport { command: "history", status, request, entries, decisions, verification })
}
