use toolcrib_core::{
    ActorRole, NoopNotificationDispatcher, RequestDraft, RequestId, RequestPatch, RequestState,
    WorkflowAction, WorkflowError, WorkflowService, WorkflowSettings,
};
use toolcrib_db::{connect_with_config, migrations, SqlRequestStorage};

use crate::commands::{prepare, CommandResult};

type SeedService = WorkflowService<SqlRequestStorage, NoopNotificationDispatcher>;

struct SeededFlow {
    label: &'static str,
    request_id: String,
    state: RequestState,
    history_entries: usize,
}

pub fn run() -> CommandResult {
    let (config, runtime) = match prepare("seed") {
        Ok(prepared) => prepared,
        Err(failure) => return failure,
    };

    let result = runtime.block_on(async {
        let pool = connect_with_config(&config.database)
            .await
            .map_err(|error| ("db_connectivity", error.to_string(), 4u8))?;

        migrations::run_pending(&pool)
            .await
            .map_err(|error| ("migration", error.to_string(), 5u8))?;

        let service = WorkflowService::new(
            SqlRequestStorage::new(pool.clone()),
            NoopNotificationDispatcher,
        )
        .with_settings(WorkflowSettings::from(&config.workflow));

        let flows = seed_flows(&service)
            .await
            .map_err(|error| ("seed_execution", error.to_string(), 6u8));
        pool.close().await;
        flows
    });

    match result {
        Ok(flows) => {
            let lines: Vec<String> = flows
                .iter()
                .map(|flow| {
                    format!(
                        "  - {}: {} ({}, {} history entries)",
                        flow.label,
                        flow.request_id,
                        flow.state.as_str(),
                        flow.history_entries
                    )
                })
                .collect();
            CommandResult::success(
                "seed",
                format!("seeded {} demo requests:\n{}", flows.len(), lines.join("\n")),
            )
        }
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("seed", error_class, message, exit_code)
        }
    }
}

async fn seed_flows(service: &SeedService) -> Result<Vec<SeededFlow>, WorkflowError> {
    let mut flows = Vec::new();

    let wrench = service
        .create(draft("emp-042", "Torque Wrench", 2, "Maintenance", "line 3 gearbox overhaul"))
        .await?;
    step(service, &wrench.id, WorkflowAction::Submit, ActorRole::Requester, None).await?;
    step(service, &wrench.id, WorkflowAction::HodReject, ActorRole::Hod, Some("one is enough"))
        .await?;
    service
        .submit_resubmission(
            &wrench.id,
            RequestPatch { quantity: Some(1), ..RequestPatch::default() },
        )
        .await?;
    step(service, &wrench.id, WorkflowAction::HodApprove, ActorRole::Hod, None).await?;
    step(service, &wrench.id, WorkflowAction::GmApprove, ActorRole::Gm, None).await?;
    flows.push(summarize(service, "approved_after_resubmission", &wrench.id).await?);

    let press = service
        .create(draft("emp-107", "Hydraulic Press", 1, "Fabrication", "bracket rework"))
        .await?;
    step(service, &press.id, WorkflowAction::Submit, ActorRole::Requester, None).await?;
    step(service, &press.id, WorkflowAction::HodApprove, ActorRole::Hod, None).await?;
    step(
        service,
        &press.id,
        WorkflowAction::GmReject,
        ActorRole::Gm,
        Some("use the shared press in bay 2"),
    )
    .await?;
    flows.push(summarize(service, "rejected_by_gm", &press.id).await?);

    let calipers =
        service.create(draft("emp-215", "Digital Calipers", 3, "Quality", "incoming inspection")).await?;
    step(service, &calipers.id, WorkflowAction::Submit, ActorRole::Requester, None).await?;
    flows.push(summarize(service, "awaiting_hod", &calipers.id).await?);

    let station =
        service.create(draft("emp-042", "Soldering Station", 1, "Electronics", "harness repair")).await?;
    flows.push(summarize(service, "draft", &station.id).await?);

    Ok(flows)
}

fn draft(requester: &str, item: &str, quantity: i64, department: &str, reason: &str) -> RequestDraft {
    RequestDraft {
        requester_id: requester.to_string(),
        item_description: Some(item.to_string()),
        quantity: Some(quantity),
        reason: Some(reason.to_string()),
        department: Some(department.to_string()),
        priority: None,
    }
}

async fn step(
    service: &SeedService,
    request_id: &RequestId,
    action: WorkflowAction,
    role: ActorRole,
    comment: Option<&str>,
) -> Result<(), WorkflowError> {
    service.apply_action(request_id, action, role, comment.map(str::to_string)).await?;
    Ok(())
}

async fn summarize(
    service: &SeedService,
    label: &'static str,
    request_id: &RequestId,
) -> Result<SeededFlow, WorkflowError> {
    let request = service.get(request_id).await?;
    let history_entries = service.entries_for(request_id).await?.len();
    Ok(SeededFlow { label, request_id: request.id.0, state: request.state, history_entries })
}
