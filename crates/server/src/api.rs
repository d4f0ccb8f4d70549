//! JSON API over the request workflow.
//!
//! - `POST  /requests`                              create a draft
//! - `GET   /requests`                              list, filtered by query string
//! - `GET   /requests/{id}`                         fetch one request
//! - `PATCH /requests/{id}`                         edit a draft or rejected request
//! - `POST  /requests/{id}/actions`                 apply a workflow action
//! - `GET   /requests/{id}/history`                 status history ledger
//! - `GET   /requests/{id}/decisions`               approval decisions, all cycles
//! - `GET   /requests/{id}/allowed-actions?role=`   actions the role may take now
//! - `GET   /requests/{id}/verification`            ledger integrity report
//! - `GET   /requests/{id}/resubmission`            editable draft of a rejected request
//! - `POST  /requests/{id}/resubmission`            apply edits and resubmit

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use toolcrib_core::{
    ActionOutcome, ActorRole, ApprovalDecision, EditableDraft, InterfaceError, LedgerVerification,
    Request, RequestDraft, RequestFilter, RequestId, RequestPatch, RequestState, RequesterId,
    StatusHistoryEntry, WorkflowAction, WorkflowError,
};
use tracing::{error, warn};
use uuid::Uuid;

use crate::bootstrap::Workflow;

const CORRELATION_HEADER: &str = "x-request-id";

#[derive(Clone)]
pub struct ApiState {
    workflow: Arc<Workflow>,
}

pub fn router(workflow: Arc<Workflow>) -> Router {
    Router::new()
        .route("/requests", post(create_request).get(list_requests))
        .route("/requests/{id}", get(get_request).patch(update_request))
        .route("/requests/{id}/actions", post(apply_action))
        .route("/requests/{id}/history", get(list_history))
        .route("/requests/{id}/decisions", get(list_decisions))
        .route("/requests/{id}/allowed-actions", get(allowed_actions))
        .route("/requests/{id}/verification", get(verify_history))
        .route("/requests/{id}/resubmission", get(prepare_resubmission).post(submit_resubmission))
        .with_state(ApiState { workflow })
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub requester_id: Option<String>,
    pub state: Option<String>,
    pub department: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct ActionBody {
    pub action: String,
    pub actor_role: String,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RoleQuery {
    pub role: String,
}

#[derive(Debug, Serialize)]
pub struct AllowedActionsResponse {
    pub request_id: RequestId,
    pub actor_role: ActorRole,
    pub actions: Vec<WorkflowAction>,
}

#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    pub kind: &'static str,
    pub message: String,
    pub user_message: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    pub correlation_id: String,
}

#[derive(Debug)]
pub struct ApiFailure {
    status: StatusCode,
    body: ApiErrorBody,
}

impl ApiFailure {
    fn from_workflow(error: &WorkflowError, correlation_id: &str) -> Self {
        let interface = InterfaceError::from_workflow(error, correlation_id);
        let status = match interface {
            InterfaceError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            InterfaceError::NotFound { .. } => StatusCode::NOT_FOUND,
            InterfaceError::Forbidden { .. } => StatusCode::FORBIDDEN,
            InterfaceError::Conflict { .. } => StatusCode::CONFLICT,
            InterfaceError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        };

        if status.is_server_error() {
            error!(
                event_name = "api.request.failed",
                correlation_id,
                kind = error.kind().as_str(),
                error = %error,
                "request failed"
            );
        } else {
            warn!(
                event_name = "api.request.rejected",
                correlation_id,
                kind = error.kind().as_str(),
                error = %error,
                "request rejected"
            );
        }

        Self {
            status,
            body: ApiErrorBody {
                kind: error.kind().as_str(),
                message: error.to_string(),
                user_message: interface.user_message(),
                request_id: error.request_id().map(|id| id.0.clone()),
                field: error.field().map(str::to_string),
                action: error.operation(),
                correlation_id: interface.correlation_id().to_string(),
            },
        }
    }
}

impl IntoResponse for ApiFailure {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiFailure>;

fn correlation_id(headers: &HeaderMap) -> String {
    headers
        .get(CORRELATION_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

fn parse_role(raw: &str, correlation_id: &str) -> ApiResult<ActorRole> {
    ActorRole::parse(raw).ok_or_else(|| {
        ApiFailure::from_workflow(
            &WorkflowError::validation(
                None,
                "actor_role",
                format!("unknown role `{raw}` (expected requester|hod|gm)"),
            ),
            correlation_id,
        )
    })
}

async fn create_request(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(draft): Json<RequestDraft>,
) -> ApiResult<(StatusCode, Json<Request>)> {
    let correlation_id = correlation_id(&headers);
    let request = state
        .workflow
        .create(draft)
        .await
        .map_err(|error| ApiFailure::from_workflow(&error, &correlation_id))?;
    Ok((StatusCode::CREATED, Json(request)))
}

async fn list_requests(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<Request>>> {
    let correlation_id = correlation_id(&headers);
    let request_state = match query.state.as_deref() {
        Some(raw) => Some(RequestState::parse(raw).ok_or_else(|| {
            ApiFailure::from_workflow(
                &WorkflowError::validation(None, "state", format!("unknown state `{raw}`")),
                &correlation_id,
            )
        })?),
        None => None,
    };

    let filter = RequestFilter {
        requester_id: query.requester_id.map(RequesterId),
        state: request_state,
        department: query.department,
        limit: query.limit,
        offset: query.offset,
    };
    let requests = state
        .workflow
        .list(&filter)
        .await
        .map_err(|error| ApiFailure::from_workflow(&error, &correlation_id))?;
    Ok(Json(requests))
}

async fn get_request(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<Request>> {
    let correlation_id = correlation_id(&headers);
    let request = state
        .workflow
        .get(&RequestId(id))
        .await
        .map_err(|error| ApiFailure::from_workflow(&error, &correlation_id))?;
    Ok(Json(request))
}

async fn update_request(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(patch): Json<RequestPatch>,
) -> ApiResult<Json<Request>> {
    let correlation_id = correlation_id(&headers);
    let request = state
        .workflow
        .update(&RequestId(id), patch)
        .await
        .map_err(|error| ApiFailure::from_workflow(&error, &correlation_id))?;
    Ok(Json(request))
}

async fn apply_action(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<ActionBody>,
) -> ApiResult<Json<ActionOutcome>> {
    let correlation_id = correlation_id(&headers);
    let request_id = RequestId(id);
    let action = WorkflowAction::parse(&body.action).ok_or_else(|| {
        ApiFailure::from_workflow(
            &WorkflowError::validation(
                Some(request_id.clone()),
                "action",
                format!("unknown action `{}`", body.action),
            ),
            &correlation_id,
        )
    })?;
    let actor_role = parse_role(&body.actor_role, &correlation_id)?;

    let outcome = state
        .workflow
        .apply_action(&request_id, action, actor_role, body.comment)
        .await
        .map_err(|error| ApiFailure::from_workflow(&error, &correlation_id))?;
    Ok(Json(outcome))
}

async fn list_history(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<StatusHistoryEntry>>> {
    let correlation_id = correlation_id(&headers);
    let entries = state
        .workflow
        .entries_for(&RequestId(id))
        .await
        .map_err(|error| ApiFailure::from_workflow(&error, &correlation_id))?;
    Ok(Json(entries))
}

async fn list_decisions(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<ApprovalDecision>>> {
    let correlation_id = correlation_id(&headers);
    let decisions = state
        .workflow
        .decisions_for(&RequestId(id))
        .await
        .map_err(|error| ApiFailure::from_workflow(&error, &correlation_id))?;
    Ok(Json(decisions))
}

async fn allowed_actions(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Query(query): Query<RoleQuery>,
) -> ApiResult<Json<AllowedActionsResponse>> {
    let correlation_id = correlation_id(&headers);
    let actor_role = parse_role(&query.role, &correlation_id)?;
    let request_id = RequestId(id);
    let actions = state
        .workflow
        .allowed_actions(&request_id, actor_role)
        .await
        .map_err(|error| ApiFailure::from_workflow(&error, &correlation_id))?;
    Ok(Json(AllowedActionsResponse { request_id, actor_role, actions }))
}

async fn verify_history(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<LedgerVerification>> {
    let correlation_id = correlation_id(&headers);
    let verification = state
        .workflow
        .verify_history(&RequestId(id))
        .await
        .map_err(|error| ApiFailure::from_workflow(&error, &correlation_id))?;
    Ok(Json(verification))
}

async fn prepare_resubmission(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<EditableDraft>> {
    let correlation_id = correlation_id(&headers);
    let draft = state
        .workflow
        .prepare_resubmission(&RequestId(id))
        .await
        .map_err(|error| ApiFailure::from_workflow(&error, &correlation_id))?;
    Ok(Json(draft))
}

async fn submit_resubmission(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(patch): Json<RequestPatch>,
) -> ApiResult<Json<ActionOutcome>> {
    let correlation_id = correlation_id(&headers);
    let outcome = state
        .workflow
        .submit_resubmission(&RequestId(id), patch)
        .await
        .map_err(|error| ApiFailure::from_workflow(&error, &correlation_id))?;
    Ok(Json(outcome))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::Body,
        http::{Request as HttpRequest, StatusCode},
        Router,
    };
    use serde_json::{json, Value};
    use toolcrib_core::WorkflowService;
    use toolcrib_db::{connect_with_settings, migrations, SqlRequestStorage};
    use tower::ServiceExt;

    use super::router;
    use crate::notifications::TracingNotificationDispatcher;

    async fn app() -> Router {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        let workflow =
            WorkflowService::new(SqlRequestStorage::new(pool), TracingNotificationDispatcher);
        router(Arc::new(workflow))
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder =
            HttpRequest::builder().method(method).uri(uri).header("x-request-id", "corr-test");
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        }
        .expect("request");

        let response = app.clone().oneshot(request).await.expect("response");
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).expect("json body")
        };
        (status, value)
    }

    async fn create(app: &Router) -> String {
        let (status, body) = send(
            app,
            "POST",
            "/requests",
            Some(json!({
                "requester_id": "emp-042",
                "item_description": "Torque Wrench",
                "quantity": 2,
                "department": "Maintenance"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["state"], "draft");
        body["id"].as_str().expect("id").to_string()
    }

    async fn act(app: &Router, id: &str, action: &str, role: &str, comment: Option<&str>) -> (StatusCode, Value) {
        send(
            app,
            "POST",
            &format!("/requests/{id}/actions"),
            Some(json!({ "action": action, "actor_role": role, "comment": comment })),
        )
        .await
    }

    #[tokio::test]
    async fn full_rejection_and_resubmission_flow_over_http() {
        let app = app().await;
        let id = create(&app).await;

        let (status, body) = act(&app, &id, "submit", "requester", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["request"]["state"], "pending_hod_review");
        assert_eq!(body["entry"]["sequence_number"], 1);
        assert_eq!(body["notification"]["resulting_state"], "pending_hod_review");

        let (status, body) = act(&app, &id, "hodReject", "hod", Some("  ")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "validation");
        assert_eq!(body["field"], "comment");
        assert_eq!(body["correlation_id"], "corr-test");

        let (status, body) = act(&app, &id, "hod_reject", "hod", Some("over budget")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["decision"]["outcome"], "rejected");

        let (status, draft) = send(&app, "GET", &format!("/requests/{id}/resubmission"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(draft["rejection_comment"], "over budget");
        assert_eq!(draft["rejected_by"], "hod");

        let (status, body) = send(
            &app,
            "POST",
            &format!("/requests/{id}/resubmission"),
            Some(json!({ "quantity": 1 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["request"]["quantity"], 1);
        assert_eq!(body["request"]["cycle"], 2);

        assert_eq!(act(&app, &id, "hod_approve", "hod", None).await.0, StatusCode::OK);
        let (status, body) = act(&app, &id, "gm_approve", "gm", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["request"]["state"], "approved");

        let (_, history) = send(&app, "GET", &format!("/requests/{id}/history"), None).await;
        let actions: Vec<&str> = history
            .as_array()
            .expect("history array")
            .iter()
            .filter_map(|entry| entry["action"].as_str())
            .collect();
        assert_eq!(actions, vec!["submit", "hod_reject", "resubmit", "hod_approve", "gm_approve"]);

        let (_, decisions) = send(&app, "GET", &format!("/requests/{id}/decisions"), None).await;
        assert_eq!(decisions.as_array().map(Vec::len), Some(3));

        let (_, verification) =
            send(&app, "GET", &format!("/requests/{id}/verification"), None).await;
        assert_eq!(verification["valid"], true);
        assert_eq!(verification["replayed_state"], "approved");
    }

    #[tokio::test]
    async fn wrong_role_is_forbidden_and_records_nothing() {
        let app = app().await;
        let id = create(&app).await;
        act(&app, &id, "submit", "requester", None).await;

        let (status, body) = act(&app, &id, "hod_approve", "gm", None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["kind"], "forbidden_transition");
        assert_eq!(body["action"], "hod_approve");
        assert_eq!(body["request_id"], id.as_str());

        let (_, history) = send(&app, "GET", &format!("/requests/{id}/history"), None).await;
        assert_eq!(history.as_array().map(Vec::len), Some(1));
    }

    #[tokio::test]
    async fn cancelled_request_rejects_late_approval_with_conflict() {
        let app = app().await;
        let id = create(&app).await;
        act(&app, &id, "submit", "requester", None).await;
        act(&app, &id, "hod_approve", "hod", None).await;
        let (status, _) = act(&app, &id, "cancel", "requester", None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = act(&app, &id, "gm_approve", "gm", None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["kind"], "invalid_state");

        let (status, _) = send(
            &app,
            "PATCH",
            &format!("/requests/{id}"),
            Some(json!({ "quantity": 9 })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn unknown_inputs_are_bad_requests_and_unknown_ids_are_not_found() {
        let app = app().await;
        let id = create(&app).await;

        let (status, body) = act(&app, &id, "escalate", "requester", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["field"], "action");

        let (status, body) = act(&app, &id, "submit", "ceo", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["field"], "actor_role");

        let (status, body) = send(&app, "GET", "/requests?state=archived", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["field"], "state");

        let (status, body) = send(&app, "GET", "/requests/REQ-missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["kind"], "not_found");

        let (status, body) = send(
            &app,
            "POST",
            "/requests",
            Some(json!({ "requester_id": "emp-1", "item_description": "Vise", "quantity": 0 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["field"], "quantity");
    }

    #[tokio::test]
    async fn list_and_allowed_actions_reflect_current_state() {
        let app = app().await;
        let submitted = create(&app).await;
        let draft = create(&app).await;
        act(&app, &submitted, "submit", "requester", None).await;

        let (status, body) =
            send(&app, "GET", "/requests?state=pending_hod_review&requester_id=emp-042", None)
                .await;
        assert_eq!(status, StatusCode::OK);
        let ids: Vec<&str> =
            body.as_array().expect("list").iter().filter_map(|r| r["id"].as_str()).collect();
        assert_eq!(ids, vec![submitted.as_str()]);

        let (_, body) = send(&app, "GET", "/requests?limit=1", None).await;
        assert_eq!(body.as_array().map(Vec::len), Some(1));

        let (status, body) =
            send(&app, "GET", &format!("/requests/{submitted}/allowed-actions?role=hod"), None)
                .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["actions"], json!(["hod_approve", "hod_reject"]));

        let (_, body) =
            send(&app, "GET", &format!("/requests/{draft}/allowed-actions?role=requester"), None)
                .await;
        assert_eq!(body["actions"], json!(["submit", "cancel"]));

        let (status, _) =
            send(&app, "GET", &format!("/requests/{draft}/resubmission"), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }
}
