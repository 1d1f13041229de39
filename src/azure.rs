use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use url::Url;
use worker::{console_log, Response};

use crate::action::{ApprovalDecision, CallbackToken, RemoteActionRequest};
use crate::config::Config;
use crate::error::RelayError;
use crate::telegram;

pub const APPROVAL_PENDING_EVENT: &str = "ms.vss-release.deployment-approval-pending-event";
pub const DEPLOYMENT_COMPLETED_EVENT: &str = "ms.vss-release.deployment-completed-event";

const VSRM_BASE: &str = "https://vsrm.dev.azure.com";
const API_VERSION: &str = "api-version=7.1";

// Service-hook envelope. Everything below eventType is optional on purpose:
// which fields must be present depends on the event kind, and that check
// belongs to classify, not to deserialization.
#[derive(Deserialize, Debug)]
#[serde(rename_all(serialize = "snake_case", deserialize = "camelCase"))]
pub struct ReleaseEvent {
    pub event_type: String,
    pub resource: Option<EventResource>,
}

#[derive(Deserialize, Debug)]
pub struct EventResource {
    pub approval: Option<Approval>,
    pub project: Option<ProjectRef>,
    pub release: Option<ReleaseRef>,
    pub environment: Option<EnvironmentRef>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all(serialize = "snake_case", deserialize = "camelCase"))]
pub struct Approval {
    pub id: Option<u64>,
    pub release_environment: Option<EnvironmentRef>,
}

#[derive(Deserialize, Debug)]
pub struct ProjectRef {
    pub name: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct ReleaseRef {
    pub id: Option<u64>,
    pub name: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct EnvironmentRef {
    pub id: Option<u64>,
    pub name: Option<String>,
    pub status: Option<String>,
    pub release: Option<ReleaseRef>,
}

/// What the operator should see for one inbound event, action tokens
/// included. Produced by `classify`, rendered by the telegram module.
#[derive(Debug)]
pub enum Notification {
    ApprovalPending {
        project: String,
        release: String,
        environment: String,
        approve: CallbackToken,
        reject: CallbackToken,
    },
    DeploymentSucceeded {
        project: String,
        release: String,
        environment: String,
    },
    DeploymentFailed {
        project: String,
        release: String,
        environment: String,
        redeploy: CallbackToken,
    },
}

/// Decide what, if anything, an event means for the operator.
///
/// Unrecognized event types and completion statuses are a silent no-op; a
/// recognized kind missing one of its required fields is a malformed event.
pub fn classify(event: &ReleaseEvent) -> Result<Option<Notification>, RelayError> {
    match event.event_type.as_str() {
        APPROVAL_PENDING_EVENT => classify_approval_pending(event).map(Some),
        DEPLOYMENT_COMPLETED_EVENT => classify_deployment_completed(event),
        _ => Ok(None),
    }
}

fn require<T>(value: Option<T>, field: &str) -> Result<T, RelayError> {
    value.ok_or_else(|| RelayError::MalformedEvent(format!("missing {field}")))
}

fn classify_approval_pending(event: &ReleaseEvent) -> Result<Notification, RelayError> {
    let resource = require(event.resource.as_ref(), "resource")?;
    let approval = require(resource.approval.as_ref(), "resource.approval")?;
    let approval_id = require(approval.id, "resource.approval.id")?;
    let project = require(
        resource.project.as_ref().and_then(|p| p.name.as_deref()),
        "resource.project.name",
    )?;
    let release = require(
        resource.release.as_ref().and_then(|r| r.name.as_deref()),
        "resource.release.name",
    )?;
    let environment = require(
        approval
            .release_environment
            .as_ref()
            .and_then(|e| e.name.as_deref()),
        "resource.approval.releaseEnvironment.name",
    )?;

    Ok(Notification::ApprovalPending {
        project: project.to_string(),
        release: release.to_string(),
        environment: environment.to_string(),
        approve: CallbackToken::approve(approval_id, project),
        reject: CallbackToken::reject(approval_id, project),
    })
}

fn classify_deployment_completed(event: &ReleaseEvent) -> Result<Option<Notification>, RelayError> {
    let resource = require(event.resource.as_ref(), "resource")?;
    let environment = require(resource.environment.as_ref(), "resource.environment")?;
    let status = require(environment.status.as_deref(), "resource.environment.status")?;
    let project = require(
        resource.project.as_ref().and_then(|p| p.name.as_deref()),
        "resource.project.name",
    )?;
    let release_ref = require(environment.release.as_ref(), "resource.environment.release")?;

    match status {
        "succeeded" => {
            let release = require(release_ref.name.as_deref(), "resource.environment.release.name")?;
            let environment_name = require(environment.name.as_deref(), "resource.environment.name")?;
            Ok(Some(Notification::DeploymentSucceeded {
                project: project.to_string(),
                release: release.to_string(),
                environment: environment_name.to_string(),
            }))
        }
        "failed" => {
            let release = require(release_ref.name.as_deref(), "resource.environment.release.name")?;
            let release_id = require(release_ref.id, "resource.environment.release.id")?;
            let environment_name = require(environment.name.as_deref(), "resource.environment.name")?;
            let environment_id = require(environment.id, "resource.environment.id")?;
            Ok(Some(Notification::DeploymentFailed {
                project: project.to_string(),
                release: release.to_string(),
                environment: environment_name.to_string(),
                redeploy: CallbackToken::redeploy(release_id, environment_id, project),
            }))
        }
        _ => Ok(None),
    }
}

pub async fn handle_webhook(config: &Config, event: ReleaseEvent) -> worker::Result<Response> {
    let notification = match classify(&event) {
        Ok(Some(notification)) => notification,
        Ok(None) => {
            console_log!("Ignoring event type {}", &event.event_type);
            return Response::ok("OK");
        }
        Err(err) => {
            // The sender must still get a 200 or it will keep retrying the
            // same broken payload.
            console_log!("Dropping event {}: {}", &event.event_type, err.to_string());
            return Response::ok("OK");
        }
    };

    if let Err(err) = telegram::send_notification(config, &notification).await {
        console_log!("Failed to deliver notification: {}", err.to_string());
    }

    Response::ok("OK")
}

#[derive(Serialize, Debug)]
struct ApprovalUpdate<'a> {
    status: &'a str,
    comments: &'a str,
}

/// Issue the one outbound Azure DevOps call a decoded token stands for.
pub async fn execute(config: &Config, request: &RemoteActionRequest) -> Result<(), RelayError> {
    match request {
        RemoteActionRequest::SetApprovalStatus {
            project,
            approval_id,
            decision,
        } => set_approval_status(config, project, *approval_id, *decision).await,
        RemoteActionRequest::Redeploy {
            project,
            release_id,
            environment_id,
        } => trigger_redeploy(config, project, *release_id, *environment_id).await,
    }
}

async fn set_approval_status(
    config: &Config,
    project: &str,
    approval_id: u64,
    decision: ApprovalDecision,
) -> Result<(), RelayError> {
    let url = release_api_url(
        &config.azure_org,
        project,
        &["_apis", "release", "approvals", &approval_id.to_string()],
    )?;
    let body = ApprovalUpdate {
        status: decision.as_str(),
        comments: decision.audit_comment(),
    };

    let client = reqwest::Client::new();
    let res = client
        .patch(url)
        .header("Authorization", auth_header(&config.azure_pat))
        .header("Content-Type", "application/json")
        .json(&body)
        .send()
        .await?;

    expect_success(res).await
}

async fn trigger_redeploy(
    config: &Config,
    project: &str,
    release_id: u64,
    environment_id: u64,
) -> Result<(), RelayError> {
    let url = release_api_url(
        &config.azure_org,
        project,
        &[
            "_apis",
            "release",
            "releases",
            &release_id.to_string(),
            "environments",
            &environment_id.to_string(),
        ],
    )?;

    let client = reqwest::Client::new();
    let res = client
        .patch(url)
        .header("Authorization", auth_header(&config.azure_pat))
        .send()
        .await?;

    expect_success(res).await
}

fn auth_header(pat: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!(":{pat}")))
}

// Project names are user-controlled free text and go into the path, so the
// URL is assembled from segments rather than format!.
fn release_api_url(org: &str, project: &str, segments: &[&str]) -> Result<Url, RelayError> {
    let mut url =
        Url::parse(VSRM_BASE).map_err(|err| RelayError::RemoteCall(err.to_string()))?;
    {
        let mut path = url
            .path_segments_mut()
            .map_err(|()| RelayError::RemoteCall("cannot build release api url".to_string()))?;
        path.push(org);
        path.push(project);
        path.extend(segments.iter().copied());
    }
    url.set_query(Some(API_VERSION));
    Ok(url)
}

async fn expect_success(res: reqwest::Response) -> Result<(), RelayError> {
    let status = res.status();
    if status.is_success() {
        return Ok(());
    }
    let body = res.text().await.unwrap_or_default();
    Err(RelayError::RemoteCall(format!(
        "azure devops returned {status}: {body}"
    )))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use crate::action::{ActionKind, CallbackToken};
    use crate::azure::{auth_header, classify, release_api_url, Notification, ReleaseEvent};
    use crate::error::RelayError;

    fn load_event(name: &str) -> ReleaseEvent {
        let data = fs::read_to_string(format!("./data/azuredevops/{name}.json"))
            .expect("Error reading file");
        serde_json::from_str(&data).expect("Error parsing json")
    }

    #[test]
    fn classify_approval_pending_emits_approve_and_reject_tokens() {
        let event = load_event("approval-pending");

        let notification = classify(&event).unwrap().unwrap();
        let Notification::ApprovalPending {
            project,
            release,
            environment,
            approve,
            reject,
        } = notification
        else {
            panic!("expected an approval pending notification");
        };

        assert_eq!("Web", project);
        assert_eq!("R1", release);
        assert_eq!("Prod", environment);

        let approve = CallbackToken::decode(&approve.encode()).unwrap();
        assert_eq!(ActionKind::Approve, approve.kind);
        assert_eq!(42, approve.primary_id);
        assert_eq!("Web", approve.project);

        let reject = CallbackToken::decode(&reject.encode()).unwrap();
        assert_eq!(ActionKind::Reject, reject.kind);
        assert_eq!(42, reject.primary_id);
        assert_eq!("Web", reject.project);
    }

    #[test]
    fn classify_approval_pending_missing_release_is_malformed() {
        let event = load_event("approval-pending-missing-release");

        let result = classify(&event);
        assert!(matches!(result, Err(RelayError::MalformedEvent(_))));
    }

    #[test]
    fn classify_failed_deployment_emits_redeploy_token() {
        let event = load_event("deployment-failed");

        let notification = classify(&event).unwrap().unwrap();
        let Notification::DeploymentFailed { redeploy, .. } = notification else {
            panic!("expected a deployment failed notification");
        };

        let token = CallbackToken::decode(&redeploy.encode()).unwrap();
        assert_eq!(ActionKind::Redeploy, token.kind);
        assert_eq!(7, token.primary_id);
        assert_eq!(Some(3), token.secondary_id);
        assert_eq!("Web", token.project);
    }

    #[test]
    fn classify_succeeded_deployment_carries_no_tokens() {
        let event = load_event("deployment-succeeded");

        let notification = classify(&event).unwrap().unwrap();
        assert!(matches!(
            notification,
            Notification::DeploymentSucceeded { .. }
        ));
    }

    #[test]
    fn classify_canceled_deployment_is_a_no_op() {
        let event = load_event("deployment-canceled");

        assert!(classify(&event).unwrap().is_none());
    }

    #[test]
    fn classify_unrelated_event_type_is_a_no_op() {
        let event = load_event("build-completed");

        assert!(classify(&event).unwrap().is_none());
    }

    #[test]
    fn classify_completed_event_without_status_is_malformed() {
        let event = load_event("deployment-missing-status");

        let result = classify(&event);
        assert!(matches!(result, Err(RelayError::MalformedEvent(_))));
    }

    #[test]
    fn release_api_url_encodes_the_project_path_segment() {
        let url = release_api_url("fabrikam", "My Web", &["_apis", "release", "approvals", "42"])
            .unwrap();
        assert_eq!(
            "https://vsrm.dev.azure.com/fabrikam/My%20Web/_apis/release/approvals/42?api-version=7.1",
            url.as_str()
        );
    }

    #[test]
    fn release_api_url_keeps_a_slash_out_of_the_project_segment() {
        let url = release_api_url("fabrikam", "Web/../admin", &["_apis"]).unwrap();
        assert!(!url.path().contains("/../"));
    }

    #[test]
    fn auth_header_is_basic_with_blank_user() {
        // base64(":pat") == "OnBhdA=="
        assert_eq!("Basic OnBhdA==", auth_header("pat"));
    }
}
