use serde::{Deserialize, Serialize};
use worker::{console_log, Response};

use crate::action::{ApprovalDecision, CallbackToken, RemoteActionRequest};
use crate::azure::{self, Notification};
use crate::config::Config;
use crate::error::RelayError;

const API_BASE: &str = "https://api.telegram.org";
const GREETING: &str = "Hello! I will notify you about Azure DevOps approvals!";
const UNAUTHORIZED_ALERT: &str = "You are not allowed to act on deployment approvals.";
const MALFORMED_ALERT: &str =
    "This action could not be read. Use the buttons from a recent notification.";

// Bot API webhook envelope, reduced to the updates this bot reacts to.
#[derive(Deserialize, Debug)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<Message>,
    pub callback_query: Option<CallbackQuery>,
}

#[derive(Deserialize, Debug)]
pub struct Message {
    pub message_id: i64,
    pub from: Option<User>,
    pub chat: Chat,
    pub text: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct User {
    pub id: i64,
    pub first_name: Option<String>,
    pub username: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct Chat {
    pub id: i64,
}

#[derive(Deserialize, Debug)]
pub struct CallbackQuery {
    pub id: String,
    pub from: User,
    pub message: Option<Message>,
    pub data: Option<String>,
}

#[derive(Serialize, Debug)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    parse_mode: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_markup: Option<InlineKeyboardMarkup>,
}

#[derive(Serialize, Debug)]
pub struct InlineKeyboardMarkup {
    pub inline_keyboard: Vec<Vec<InlineKeyboardButton>>,
}

#[derive(Serialize, Debug)]
pub struct InlineKeyboardButton {
    pub text: String,
    pub callback_data: String,
}

#[derive(Serialize, Debug)]
struct AnswerCallbackQuery<'a> {
    callback_query_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<&'a str>,
    show_alert: bool,
}

pub async fn handle_update(config: &Config, update: Update) -> worker::Result<Response> {
    if let Some(callback) = update.callback_query {
        return handle_callback(config, callback).await;
    }

    if let Some(message) = update.message {
        if message.text.as_deref() == Some("/start") {
            let chat_id = message.chat.id.to_string();
            if let Err(err) = send_text(config, &chat_id, GREETING).await {
                console_log!("Failed to send greeting: {}", err.to_string());
            }
        }
    }

    Response::ok("OK")
}

/// Decode a button press and gate it, without touching the network. No
/// remote call can happen unless this returns a request.
pub fn prepare_dispatch(
    config: &Config,
    data: Option<&str>,
    user_id: i64,
) -> Result<RemoteActionRequest, RelayError> {
    let data = data
        .ok_or_else(|| RelayError::MalformedToken("callback query carried no data".to_string()))?;
    let token = CallbackToken::decode(data)?;
    if user_id != config.authorized_user_id {
        return Err(RelayError::Unauthorized(user_id));
    }
    token.into_request()
}

async fn handle_callback(config: &Config, callback: CallbackQuery) -> worker::Result<Response> {
    let chat_id = match &callback.message {
        Some(message) => message.chat.id.to_string(),
        None => config.chat_id.clone(),
    };

    let request = match prepare_dispatch(config, callback.data.as_deref(), callback.from.id) {
        Ok(request) => request,
        Err(err) => {
            console_log!(
                "Refusing callback from user {}: {}",
                callback.from.id,
                err.to_string()
            );
            let alert = match err {
                RelayError::Unauthorized(_) => UNAUTHORIZED_ALERT,
                _ => MALFORMED_ALERT,
            };
            if let Err(err) = answer_callback_query(config, &callback.id, Some(alert)).await {
                console_log!("Failed to answer callback query: {}", err.to_string());
            }
            return Response::ok("OK");
        }
    };

    // Dismiss the client spinner before the remote call; the outcome
    // arrives as a chat message either way.
    // TODO: also edit the original notification to drop its buttons once a
    // decision lands, so a stale keyboard can't be pressed twice.
    if let Err(err) = answer_callback_query(config, &callback.id, None).await {
        console_log!("Failed to answer callback query: {}", err.to_string());
    }

    let reply = match azure::execute(config, &request).await {
        Ok(()) => confirmation_text(&request),
        Err(err) => failure_text(&request, &err),
    };

    if let Err(err) = send_text(config, &chat_id, &reply).await {
        console_log!("Failed to send decision reply: {}", err.to_string());
    }

    Response::ok("OK")
}

fn confirmation_text(request: &RemoteActionRequest) -> String {
    match request {
        RemoteActionRequest::SetApprovalStatus {
            approval_id,
            decision: ApprovalDecision::Approved,
            ..
        } => format!("✅ Successfully approved ID {approval_id} in Azure DevOps!"),
        RemoteActionRequest::SetApprovalStatus {
            approval_id,
            decision: ApprovalDecision::Rejected,
            ..
        } => format!("❌ Successfully rejected ID {approval_id} in Azure DevOps!"),
        RemoteActionRequest::Redeploy {
            release_id,
            environment_id,
            ..
        } => format!("🔁 Triggered redeploy of release {release_id} to environment {environment_id}!"),
    }
}

fn failure_text(request: &RemoteActionRequest, err: &RelayError) -> String {
    format!("⚠️ Failed to {}: {}", request.describe(), err)
}

/// Message text plus buttons for one notification.
pub fn render(notification: &Notification) -> (String, Option<InlineKeyboardMarkup>) {
    match notification {
        Notification::ApprovalPending {
            project,
            release,
            environment,
            approve,
            reject,
        } => (
            format!(
                "🛠 *Approval Pending*\n\n*Project:* {project}\n*Release:* {release}\n*Environment:* {environment}"
            ),
            Some(InlineKeyboardMarkup {
                inline_keyboard: vec![vec![
                    InlineKeyboardButton {
                        text: "✅ Approve".to_string(),
                        callback_data: approve.encode(),
                    },
                    InlineKeyboardButton {
                        text: "❌ Reject".to_string(),
                        callback_data: reject.encode(),
                    },
                ]],
            }),
        ),
        Notification::DeploymentSucceeded {
            project,
            release,
            environment,
        } => (
            format!(
                "✅ *Deployment Succeeded*\n\n*Project:* {project}\n*Release:* {release}\n*Environment:* {environment}"
            ),
            None,
        ),
        Notification::DeploymentFailed {
            project,
            release,
            environment,
            redeploy,
        } => (
            format!(
                "❌ *Deployment Failed*\n\n*Project:* {project}\n*Release:* {release}\n*Environment:* {environment}"
            ),
            Some(InlineKeyboardMarkup {
                inline_keyboard: vec![vec![InlineKeyboardButton {
                    text: "🔁 Redeploy".to_string(),
                    callback_data: redeploy.encode(),
                }]],
            }),
        ),
    }
}

pub async fn send_notification(
    config: &Config,
    notification: &Notification,
) -> Result<(), RelayError> {
    let (text, reply_markup) = render(notification);
    let body = SendMessage {
        chat_id: &config.chat_id,
        text: &text,
        parse_mode: Some("Markdown"),
        reply_markup,
    };
    call_api(config, "sendMessage", &body).await
}

pub async fn send_text(config: &Config, chat_id: &str, text: &str) -> Result<(), RelayError> {
    let body = SendMessage {
        chat_id,
        text,
        parse_mode: None,
        reply_markup: None,
    };
    call_api(config, "sendMessage", &body).await
}

async fn answer_callback_query(
    config: &Config,
    callback_query_id: &str,
    alert: Option<&str>,
) -> Result<(), RelayError> {
    let body = AnswerCallbackQuery {
        callback_query_id,
        text: alert,
        show_alert: alert.is_some(),
    };
    call_api(config, "answerCallbackQuery", &body).await
}

async fn call_api<T: Serialize>(config: &Config, method: &str, body: &T) -> Result<(), RelayError> {
    let url = format!("{}/bot{}/{}", API_BASE, config.telegram_token, method);
    let client = reqwest::Client::new();
    let res = client
        .post(url)
        .header("Content-Type", "application/json; charset=utf-8")
        .json(body)
        .send()
        .await?;

    let status = res.status();
    if status.is_success() {
        return Ok(());
    }
    let body = res.text().await.unwrap_or_default();
    Err(RelayError::RemoteCall(format!(
        "telegram returned {status}: {body}"
    )))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use crate::action::{ApprovalDecision, CallbackToken, RemoteActionRequest};
    use crate::azure::Notification;
    use crate::config::Config;
    use crate::error::RelayError;
    use crate::telegram::{confirmation_text, failure_text, prepare_dispatch, render, Update};

    fn test_config() -> Config {
        Config {
            telegram_token: "123456:TEST".to_string(),
            chat_id: "-1000000000001".to_string(),
            azure_org: "fabrikam".to_string(),
            azure_pat: "pat".to_string(),
            authorized_user_id: 999,
        }
    }

    fn load_update(name: &str) -> Update {
        let data =
            fs::read_to_string(format!("./data/telegram/{name}.json")).expect("Error reading file");
        serde_json::from_str(&data).expect("Error parsing json")
    }

    #[test]
    fn parse_callback_update() {
        let update = load_update("callback-approve");

        let callback = update.callback_query.expect("callback query expected");
        assert_eq!(999, callback.from.id);
        assert_eq!(Some("approve:42::Web"), callback.data.as_deref());
        assert_eq!(-1000000000001, callback.message.unwrap().chat.id);
    }

    #[test]
    fn parse_start_message_update() {
        let update = load_update("start-message");

        let message = update.message.expect("message expected");
        assert_eq!(Some("/start"), message.text.as_deref());
        assert!(update.callback_query.is_none());
    }

    #[test]
    fn prepare_dispatch_accepts_the_authorized_operator() {
        let config = test_config();

        let request = prepare_dispatch(&config, Some("approve:42::Web"), 999).unwrap();
        assert_eq!(
            RemoteActionRequest::SetApprovalStatus {
                project: "Web".to_string(),
                approval_id: 42,
                decision: ApprovalDecision::Approved,
            },
            request
        );
    }

    #[test]
    fn prepare_dispatch_refuses_any_other_user() {
        let config = test_config();

        let result = prepare_dispatch(&config, Some("approve:42::Web"), 1000);
        assert!(matches!(result, Err(RelayError::Unauthorized(1000))));
    }

    #[test]
    fn prepare_dispatch_refuses_garbage_data_even_for_the_operator() {
        let config = test_config();

        let result = prepare_dispatch(&config, Some("not-a-token"), 999);
        assert!(matches!(result, Err(RelayError::MalformedToken(_))));
    }

    #[test]
    fn prepare_dispatch_refuses_missing_data() {
        let config = test_config();

        let result = prepare_dispatch(&config, None, 999);
        assert!(matches!(result, Err(RelayError::MalformedToken(_))));
    }

    #[test]
    fn render_approval_pending_has_approve_and_reject_buttons() {
        let notification = Notification::ApprovalPending {
            project: "Web".to_string(),
            release: "R1".to_string(),
            environment: "Prod".to_string(),
            approve: CallbackToken::approve(42, "Web"),
            reject: CallbackToken::reject(42, "Web"),
        };

        let (text, markup) = render(&notification);
        assert!(text.contains("Approval Pending"));
        assert!(text.contains("*Project:* Web"));

        let rows = markup.expect("keyboard expected").inline_keyboard;
        assert_eq!(1, rows.len());
        assert_eq!(2, rows[0].len());
        assert_eq!("approve:42::Web", rows[0][0].callback_data);
        assert_eq!("reject:42::Web", rows[0][1].callback_data);
    }

    #[test]
    fn render_succeeded_deployment_has_no_buttons() {
        let notification = Notification::DeploymentSucceeded {
            project: "Web".to_string(),
            release: "R1".to_string(),
            environment: "Prod".to_string(),
        };

        let (text, markup) = render(&notification);
        assert!(text.contains("Deployment Succeeded"));
        assert!(markup.is_none());
    }

    #[test]
    fn render_failed_deployment_has_a_redeploy_button() {
        let notification = Notification::DeploymentFailed {
            project: "Web".to_string(),
            release: "R1".to_string(),
            environment: "Prod".to_string(),
            redeploy: CallbackToken::redeploy(7, 3, "Web"),
        };

        let (text, markup) = render(&notification);
        assert!(text.contains("Deployment Failed"));

        let rows = markup.expect("keyboard expected").inline_keyboard;
        assert_eq!("redeploy:7:3:Web", rows[0][0].callback_data);
    }

    #[test]
    fn decision_replies_name_the_id_and_kind() {
        let approve = RemoteActionRequest::SetApprovalStatus {
            project: "Web".to_string(),
            approval_id: 42,
            decision: ApprovalDecision::Approved,
        };
        assert!(confirmation_text(&approve).contains("approved ID 42"));

        let redeploy = RemoteActionRequest::Redeploy {
            project: "Web".to_string(),
            release_id: 7,
            environment_id: 3,
        };
        assert!(confirmation_text(&redeploy).contains("release 7"));
        assert!(confirmation_text(&redeploy).contains("environment 3"));

        let err = RelayError::RemoteCall("azure devops returned 403: denied".to_string());
        let failure = failure_text(&approve, &err);
        assert!(failure.contains("approve ID 42"));
        assert!(failure.contains("denied"));
    }
}
