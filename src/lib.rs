mod action;
mod azure;
mod config;
mod error;
mod telegram;

use worker::*;

use crate::azure::ReleaseEvent;
use crate::config::Config;
use crate::telegram::Update;

#[event(fetch)]
pub async fn main(req: Request, env: Env, _ctx: Context) -> Result<Response> {
    console_log!("{} {}", req.method().to_string(), req.path());

    Router::new()
        .get_async("/", handle_default)
        .post_async("/azuredevops-webhook", azuredevops_webhook)
        .post_async("/telegram-webhook", telegram_webhook)
        .run(req, env)
        .await
}

async fn handle_default(_: Request, _ctx: RouteContext<()>) -> Result<Response> {
    Response::ok("release-approval-relay")
}

// Both webhook routes answer 200 no matter what: the senders retry on
// anything else, and a payload that failed once will fail every time.

async fn azuredevops_webhook(mut req: Request, ctx: RouteContext<()>) -> Result<Response> {
    let config = match Config::from_env(&ctx.env) {
        Ok(config) => config,
        Err(err) => {
            console_log!("Configuration error: {}", err.to_string());
            return Response::ok("OK");
        }
    };

    let event: ReleaseEvent = match req.json().await {
        Ok(value) => value,
        Err(err) => {
            console_log!("Discarding unreadable event: {}", err.to_string());
            return Response::ok("OK");
        }
    };

    azure::handle_webhook(&config, event).await
}

async fn telegram_webhook(mut req: Request, ctx: RouteContext<()>) -> Result<Response> {
    let config = match Config::from_env(&ctx.env) {
        Ok(config) => config,
        Err(err) => {
            console_log!("Configuration error: {}", err.to_string());
            return Response::ok("OK");
        }
    };

    let update: Update = match req.json().await {
        Ok(value) => value,
        Err(err) => {
            console_log!("Discarding unreadable update: {}", err.to_string());
            return Response::ok("OK");
        }
    };

    telegram::handle_update(&config, update).await
}
