use worker::{Env, Error};

/// Per-request context: credentials and routing identities, read from the
/// worker environment once and passed into whichever handler needs them.
pub struct Config {
    pub telegram_token: String,
    pub chat_id: String,
    pub azure_org: String,
    pub azure_pat: String,
    pub authorized_user_id: i64,
}

impl Config {
    pub fn from_env(env: &Env) -> Result<Config, Error> {
        let authorized_user_id = env
            .var("AUTHORIZED_USER_ID")?
            .to_string()
            .parse::<i64>()
            .map_err(|_| {
                Error::RustError("AUTHORIZED_USER_ID must be a numeric Telegram user id".to_string())
            })?;

        Ok(Config {
            telegram_token: env.secret("TELEGRAM_TOKEN")?.to_string(),
            chat_id: env.var("CHAT_ID")?.to_string(),
            azure_org: env.var("AZURE_ORG")?.to_string(),
            azure_pat: env.secret("AZURE_PAT")?.to_string(),
            authorized_user_id,
        })
    }
}
