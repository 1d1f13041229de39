use thiserror::Error;

/// Everything that can go wrong between a webhook delivery and its reply.
/// Each variant is caught at the route handler that produced it; none of
/// them escapes past the router.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("malformed event: {0}")]
    MalformedEvent(String),
    #[error("malformed callback token: {0}")]
    MalformedToken(String),
    #[error("user {0} is not allowed to act on deployment approvals")]
    Unauthorized(i64),
    #[error("remote call failed: {0}")]
    RemoteCall(String),
}

impl From<reqwest::Error> for RelayError {
    fn from(err: reqwest::Error) -> Self {
        RelayError::RemoteCall(err.to_string())
    }
}
