use percent_encoding::{percent_decode_str, utf8_percent_encode, NON_ALPHANUMERIC};

use crate::error::RelayError;

const DELIMITER: char = ':';
const FIELD_COUNT: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActionKind {
    Approve,
    Reject,
    Redeploy,
}

impl ActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::Approve => "approve",
            ActionKind::Reject => "reject",
            ActionKind::Redeploy => "redeploy",
        }
    }

    fn parse(value: &str) -> Option<ActionKind> {
        match value {
            "approve" => Some(ActionKind::Approve),
            "reject" => Some(ActionKind::Reject),
            "redeploy" => Some(ActionKind::Redeploy),
            _ => None,
        }
    }
}

/// Everything a future remote call will need, carried inside the inline
/// button itself. Nothing is stored server-side, so the token has to be
/// self-sufficient.
///
/// Wire shape is `kind:primaryId:secondaryId:project` with an empty third
/// field when there is no secondary id. The project is percent-encoded, so
/// the delimiter can never appear inside a field. Telegram caps
/// callback_data at 64 bytes, which comfortably fits numeric ids plus a
/// project name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallbackToken {
    pub kind: ActionKind,
    pub primary_id: u64,
    pub secondary_id: Option<u64>,
    pub project: String,
}

impl CallbackToken {
    pub fn approve(approval_id: u64, project: &str) -> CallbackToken {
        CallbackToken {
            kind: ActionKind::Approve,
            primary_id: approval_id,
            secondary_id: None,
            project: project.to_string(),
        }
    }

    pub fn reject(approval_id: u64, project: &str) -> CallbackToken {
        CallbackToken {
            kind: ActionKind::Reject,
            primary_id: approval_id,
            secondary_id: None,
            project: project.to_string(),
        }
    }

    pub fn redeploy(release_id: u64, environment_id: u64, project: &str) -> CallbackToken {
        CallbackToken {
            kind: ActionKind::Redeploy,
            primary_id: release_id,
            secondary_id: Some(environment_id),
            project: project.to_string(),
        }
    }

    pub fn encode(&self) -> String {
        let secondary = match self.secondary_id {
            Some(id) => id.to_string(),
            None => String::new(),
        };
        let project: String = utf8_percent_encode(&self.project, NON_ALPHANUMERIC).collect();
        format!(
            "{}{DELIMITER}{}{DELIMITER}{}{DELIMITER}{}",
            self.kind.as_str(),
            self.primary_id,
            secondary,
            project
        )
    }

    pub fn decode(data: &str) -> Result<CallbackToken, RelayError> {
        let fields: Vec<&str> = data.split(DELIMITER).collect();
        if fields.len() != FIELD_COUNT {
            return Err(RelayError::MalformedToken(format!(
                "expected {} fields, got {}",
                FIELD_COUNT,
                fields.len()
            )));
        }

        let kind = ActionKind::parse(fields[0])
            .ok_or_else(|| RelayError::MalformedToken(format!("unknown action {}", fields[0])))?;

        let primary_id = fields[1]
            .parse::<u64>()
            .map_err(|_| RelayError::MalformedToken(format!("non-numeric id {}", fields[1])))?;

        let secondary_id = if fields[2].is_empty() {
            None
        } else {
            Some(fields[2].parse::<u64>().map_err(|_| {
                RelayError::MalformedToken(format!("non-numeric secondary id {}", fields[2]))
            })?)
        };

        let project = percent_decode_str(fields[3])
            .decode_utf8()
            .map_err(|_| RelayError::MalformedToken("project is not valid utf-8".to_string()))?
            .to_string();

        Ok(CallbackToken {
            kind,
            primary_id,
            secondary_id,
            project,
        })
    }

    /// Lower the token into the single remote call it stands for. The only
    /// semantic check left at this point is that a redeploy knows its
    /// target environment.
    pub fn into_request(self) -> Result<RemoteActionRequest, RelayError> {
        match self.kind {
            ActionKind::Approve => Ok(RemoteActionRequest::SetApprovalStatus {
                project: self.project,
                approval_id: self.primary_id,
                decision: ApprovalDecision::Approved,
            }),
            ActionKind::Reject => Ok(RemoteActionRequest::SetApprovalStatus {
                project: self.project,
                approval_id: self.primary_id,
                decision: ApprovalDecision::Rejected,
            }),
            ActionKind::Redeploy => {
                let environment_id = self.secondary_id.ok_or_else(|| {
                    RelayError::MalformedToken("redeploy without an environment id".to_string())
                })?;
                Ok(RemoteActionRequest::Redeploy {
                    project: self.project,
                    release_id: self.primary_id,
                    environment_id,
                })
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approved,
    Rejected,
}

impl ApprovalDecision {
    pub fn as_str(self) -> &'static str {
        match self {
            ApprovalDecision::Approved => "approved",
            ApprovalDecision::Rejected => "rejected",
        }
    }

    pub fn audit_comment(self) -> &'static str {
        match self {
            ApprovalDecision::Approved => "Approved via the release notification bot",
            ApprovalDecision::Rejected => "Rejected via the release notification bot",
        }
    }
}

/// One outbound Azure DevOps call, fully determined by a decoded token.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RemoteActionRequest {
    SetApprovalStatus {
        project: String,
        approval_id: u64,
        decision: ApprovalDecision,
    },
    Redeploy {
        project: String,
        release_id: u64,
        environment_id: u64,
    },
}

impl RemoteActionRequest {
    pub fn describe(&self) -> String {
        match self {
            RemoteActionRequest::SetApprovalStatus {
                approval_id,
                decision: ApprovalDecision::Approved,
                ..
            } => format!("approve ID {approval_id}"),
            RemoteActionRequest::SetApprovalStatus {
                approval_id,
                decision: ApprovalDecision::Rejected,
                ..
            } => format!("reject ID {approval_id}"),
            RemoteActionRequest::Redeploy {
                release_id,
                environment_id,
                ..
            } => format!("redeploy release {release_id} to environment {environment_id}"),
        }
    }
}
