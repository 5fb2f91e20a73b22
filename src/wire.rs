//! Wire formats: the inbound command message and the outbound heartbeat
//! (`spec.md` §6). The command is plain JSON; the heartbeat is framed with
//! MessagePack, matching `globus_compute_common.messagepack`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One identity record inside a command's `globus_identity_set`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct IdentityRecord {
    pub sub: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub identity_provider: Option<String>,
}

/// The decoded command body (`spec.md` §6, "Command wire format").
#[derive(Debug, Clone, Deserialize)]
pub struct CommandMessage {
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub kwargs: serde_json::Map<String, Value>,
    pub globus_effective_identity: Option<String>,
    #[serde(default)]
    pub globus_identity_set: Vec<IdentityRecord>,
    pub globus_username: Option<String>,
}

/// Start-endpoint specific kwargs, parsed out of [`CommandMessage::kwargs`]
/// once the command is known to be `cmd_start_endpoint`.
#[derive(Debug, Clone, Deserialize)]
pub struct StartEndpointKwargs {
    pub name: Option<String>,
    #[serde(default)]
    pub amqp_creds: Option<Value>,
    #[serde(default)]
    pub user_opts: serde_json::Map<String, Value>,
}

/// Outbound health report (`spec.md` §6, "Heartbeat wire format").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpStatusReport {
    pub endpoint_id: String,
    pub global_state: GlobalState,
    pub task_statuses: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalState {
    /// `0` means "shutting down now" (`spec.md` §6/§8).
    pub heartbeat_period: i64,
}

impl EpStatusReport {
    pub fn new(endpoint_id: &str, heartbeat_period: i64) -> Self {
        EpStatusReport {
            endpoint_id: endpoint_id.to_string(),
            global_state: GlobalState { heartbeat_period },
            task_statuses: serde_json::Map::new(),
        }
    }

    /// MessagePack-encodes this report for the publisher (C3).
    pub fn pack(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec_named(self)
    }
}

/// Message properties carried alongside a command delivery: `content_type`
/// and the server's Unix-seconds `timestamp`, plus optional headers.
#[derive(Debug, Clone, Default)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub timestamp: Option<i64>,
    pub headers: std::collections::HashMap<String, bool>,
}

impl MessageProperties {
    pub fn debug_requested(&self) -> bool {
        self.headers.get("debug").copied().unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_period_zero_means_shutting_down() {
        let report = EpStatusReport::new("ep-1", 0);
        assert_eq!(report.global_state.heartbeat_period, 0);
        report.pack().unwrap();
    }

    #[test]
    fn command_message_decodes_minimal_start_endpoint() {
        let body = serde_json::json!({
            "command": "cmd_start_endpoint",
            "args": [],
            "kwargs": {"name": "ep1"},
            "globus_effective_identity": "11111111-1111-1111-1111-111111111111",
            "globus_identity_set": [{"sub": "aaaa"}],
            "globus_username": "alice@example.org",
        });
        let msg: CommandMessage = serde_json::from_value(body).unwrap();
        assert_eq!(msg.command.as_deref(), Some("cmd_start_endpoint"));
        assert_eq!(msg.globus_identity_set.len(), 1);
        assert_eq!(msg.globus_identity_set[0].sub, "aaaa");

        let kwargs: StartEndpointKwargs =
            serde_json::from_value(Value::Object(msg.kwargs)).unwrap();
        assert_eq!(kwargs.name.as_deref(), Some("ep1"));
    }
}
