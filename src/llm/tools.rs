//! Tool Functions (spec.md §4.5): `send_notification`, `transfer_conversation`,
//! `end_conversation`, `schedule_followup`. Represented as a registry of
//! boxed trait objects rather than scanned annotated methods, per spec.md
//! §9's "Tool registry" design note and the teacher's
//! `backend::factory`-style registry-of-named-things pattern.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use crate::external::{HangupSink, SmsSink, TransferSink};

#[derive(Debug, Clone)]
pub struct ParameterSchema {
    pub name: &'static str,
    pub kind: &'static str,
    pub description: &'static str,
    pub required: bool,
    pub default: Option<&'static str>,
}

impl ParameterSchema {
    /// Every declared parameter type in this crate's tool set is `string`
    /// per spec.md §4.5 ("all strings"); a non-string declaration would
    /// be rejected by the LLM provider for required parameters, so the
    /// engine logs a warning at startup for any tool that violates this
    /// (see `TurnEngine::new`).
    pub fn is_string(&self) -> bool {
        self.kind == "string"
    }
}

#[derive(Debug)]
pub enum ToolError {
    MissingArgument(&'static str),
    Failed(String),
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolError::MissingArgument(name) => write!(f, "missing required argument: {name}"),
            ToolError::Failed(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for ToolError {}

fn require<'a>(args: &'a HashMap<String, String>, name: &'static str) -> Result<&'a str, ToolError> {
    args.get(name)
        .map(|s| s.as_str())
        .filter(|s| !s.is_empty())
        .ok_or(ToolError::MissingArgument(name))
}

fn ok_json(status: &str, message: String) -> String {
    json!({ "status": status, "message": message }).to_string()
}

fn err_json(error: &str, details: String) -> String {
    json!({ "error": error, "details": details }).to_string()
}

#[async_trait::async_trait]
pub trait ToolFunction: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    fn parameters(&self) -> &'static [ParameterSchema];
    async fn invoke(&self, args: &HashMap<String, String>) -> String;
}

/// `send_notification`: logs the issue (and optionally dispatches an SMS)
/// so a human operator can follow up.
pub struct SendNotification {
    pub sms: Option<Arc<dyn SmsSink>>,
    pub notify_number: Option<String>,
}

const SEND_NOTIFICATION_PARAMS: &[ParameterSchema] = &[
    ParameterSchema {
        name: "issue",
        kind: "string",
        description: "What the caller needs help with",
        required: true,
        default: None,
    },
    ParameterSchema {
        name: "location",
        kind: "string",
        description: "Caller's location, if given",
        required: false,
        default: None,
    },
    ParameterSchema {
        name: "urgency",
        kind: "string",
        description: "low, medium, or high",
        required: false,
        default: Some("medium"),
    },
    ParameterSchema {
        name: "caller_name",
        kind: "string",
        description: "Caller's name, if given",
        required: false,
        default: None,
    },
];

#[async_trait::async_trait]
impl ToolFunction for SendNotification {
    fn name(&self) -> &'static str {
        "send_notification"
    }

    fn description(&self) -> &'static str {
        "Notify an operator about a caller's issue."
    }

    fn parameters(&self) -> &'static [ParameterSchema] {
        SEND_NOTIFICATION_PARAMS
    }

    async fn invoke(&self, args: &HashMap<String, String>) -> String {
        let issue = match require(args, "issue") {
            Ok(v) => v,
            Err(e) => return err_json("invalid_arguments", e.to_string()),
        };
        let urgency = args
            .get("urgency")
            .map(|s| s.as_str())
            .unwrap_or("medium");
        let location = args.get("location").map(|s| s.as_str()).unwrap_or("");
        let caller_name = args.get("caller_name").map(|s| s.as_str()).unwrap_or("");

        println!(
            "notification: issue={issue:?} urgency={urgency} location={location:?} caller={caller_name:?}"
        );

        if let (Some(sms), Some(number)) = (&self.sms, &self.notify_number) {
            let body = format!("[{urgency}] {issue} (caller: {caller_name}, loc: {location})");
            if !sms.send_sms(number, &body).await {
                eprintln!("send_notification: SMS dispatch failed, continuing");
            }
        }

        ok_json("sent", format!("Notification logged for: {issue}"))
    }
}

/// `transfer_conversation`: resolves an extension alias to a full address
/// via a configured mapping, then fire-and-forget invokes `transfer`.
pub struct TransferConversation {
    pub extension_map: HashMap<String, String>,
    pub transfer_sink: Arc<dyn TransferSink>,
}

const TRANSFER_PARAMS: &[ParameterSchema] = &[
    ParameterSchema {
        name: "extension",
        kind: "string",
        description: "Extension alias to transfer to",
        required: true,
        default: None,
    },
    ParameterSchema {
        name: "reason",
        kind: "string",
        description: "Why the transfer is needed",
        required: false,
        default: None,
    },
];

#[async_trait::async_trait]
impl ToolFunction for TransferConversation {
    fn name(&self) -> &'static str {
        "transfer_conversation"
    }

    fn description(&self) -> &'static str {
        "Transfer the call to a named extension."
    }

    fn parameters(&self) -> &'static [ParameterSchema] {
        TRANSFER_PARAMS
    }

    async fn invoke(&self, args: &HashMap<String, String>) -> String {
        let extension = match require(args, "extension") {
            Ok(v) => v,
            Err(e) => return err_json("invalid_arguments", e.to_string()),
        };
        let Some(address) = self.extension_map.get(extension).cloned() else {
            return err_json(
                "unknown_extension",
                format!("no address configured for extension {extension:?}"),
            );
        };

        let sink = self.transfer_sink.clone();
        let address_for_task = address.clone();
        tokio::spawn(async move {
            if !sink.transfer(&address_for_task).await {
                eprintln!("transfer_conversation: transfer to {address_for_task} failed");
            }
        });

        ok_json("transferring", format!("Transferring to extension {address}."))
    }
}

/// `end_conversation`: schedules a deferred hang-up so the TTS farewell
/// has time to play first.
pub struct EndConversation {
    pub hangup_sink: Arc<dyn HangupSink>,
    pub delay: Duration,
}

impl EndConversation {
    pub fn new(hangup_sink: Arc<dyn HangupSink>) -> Self {
        Self {
            hangup_sink,
            delay: Duration::from_secs(3),
        }
    }
}

const END_CONVERSATION_PARAMS: &[ParameterSchema] = &[ParameterSchema {
    name: "reason",
    kind: "string",
    description: "Why the conversation is ending",
    required: false,
    default: None,
}];

#[async_trait::async_trait]
impl ToolFunction for EndConversation {
    fn name(&self) -> &'static str {
        "end_conversation"
    }

    fn description(&self) -> &'static str {
        "End the call after the farewell plays."
    }

    fn parameters(&self) -> &'static [ParameterSchema] {
        END_CONVERSATION_PARAMS
    }

    async fn invoke(&self, args: &HashMap<String, String>) -> String {
        let reason = args.get("reason").map(|s| s.as_str()).unwrap_or("unspecified");
        println!("end_conversation: scheduling hang-up in {:?} ({reason})", self.delay);

        let sink = self.hangup_sink.clone();
        let delay = self.delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            sink.hangup();
        });

        ok_json("ending", "Ending the call after the farewell.".to_string())
    }
}

/// `schedule_followup`: logs a requested callback/service appointment.
pub struct ScheduleFollowup;

const SCHEDULE_FOLLOWUP_PARAMS: &[ParameterSchema] = &[
    ParameterSchema {
        name: "service_type",
        kind: "string",
        description: "Kind of follow-up requested",
        required: false,
        default: Some("callback"),
    },
    ParameterSchema {
        name: "location",
        kind: "string",
        description: "Where the follow-up should happen",
        required: false,
        default: None,
    },
    ParameterSchema {
        name: "preferred_time",
        kind: "string",
        description: "Caller's preferred time",
        required: false,
        default: None,
    },
];

#[async_trait::async_trait]
impl ToolFunction for ScheduleFollowup {
    fn name(&self) -> &'static str {
        "schedule_followup"
    }

    fn description(&self) -> &'static str {
        "Schedule a follow-up contact with the caller."
    }

    fn parameters(&self) -> &'static [ParameterSchema] {
        SCHEDULE_FOLLOWUP_PARAMS
    }

    async fn invoke(&self, args: &HashMap<String, String>) -> String {
        let service_type = args
            .get("service_type")
            .map(|s| s.as_str())
            .unwrap_or("callback");
        let location = args.get("location").map(|s| s.as_str()).unwrap_or("");
        let preferred_time = args.get("preferred_time").map(|s| s.as_str()).unwrap_or("");

        println!(
            "schedule_followup: type={service_type} location={location:?} time={preferred_time:?}"
        );

        ok_json(
            "scheduled",
            format!("Follow-up ({service_type}) scheduled."),
        )
    }
}

/// Named table of tool functions, serialized to the model request and
/// dispatched by name on response (spec.md §9).
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn ToolFunction>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn ToolFunction>) -> &mut Self {
        for param in tool.parameters() {
            if param.required && !param.is_string() {
                eprintln!(
                    "tool registry: {} declares non-string required parameter {:?}; the LLM provider rejects this",
                    tool.name(),
                    param.name
                );
            }
        }
        self.tools.push(tool);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn ToolFunction>> {
        self.tools.iter().find(|t| t.name() == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn ToolFunction>> {
        self.tools.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn send_notification_requires_issue() {
        let tool = SendNotification {
            sms: None,
            notify_number: None,
        };
        let result = tool.invoke(&args(&[])).await;
        assert!(result.contains("\"error\""));
    }

    #[tokio::test]
    async fn send_notification_succeeds_with_issue_only() {
        let tool = SendNotification {
            sms: None,
            notify_number: None,
        };
        let result = tool.invoke(&args(&[("issue", "no power")])).await;
        assert!(result.contains("\"status\":\"sent\""));
    }

    struct AlwaysTransfers;
    #[async_trait::async_trait]
    impl TransferSink for AlwaysTransfers {
        async fn transfer(&self, _full_address: &str) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn transfer_conversation_resolves_alias_to_address() {
        let mut map = HashMap::new();
        map.insert("personal".to_string(), "102@slowcasting.com".to_string());
        let tool = TransferConversation {
            extension_map: map,
            transfer_sink: Arc::new(AlwaysTransfers),
        };
        let result = tool
            .invoke(&args(&[("extension", "personal"), ("reason", "urgent")]))
            .await;
        assert!(result.contains("102@slowcasting.com"));
    }

    #[tokio::test]
    async fn transfer_conversation_reports_unknown_extension() {
        let tool = TransferConversation {
            extension_map: HashMap::new(),
            transfer_sink: Arc::new(AlwaysTransfers),
        };
        let result = tool.invoke(&args(&[("extension", "ghost")])).await;
        assert!(result.contains("\"error\""));
    }

    #[tokio::test]
    async fn registry_dispatches_by_name() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(ScheduleFollowup));
        assert!(registry.get("schedule_followup").is_some());
        assert!(registry.get("nonexistent").is_none());
    }
}
