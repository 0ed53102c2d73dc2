use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A request to run a piece of code on behalf of a session.
///
/// The session id is the deduplication key: a session has at most one
/// outstanding request anywhere in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    pub session_id: String,
    pub language: String,
    pub code: String,
}

impl ExecutionRequest {
    pub fn new(
        session_id: impl Into<String>,
        language: impl Into<String>,
        code: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            language: language.into(),
            code: code.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Timeout,
    Cancelled,
    Error(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Timeout => write!(f, "timeout"),
            FailureReason::Cancelled => write!(f, "cancelled"),
            FailureReason::Error(msg) => write!(f, "{}", msg),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Active,
    Completed,
    Failed(FailureReason),
}

impl JobState {
    /// Completed and Failed are terminal; nothing transitions out of them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed(_))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub request: ExecutionRequest,
    pub state: JobState,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// Times the job was handed back to the pending queue by recovery
    #[serde(default)]
    pub redeliveries: u32,
}

impl Job {
    pub fn new(request: ExecutionRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            request,
            state: JobState::Queued,
            enqueued_at: Utc::now(),
            started_at: None,
            redeliveries: 0,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.request.session_id
    }

    pub fn activate(&mut self) {
        self.state = JobState::Active;
        self.started_at = Some(Utc::now());
    }

    /// Back to Queued for another worker
    pub fn requeue(&mut self) {
        self.state = JobState::Queued;
        self.started_at = None;
        self.redeliveries += 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Stdout => write!(f, "stdout"),
            StreamKind::Stderr => write!(f, "stderr"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleCommand {
    Start,
    End,
}

/// `command` event: `{"sessionId": "...", "command": "start" | "end"}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandEvent {
    pub session_id: String,
    pub command: LifecycleCommand,
}

/// `output` event: `{"sessionId": "...", "stream": "stdout", "output": "..."}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputEvent {
    pub session_id: String,
    pub stream: StreamKind,
    pub output: String,
}

/// Everything a running execution reports back to its session room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Command(CommandEvent),
    Output(OutputEvent),
}

impl SessionEvent {
    pub const COMMAND: &'static str = "command";
    pub const OUTPUT: &'static str = "output";

    pub fn start(session_id: impl Into<String>) -> Self {
        SessionEvent::Command(CommandEvent {
            session_id: session_id.into(),
            command: LifecycleCommand::Start,
        })
    }

    pub fn end(session_id: impl Into<String>) -> Self {
        SessionEvent::Command(CommandEvent {
            session_id: session_id.into(),
            command: LifecycleCommand::End,
        })
    }

    pub fn output(
        session_id: impl Into<String>,
        stream: StreamKind,
        output: impl Into<String>,
    ) -> Self {
        SessionEvent::Output(OutputEvent {
            session_id: session_id.into(),
            stream,
            output: output.into(),
        })
    }

    /// Wire event name clients listen on.
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::Command(_) => Self::COMMAND,
            SessionEvent::Output(_) => Self::OUTPUT,
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            SessionEvent::Command(e) => &e.session_id,
            SessionEvent::Output(e) => &e.session_id,
        }
    }

    pub fn payload(&self) -> serde_json::Result<serde_json::Value> {
        match self {
            SessionEvent::Command(e) => serde_json::to_value(e),
            SessionEvent::Output(e) => serde_json::to_value(e),
        }
    }
}

/// Unit of cluster-wide fanout.
///
/// `origin` identifies the publishing instance and `seq` increases
/// monotonically per origin, which lets receivers drop redelivered copies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub room: String,
    pub event: String,
    pub payload: serde_json::Value,
    pub origin: String,
    pub seq: u64,
}

/// Frames a client sends over its realtime connection.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Join {
        room: String,
    },
    Leave {
        room: String,
    },
    Publish {
        room: String,
        event: String,
        #[serde(default)]
        payload: serde_json::Value,
    },
}

/// Frame delivered to a client for every envelope routed to one of its rooms.
#[derive(Debug, Clone, Serialize)]
pub struct ServerFrame<'a> {
    pub room: &'a str,
    pub event: &'a str,
    pub payload: &'a serde_json::Value,
}

impl<'a> From<&'a Envelope> for ServerFrame<'a> {
    fn from(envelope: &'a Envelope) -> Self {
        Self {
            room: &envelope.room,
            event: &envelope.event,
            payload: &envelope.payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_event_wire_shape() {
        let payload = SessionEvent::start("s1").payload().unwrap();
        assert_eq!(
            payload,
            serde_json::json!({ "sessionId": "s1", "command": "start" })
        );
    }

    #[test]
    fn test_output_event_wire_shape() {
        let event = SessionEvent::output("s1", StreamKind::Stderr, "boom");
        assert_eq!(event.name(), "output");
        assert_eq!(
            event.payload().unwrap(),
            serde_json::json!({ "sessionId": "s1", "stream": "stderr", "output": "boom" })
        );
    }

    #[test]
    fn test_terminal_states() {
        assert!(!JobState::Queued.is_terminal());
        assert!(!JobState::Active.is_terminal());
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed(FailureReason::Timeout).is_terminal());
    }

    #[test]
    fn test_requeue_changes_the_record() {
        let mut job = Job::new(ExecutionRequest::new("s1", "python", "print(1)"));
        let before = serde_json::to_string(&job).unwrap();

        job.activate();
        job.requeue();

        assert_eq!(job.state, JobState::Queued);
        assert!(job.started_at.is_none());
        assert_eq!(job.redeliveries, 1);
        assert_ne!(serde_json::to_string(&job).unwrap(), before);
    }

    #[test]
    fn test_job_without_redeliveries_field_parses() {
        let job = Job::new(ExecutionRequest::new("s1", "python", "print(1)"));
        let mut value = serde_json::to_value(&job).unwrap();
        value.as_object_mut().unwrap().remove("redeliveries");

        let parsed: Job = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.redeliveries, 0);
    }

    #[test]
    fn test_client_frame_parsing() {
        let join: ClientFrame = serde_json::from_str(r#"{"type":"join","room":"s1"}"#).unwrap();
        assert_eq!(join, ClientFrame::Join { room: "s1".into() });

        let publish: ClientFrame =
            serde_json::from_str(r#"{"type":"publish","room":"s1","event":"cursor"}"#).unwrap();
        assert_eq!(
            publish,
            ClientFrame::Publish {
                room: "s1".into(),
                event: "cursor".into(),
                payload: serde_json::Value::Null,
            }
        );
    }

    #[test]
    fn test_request_accepts_camel_case() {
        let req: ExecutionRequest = serde_json::from_str(
            r#"{"sessionId":"abc","language":"python","code":"print(1)"}"#,
        )
        .unwrap();
        assert_eq!(req, ExecutionRequest::new("abc", "python", "print(1)"));
    }
}
