//! Message schema shared by relays, workers and browsers.
//!
//! Protobuf field numbers are part of the wire contract: adding a type or a
//! field must be rolled out to every peer and worker at once.

use serde::{Deserialize, Serialize};

use crate::protocol::codec::DecodeError;

/// Closed set of message types.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration, Serialize, Deserialize,
)]
#[repr(i32)]
pub enum MessageType {
    /// Zero value of the field. A frame that omits its type decodes to this
    /// and is rejected; it is never sent.
    Unspecified = 0,
    ExecuteCode = 1,
    Output = 2,
}

impl MessageType {
    /// Every sendable type, in wire-number order.
    pub const ALL: [MessageType; 2] = [MessageType::ExecuteCode, MessageType::Output];

    /// Canonical upper-case name, as exposed to browsers.
    pub const fn as_str_name(&self) -> &'static str {
        match self {
            MessageType::Unspecified => "UNSPECIFIED",
            MessageType::ExecuteCode => "EXECUTE_CODE",
            MessageType::Output => "OUTPUT",
        }
    }

    pub fn from_str_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str_name() == name)
    }
}

/// Name → number table served to browsers so both sides agree on type values.
pub fn message_types_json() -> serde_json::Value {
    let table: serde_json::Map<String, serde_json::Value> = MessageType::ALL
        .iter()
        .map(|t| (t.as_str_name().to_string(), serde_json::Value::from(*t as i32)))
        .collect();
    serde_json::Value::Object(table)
}

/// Request payload: code to run on a worker.
#[derive(Clone, PartialEq, Eq, prost::Message, Serialize, Deserialize)]
pub struct ExecuteCode {
    #[prost(string, tag = "1")]
    #[serde(default)]
    pub code: String,
}

/// One response fragment. `done` marks the last fragment of a sequence.
#[derive(Clone, PartialEq, Eq, prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct Output {
    #[prost(string, tag = "1")]
    pub stdout: String,
    #[prost(string, tag = "2")]
    pub stderr: String,
    #[prost(bool, tag = "3")]
    pub done: bool,
}

/// A tagged protocol message.
///
/// `id` correlates every response fragment with the request that caused it.
#[derive(Clone, PartialEq, Eq, prost::Message, Serialize, Deserialize)]
pub struct Message {
    #[prost(enumeration = "MessageType", tag = "1")]
    #[serde(rename = "type")]
    pub r#type: i32,

    #[prost(int64, tag = "2")]
    #[serde(default)]
    pub id: i64,

    #[prost(message, optional, tag = "3")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execute_code: Option<ExecuteCode>,

    #[prost(message, optional, tag = "4")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Output>,
}

impl Message {
    /// Build an `EXECUTE_CODE` request.
    pub fn execute_code(id: i64, code: impl Into<String>) -> Self {
        Self {
            r#type: MessageType::ExecuteCode as i32,
            id,
            execute_code: Some(ExecuteCode { code: code.into() }),
            output: None,
        }
    }

    /// Build an `OUTPUT` fragment.
    pub fn output(id: i64, stdout: impl Into<String>, stderr: impl Into<String>, done: bool) -> Self {
        Self {
            r#type: MessageType::Output as i32,
            id,
            execute_code: None,
            output: Some(Output {
                stdout: stdout.into(),
                stderr: stderr.into(),
                done,
            }),
        }
    }

    /// Terminal fragment sent when an execution is killed.
    pub fn killed(id: i64) -> Self {
        Self::output(id, "", "killed", true)
    }

    /// Terminal fragment sent when no worker could be reached.
    pub fn connect_failed(id: i64) -> Self {
        Self::output(id, "", "unable to connect to worker", true)
    }

    /// The decoded type, or `None` for a missing type or a number outside the known table.
    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::try_from(self.r#type)
            .ok()
            .filter(|t| *t != MessageType::Unspecified)
    }

    /// Request code text, if this is an `EXECUTE_CODE` message.
    pub fn code(&self) -> Option<&str> {
        self.execute_code.as_ref().map(|e| e.code.as_str())
    }

    /// True for the terminal fragment of a response sequence.
    pub fn is_done(&self) -> bool {
        self.output.as_ref().is_some_and(|o| o.done)
    }

    /// Copy of this message carrying a different correlation id.
    pub fn with_id(&self, id: i64) -> Self {
        let mut m = self.clone();
        m.id = id;
        m
    }

    /// Check that the declared type is known and carries exactly its own payload.
    pub fn validate(&self) -> Result<(), DecodeError> {
        let kind = self
            .message_type()
            .ok_or(DecodeError::UnknownType(self.r#type))?;

        let (has_own, has_other, own, other) = match kind {
            MessageType::Unspecified => return Err(DecodeError::UnknownType(self.r#type)),
            MessageType::ExecuteCode => (
                self.execute_code.is_some(),
                self.output.is_some(),
                "execute_code",
                "output",
            ),
            MessageType::Output => (
                self.output.is_some(),
                self.execute_code.is_some(),
                "output",
                "execute_code",
            ),
        };

        if !has_own {
            return Err(DecodeError::MissingPayload {
                kind: kind.as_str_name(),
                field: own,
            });
        }
        if has_other {
            return Err(DecodeError::UnexpectedPayload {
                kind: kind.as_str_name(),
                field: other,
            });
        }
        Ok(())
    }
}
