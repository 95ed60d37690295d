//! Browser socket protocol.
//!
//! Server to client: every text message is a JSON array of [`Command`]s,
//! applied in order. Client to server: one JSON object per message with a
//! `type` field. `start`, `done`, `error`, `disconnect` and
//! `live-disconnected` are control events handled by the session; any other
//! type is queued for the application.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Close code sent when the application finished or the process was reaped.
pub const CLOSE_APP_DONE: u16 = 3001;
/// Close code sent when the socket names a process that does not exist.
pub const CLOSE_MISSING_PROCESS: u16 = 3002;

/// How `put` content is inserted relative to the selected element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SwapMethod {
    #[serde(rename = "innerHTML")]
    InnerHtml,
    #[serde(rename = "outerHTML")]
    OuterHtml,
    #[serde(rename = "beforebegin")]
    BeforeBegin,
    #[serde(rename = "afterbegin")]
    AfterBegin,
    #[serde(rename = "beforeend")]
    BeforeEnd,
    #[serde(rename = "afterend")]
    AfterEnd,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum Command {
    Put {
        selector: String,
        method: SwapMethod,
        content: String,
    },
    /// Head resources (stylesheets, scripts) the content depends on.
    Resource { content: String },
    Eval { code: String, module: bool },
    Error { content: String },
    Log { content: String },
}

impl Command {
    pub fn put(selector: impl Into<String>, method: SwapMethod, content: impl Into<String>) -> Self {
        Command::Put {
            selector: selector.into(),
            method,
            content: content.into(),
        }
    }

    pub fn eval(code: impl Into<String>) -> Self {
        Command::Eval {
            code: code.into(),
            module: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("event is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("event must be a JSON object with a string `type`")]
    Shape,
}

/// An event received from the browser.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub kind: String,
    pub data: Map<String, Value>,
}

impl Event {
    pub fn parse(text: &str) -> Result<Self, EventError> {
        let Value::Object(mut data) = serde_json::from_str::<Value>(text)? else {
            return Err(EventError::Shape);
        };
        let Some(Value::String(kind)) = data.remove("type") else {
            return Err(EventError::Shape);
        };
        Ok(Self { kind, data })
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Classify session-level events. `None` means the event belongs to
    /// the application.
    pub fn control(&self) -> Option<Control> {
        let text = |key: &str| {
            self.data
                .get(key)
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_default()
        };
        match self.kind.as_str() {
            "start" => Some(Control::Start {
                number: self.data.get("number").and_then(Value::as_u64),
            }),
            "done" => Some(Control::Done),
            "error" => Some(Control::Error(text("message"))),
            "disconnect" => Some(Control::Disconnect),
            "live-disconnected" => Some(Control::LiveDisconnected { id: text("id") }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Control {
    /// The client connected; `number` counts its connection attempts.
    Start { number: Option<u64> },
    Done,
    Error(String),
    Disconnect,
    /// A live element was removed from the page; cancel its producer.
    LiveDisconnected { id: String },
}
