//! Protocol messages and the factory that builds them.
//!
//! A `Message` is an immutable value: an id, a type from the Jupyter
//! vocabulary (`*_request`, `*_reply`, broadcasts such as `status`), the id
//! of the request it answers, and an ordered content mapping.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Ordered mapping of protocol-defined content fields.
pub type Content = Map<String, Value>;

/// `execution_state` values carried by `status` broadcasts.
pub mod execution_state {
    pub const BUSY: &str = "busy";
    pub const IDLE: &str = "idle";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    id: String,
    #[serde(rename = "type")]
    msg_type: String,
    #[serde(default)]
    parent_id: String,
    #[serde(default)]
    session: String,
    #[serde(default)]
    content: Content,
}

impl Message {
    /// Assemble a message from already-known parts, e.g. one decoded off
    /// the wire. Use `MessageFactory` to create new messages.
    pub fn from_parts(
        id: impl Into<String>,
        msg_type: impl Into<String>,
        parent_id: impl Into<String>,
        session: impl Into<String>,
        content: Content,
    ) -> Self {
        Self {
            id: id.into(),
            msg_type: msg_type.into(),
            parent_id: parent_id.into(),
            session: session.into(),
            content,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn msg_type(&self) -> &str {
        &self.msg_type
    }

    /// Id of the request this message answers; empty for initiating requests.
    pub fn parent_id(&self) -> &str {
        &self.parent_id
    }

    pub fn has_parent(&self) -> bool {
        !self.parent_id.is_empty()
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn content(&self) -> &Content {
        &self.content
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.content.get(field)
    }

    pub fn is_request(&self) -> bool {
        self.msg_type.ends_with("_request")
    }

    pub fn is_reply(&self) -> bool {
        self.msg_type.ends_with("_reply")
    }

    /// `execution_state` of a `status` broadcast.
    pub fn execution_state(&self) -> Option<&str> {
        if self.msg_type != "status" {
            return None;
        }
        self.content.get("execution_state").and_then(Value::as_str)
    }

    pub fn is_busy_status(&self) -> bool {
        self.execution_state() == Some(execution_state::BUSY)
    }

    /// Whether this is the status message that terminates a request.
    pub fn is_idle_status(&self) -> bool {
        self.execution_state() == Some(execution_state::IDLE)
    }
}

/// Map a request type to its reply type.
///
/// Replaces the *first* occurrence of `request` with `reply`, so
/// `execute_request` becomes `execute_reply`. A type whose leading part
/// already contains `request` has that part rewritten instead of the suffix;
/// callers relying on such types get exactly that substitution.
pub fn derive_reply_type(request_type: &str) -> Result<String> {
    if !request_type.contains("request") {
        return Err(Error::InvalidMessageType(request_type.to_string()));
    }
    Ok(request_type.replacen("request", "reply", 1))
}

/// Protocol-mandated fields added to content when the caller omits them.
fn bookkeeping(msg_type: &str) -> Content {
    let defaults = match msg_type {
        "execute_request" => json!({
            "silent": false,
            "store_history": true,
            "user_expressions": {},
            "allow_stdin": false,
            "stop_on_error": true,
        }),
        "execute_reply" => json!({ "status": "ok", "execution_count": null }),
        "execute_input" => json!({ "execution_count": null }),
        t if t.ends_with("_reply") => json!({ "status": "ok" }),
        _ => json!({}),
    };
    content_from(defaults)
}

/// Builds messages for one session.
#[derive(Debug, Clone)]
pub struct MessageFactory {
    session: String,
}

impl Default for MessageFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageFactory {
    /// A factory with a freshly generated session id.
    pub fn new() -> Self {
        Self::with_session(Uuid::new_v4().to_string())
    }

    pub fn with_session(session: impl Into<String>) -> Self {
        Self {
            session: session.into(),
        }
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    /// Build a message with a fresh id.
    ///
    /// `parent` is `None` when building the initiating request itself.
    /// Caller-supplied content fields take precedence over bookkeeping.
    pub fn build(&self, parent: Option<&Message>, msg_type: &str, mut content: Content) -> Message {
        for (field, value) in bookkeeping(msg_type) {
            content.entry(field).or_insert(value);
        }
        Message {
            id: Uuid::new_v4().to_string(),
            msg_type: msg_type.to_string(),
            parent_id: parent.map(|p| p.id.clone()).unwrap_or_default(),
            session: self.session.clone(),
            content,
        }
    }

    /// Build the reply to `request`, typed via `derive_reply_type`.
    pub fn reply(&self, request: &Message, content: Content) -> Result<Message> {
        let reply_type = derive_reply_type(request.msg_type())?;
        Ok(self.build(Some(request), &reply_type, content))
    }

    /// Build a `status` broadcast for `parent`.
    pub fn status(&self, parent: &Message, state: &str) -> Message {
        let mut content = Content::new();
        content.insert("execution_state".to_string(), Value::from(state));
        self.build(Some(parent), "status", content)
    }
}

/// Turn a `json!({...})` literal into content. Non-objects yield empty content.
pub fn content_from(value: Value) -> Content {
    match value {
        Value::Object(map) => map,
        _ => Content::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_reply_type() {
        assert_eq!(derive_reply_type("execute_request").unwrap(), "execute_reply");
        assert_eq!(derive_reply_type("kernel_info_request").unwrap(), "kernel_info_reply");
    }

    #[test]
    fn test_derive_reply_type_rejects_broadcasts() {
        let err = derive_reply_type("status").unwrap_err();
        assert!(matches!(err, Error::InvalidMessageType(ref t) if t == "status"));
    }

    #[test]
    fn test_derive_reply_type_rewrites_first_occurrence_only() {
        assert_eq!(
            derive_reply_type("requested_data_request").unwrap(),
            "replyed_data_request"
        );
    }

    #[test]
    fn test_build_initiating_request() {
        let factory = MessageFactory::with_session("session-1");
        let msg = factory.build(None, "execute_request", content_from(json!({"code": "1+1"})));

        assert!(!msg.id().is_empty());
        assert_eq!(msg.parent_id(), "");
        assert!(!msg.has_parent());
        assert_eq!(msg.session(), "session-1");
        assert!(msg.is_request());
        assert_eq!(msg.get("code"), Some(&json!("1+1")));
        assert_eq!(msg.get("store_history"), Some(&json!(true)));
        assert_eq!(msg.get("allow_stdin"), Some(&json!(false)));
    }

    #[test]
    fn test_build_generates_fresh_ids() {
        let factory = MessageFactory::new();
        let a = factory.build(None, "kernel_info_request", Content::new());
        let b = factory.build(None, "kernel_info_request", Content::new());
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_caller_content_wins_over_bookkeeping() {
        let factory = MessageFactory::new();
        let msg = factory.build(
            None,
            "execute_request",
            content_from(json!({"code": "x", "silent": true})),
        );
        assert_eq!(msg.get("silent"), Some(&json!(true)));
        // Caller fields keep their position ahead of appended defaults.
        assert_eq!(msg.content().keys().next().map(String::as_str), Some("code"));
    }

    #[test]
    fn test_reply_links_parent_and_adds_status() {
        let factory = MessageFactory::new();
        let request = factory.build(None, "execute_request", content_from(json!({"code": "1"})));
        let reply = factory.reply(&request, Content::new()).unwrap();

        assert_eq!(reply.msg_type(), "execute_reply");
        assert_eq!(reply.parent_id(), request.id());
        assert_eq!(reply.get("status"), Some(&json!("ok")));
        assert_eq!(reply.get("execution_count"), Some(&Value::Null));
    }

    #[test]
    fn test_status_messages() {
        let factory = MessageFactory::new();
        let request = factory.build(None, "kernel_info_request", Content::new());
        let busy = factory.status(&request, execution_state::BUSY);
        let idle = factory.status(&request, execution_state::IDLE);

        assert!(busy.is_busy_status());
        assert!(!busy.is_idle_status());
        assert!(idle.is_idle_status());
        assert_eq!(idle.parent_id(), request.id());
        assert_eq!(request.execution_state(), None);
    }

    #[test]
    fn test_message_serializes_type_field() {
        let msg = Message::from_parts("m1", "status", "p1", "s1", content_from(json!({"execution_state": "idle"})));
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "status");
        assert_eq!(value["parent_id"], "p1");

        let back: Message = serde_json::from_value(value).unwrap();
        assert!(back.is_idle_status());
    }
}
