//! Inbound message envelope.
//!
//! Bodies are JSON objects. Triggers and lifecycle calls arrive either flat
//! or JSON-RPC shaped, with connection identity nested under
//! `params.header.parameters`:
//!
//! ```text
//! { "message_id": "...", "method": "integration.sync.trigger",
//!   "integration_connection_id": "conn-1", "customer_id": "cust-1", ... }
//!
//! { "jsonrpc": "2.0", "method": "clustera.integration.connection.initialize",
//!   "params": { "header": { "parameters": { "integration_connection_id": "conn-1" } } } }
//! ```
//!
//! Webhooks carry no connection id; they name the account by email instead.

use conduit::{WorkerError, WorkerResult};
use serde_json::{Map, Value};

/// Connection ids that mean "not known yet".
const ABSENT_CONNECTION_IDS: &[&str] = &["unknown", "pending"];

#[derive(Debug, Clone)]
pub struct MessageBody {
    raw: Value,
}

impl MessageBody {
    /// Parse a body, rejecting anything that is not a JSON object.
    pub fn parse(bytes: &[u8]) -> WorkerResult<Self> {
        let raw: Value = serde_json::from_slice(bytes)
            .map_err(|e| WorkerError::Malformed(format!("message body is not JSON: {}", e)))?;
        Self::from_value(raw)
    }

    pub fn from_value(raw: Value) -> WorkerResult<Self> {
        if !raw.is_object() {
            return Err(WorkerError::Malformed("message body must be a JSON object".to_string()));
        }
        Ok(Self { raw })
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }

    pub fn into_raw(self) -> Value {
        self.raw
    }

    /// Look a field up at the top level, then under
    /// `params.header.parameters`, then under `params`.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.raw
            .get(name)
            .or_else(|| self.raw.pointer(&format!("/params/header/parameters/{}", name)))
            .or_else(|| self.raw.pointer(&format!("/params/{}", name)))
    }

    fn text(&self, name: &str) -> Option<&str> {
        self.field(name).and_then(Value::as_str).filter(|s| !s.trim().is_empty())
    }

    pub fn message_id(&self) -> Option<&str> {
        self.text("message_id").or_else(|| self.raw.get("id").and_then(Value::as_str))
    }

    pub fn method(&self) -> Option<&str> {
        self.raw.get("method").and_then(Value::as_str)
    }

    pub fn action(&self) -> Option<&str> {
        self.text("action")
    }

    pub fn provider(&self) -> Option<&str> {
        self.text("provider")
    }

    pub fn integration_id(&self) -> Option<&str> {
        self.text("integration_id")
    }

    /// The connection this message targets, with placeholder ids treated as
    /// absent.
    pub fn connection_id(&self) -> Option<&str> {
        self.text("integration_connection_id")
            .filter(|id| !ABSENT_CONNECTION_IDS.contains(&id.to_ascii_lowercase().as_str()))
    }

    pub fn customer_id(&self) -> Option<&str> {
        self.text("customer_id")
    }

    pub fn trigger_type(&self) -> Option<&str> {
        self.text("trigger_type")
    }

    pub fn last_cursor(&self) -> Option<&Value> {
        self.field("last_cursor").filter(|v| !v.is_null())
    }

    /// Handler parameters: `config`, falling back to `params`.
    pub fn params(&self) -> Option<&Map<String, Value>> {
        self.raw
            .get("config")
            .and_then(Value::as_object)
            .or_else(|| self.raw.get("params").and_then(Value::as_object))
    }

    pub fn param_bool(&self, name: &str) -> Option<bool> {
        self.params().and_then(|p| p.get(name)).and_then(Value::as_bool)
    }

    pub fn param_str(&self, name: &str) -> Option<&str> {
        self.params()
            .and_then(|p| p.get(name))
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
    }

    /// Notification payload; gateways that wrap it as `webhook_payload`
    /// are accepted too.
    pub fn payload(&self) -> Option<&Value> {
        self.raw.get("payload").or_else(|| self.raw.get("webhook_payload"))
    }

    /// Provider-side account identity (the user's email for webhooks).
    pub fn external_identity(&self) -> Option<&str> {
        let payload = self.payload();
        payload
            .and_then(|p| p.get("email").or_else(|| p.get("emailAddress")))
            .and_then(Value::as_str)
            .or_else(|| self.raw.get("email").and_then(Value::as_str))
            .filter(|s| !s.trim().is_empty())
    }
}
