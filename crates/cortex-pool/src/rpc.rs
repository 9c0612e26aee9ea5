//! Newline-delimited JSON-RPC 2.0 framing for tool subprocess duplexes.

use serde::Serialize;
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

/// Protocol version announced in the `initialize` handshake.
pub const PROTOCOL_VERSION: &str = "1.0";

#[derive(Debug, Serialize)]
struct OutgoingFrame<'a> {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
    method: &'a str,
    params: &'a Value,
}

/// Encode a request as one newline-terminated frame.
pub fn request_frame(id: u64, method: &str, params: &Value) -> String {
    encode(OutgoingFrame {
        jsonrpc: JSONRPC_VERSION,
        id: Some(id),
        method,
        params,
    })
}

/// Encode a notification (no id, no response expected).
pub fn notification_frame(method: &str, params: &Value) -> String {
    encode(OutgoingFrame {
        jsonrpc: JSONRPC_VERSION,
        id: None,
        method,
        params,
    })
}

/// Encode a response to a server-to-client request.
pub fn response_frame(id: &Value, result: &Value) -> String {
    let frame = serde_json::json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "result": result,
    });
    format!("{}\n", frame)
}

fn encode(frame: OutgoingFrame<'_>) -> String {
    // The frame only contains JSON-representable data.
    let json = serde_json::to_string(&frame).unwrap_or_default();
    format!("{}\n", json)
}

/// A classified inbound frame from a child's stdout.
#[derive(Debug)]
pub enum Incoming {
    /// Response to one of our requests.
    Response {
        id: u64,
        result: std::result::Result<Value, RpcError>,
    },
    /// Server-to-client request; must be answered to keep the duplex moving.
    Request {
        id: Value,
        method: String,
        params: Value,
    },
    /// Fire-and-forget notification (`initialized`, progress, …).
    Notification { method: String, params: Value },
}

#[derive(Debug, Clone)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

/// Parse one line into a frame. Non-JSON lines return `None`.
pub fn parse_incoming(line: &str) -> Option<Incoming> {
    let value: Value = serde_json::from_str(line.trim()).ok()?;

    let id = value.get("id").filter(|v| !v.is_null());
    let method = value.get("method").and_then(Value::as_str);

    match (id, method) {
        (Some(id), None) => {
            let id = id.as_u64()?;
            if let Some(error) = value.get("error") {
                let code = error.get("code").and_then(Value::as_i64).unwrap_or(0);
                let message = error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string();
                Some(Incoming::Response {
                    id,
                    result: Err(RpcError { code, message }),
                })
            } else {
                Some(Incoming::Response {
                    id,
                    result: Ok(value.get("result").cloned().unwrap_or(Value::Null)),
                })
            }
        }
        (Some(id), Some(method)) => Some(Incoming::Request {
            id: id.clone(),
            method: method.to_string(),
            params: value.get("params").cloned().unwrap_or(Value::Null),
        }),
        (None, Some(method)) => Some(Incoming::Notification {
            method: method.to_string(),
            params: value.get("params").cloned().unwrap_or(Value::Null),
        }),
        (None, None) => None,
    }
}
