//! Wire framing for the media server's JSON-RPC dialect.

use crate::calls::Call;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

pub const JSONRPC_VERSION: &str = "2.0";

/// An outbound correlated request.
#[derive(Debug, Serialize)]
pub struct Request<'a> {
    pub jsonrpc: &'static str,
    pub method: &'a str,
    pub params: Value,
    pub id: u64,
}

impl<'a> Request<'a> {
    pub fn new(method: &'a str, params: Value, id: u64) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            method,
            params,
            id,
        }
    }
}

/// A reply to a request the media server sent us. The id is echoed verbatim
/// rather than typed: we respond to whatever the server chose to send.
#[derive(Debug, Serialize)]
pub struct Response {
    pub jsonrpc: &'static str,
    pub result: Value,
    pub id: Value,
}

impl Response {
    pub fn new(result: Value, id: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            result,
            id,
        }
    }
}

/// Any frame the media server may send: a response to one of our requests
/// (`result` or `error` set), or a request/notification of its own
/// (`method` set).
#[derive(Debug, Default, Deserialize)]
pub struct IncomingFrame {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
}

impl IncomingFrame {
    /// The frame's id as a request counter, when it carries one.
    pub fn numeric_id(&self) -> Option<u64> {
        self.id.as_ref().and_then(Value::as_u64)
    }
}

/// Per-call dialog parameters: the configured base set with this call's
/// routing fields layered on top.
pub fn dialog_params_for(base: &Map<String, Value>, call: &Call) -> Value {
    let mut params = base.clone();
    params.insert("callID".into(), call.remote_call_id.clone().into());
    params.insert(
        "destination_number".into(),
        call.target_address.clone().into(),
    );
    params.insert(
        "remote_caller_id_number".into(),
        call.target_address.clone().into(),
    );
    params.insert("caller_id_name".into(), call.caller.clone().into());
    Value::Object(params)
}

/// Generates an opaque token for bridge-assigned call ids and transport
/// session ids: current time plus random bytes, hashed and hex-encoded.
pub fn generate_token() -> String {
    let mut data = Vec::with_capacity(8 + 16);
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    data.extend_from_slice(&timestamp.to_be_bytes());

    let mut random_bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut random_bytes);
    data.extend_from_slice(&random_bytes);

    let hash = Sha256::digest(&data);
    hex::encode(&hash[..16])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_call() -> Call {
        Call::new(
            "local-1".into(),
            "remote-1".into(),
            "!room:example.org".into(),
            "voip_5551234".into(),
            "5551234".into(),
            "@caller:example.org".into(),
            "v=0".into(),
            Vec::new(),
        )
    }

    #[test]
    fn test_request_serializes_with_version_and_id() {
        let request = Request::new("login", json!({"login": "user"}), 1);
        let encoded = serde_json::to_value(&request).unwrap();
        assert_eq!(
            encoded,
            json!({"jsonrpc": "2.0", "method": "login", "params": {"login": "user"}, "id": 1})
        );
    }

    #[test]
    fn test_incoming_frame_tolerates_partial_shapes() {
        let response: IncomingFrame =
            serde_json::from_str(r#"{"jsonrpc": "2.0", "result": {}, "id": 7}"#).unwrap();
        assert_eq!(response.numeric_id(), Some(7));
        assert!(response.method.is_none());

        let notification: IncomingFrame =
            serde_json::from_str(r#"{"jsonrpc": "2.0", "method": "verto.bye", "params": {}}"#)
                .unwrap();
        assert_eq!(notification.method.as_deref(), Some("verto.bye"));
        assert_eq!(notification.numeric_id(), None);
    }

    #[test]
    fn test_dialog_params_layer_call_fields_over_base() {
        let mut base = Map::new();
        base.insert("ani".into(), "bridge".into());
        let call = make_call();

        let params = dialog_params_for(&base, &call);
        assert_eq!(params["ani"], "bridge");
        assert_eq!(params["callID"], "remote-1");
        assert_eq!(params["destination_number"], "5551234");
        assert_eq!(params["remote_caller_id_number"], "5551234");
        assert_eq!(params["caller_id_name"], "@caller:example.org");
    }

    #[test]
    fn test_tokens_are_hex_and_unique() {
        let a = generate_token();
        let b = generate_token();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
