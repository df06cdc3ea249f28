//! Wire codec for the gateway protocol
//!
//! Pure translation between typed requests/events and JSON transport
//! frames. Frame construction is side-effect free apart from drawing fresh
//! request ids; `decode` reports malformed input as a [`FrameError`] the
//! engine logs and drops, never as a connection-fatal condition.
//!
//! Frame shapes:
//! - request  `{"type":"req","id":...,"method":...,"params":{...}}`
//! - response `{"type":"res","id":...,"ok":...,"error":{...}?,"result":...?}`
//! - event    `{"type":"event","event":...,"payload":{...}?}`
//!
//! Older gateway builds put the response body under `payload` instead of
//! `result`; the decoder accepts both.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::errors::FrameError;
use crate::identity::{AuthContext, DeviceIdentity};
use crate::settings::{ClientSettings, CLIENT_ID};
use crate::types::{IdempotencyKey, RequestId, Timestamp};

/// Protocol version this client speaks
pub const PROTOCOL_VERSION: u32 = 3;

/// Method names the client sends
pub const METHOD_CONNECT: &str = "connect";
pub const METHOD_CHAT_SEND: &str = "chat.send";
pub const METHOD_PING: &str = "ping";

/// Event the gateway sends before the client authenticates
pub const EVENT_CONNECT_CHALLENGE: &str = "connect.challenge";

/// Error code signalling the pairing-wait state rather than a rejection
pub const ERROR_NOT_PAIRED: &str = "NOT_PAIRED";

// ----------------------------------------------------------------------------
// Frame Union
// ----------------------------------------------------------------------------

/// Decoded wire frame
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Client → gateway request
    Request {
        id: RequestId,
        method: String,
        params: Value,
    },
    /// Gateway → client response, correlated by id
    Response {
        id: RequestId,
        ok: bool,
        error: Option<ErrorShape>,
        result: Option<Value>,
    },
    /// Gateway → client event, no correlation
    Event {
        event: String,
        payload: Option<Value>,
    },
}

/// Error body carried by a failed response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorShape {
    pub code: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorShape {
    /// True when this rejection means "recognized but awaiting operator
    /// approval" rather than a fatal refusal
    pub fn is_not_paired(&self) -> bool {
        self.code == ERROR_NOT_PAIRED || self.message.to_ascii_lowercase().contains("not paired")
    }
}

/// Payload of a `connect.challenge` event
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChallengePayload {
    pub nonce: String,
    #[serde(default)]
    pub ts: Option<u64>,
}

impl ChallengePayload {
    /// Decode a challenge payload, tolerating extra fields
    pub fn from_value(payload: Option<&Value>) -> core::result::Result<Self, FrameError> {
        let value = payload.ok_or(FrameError::MissingField { field: "payload" })?;
        serde_json::from_value(value.clone()).map_err(|e| FrameError::BadPayload {
            reason: e.to_string(),
        })
    }
}

// ----------------------------------------------------------------------------
// Decoding
// ----------------------------------------------------------------------------

/// Decode one inbound frame
///
/// A decode error never poisons the connection: callers log it, drop the
/// frame, and keep reading.
pub fn decode(raw: &str) -> core::result::Result<Frame, FrameError> {
    let value = serde_json::from_str::<Value>(raw).map_err(|e| FrameError::NotJson {
        reason: e.to_string(),
    })?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(FrameError::MissingField { field: "type" })?;

    match kind {
        "req" => {
            let id = value
                .get("id")
                .and_then(Value::as_str)
                .ok_or(FrameError::MissingField { field: "id" })?;
            let method = value
                .get("method")
                .and_then(Value::as_str)
                .ok_or(FrameError::MissingField { field: "method" })?;
            Ok(Frame::Request {
                id: RequestId::from(id),
                method: method.to_string(),
                params: value.get("params").cloned().unwrap_or(Value::Null),
            })
        }
        "res" => {
            let id = value
                .get("id")
                .and_then(Value::as_str)
                .ok_or(FrameError::MissingField { field: "id" })?;
            let error = value
                .get("error")
                .and_then(|e| serde_json::from_value::<ErrorShape>(e.clone()).ok());
            // `ok` is usually explicit; infer it from the error field when
            // a gateway omits it.
            let ok = value
                .get("ok")
                .and_then(Value::as_bool)
                .unwrap_or(error.is_none());
            let result = value
                .get("result")
                .or_else(|| value.get("payload"))
                .cloned();
            Ok(Frame::Response {
                id: RequestId::from(id),
                ok,
                error,
                result,
            })
        }
        "event" => {
            let event = value
                .get("event")
                .and_then(Value::as_str)
                .ok_or(FrameError::MissingField { field: "event" })?;
            Ok(Frame::Event {
                event: event.to_string(),
                payload: value.get("payload").cloned(),
            })
        }
        other => Err(FrameError::UnknownDiscriminant {
            discriminant: other.to_string(),
        }),
    }
}

// ----------------------------------------------------------------------------
// Request Construction
// ----------------------------------------------------------------------------

/// A constructed request: the id to register as pending plus the wire text
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub id: RequestId,
    pub method: String,
    pub frame: String,
}

/// Build a request frame for an arbitrary method.
pub fn request(method: &str, params: Value) -> OutboundRequest {
    build_request(method, params)
}

fn build_request(method: &str, params: Value) -> OutboundRequest {
    let id = RequestId::fresh();
    let frame = json!({
        "type": "req",
        "id": id.as_str(),
        "method": method,
        "params": params,
    })
    .to_string();
    OutboundRequest {
        id,
        method: method.to_string(),
        frame,
    }
}

/// Client metadata sent in the connect request
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub id: String,
    pub version: String,
    pub platform: String,
    pub mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
}

/// Signed device identity block attached to a connect request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceBlock {
    pub id: String,
    pub public_key: String,
    pub signature: String,
    pub signed_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

/// Token auth block attached to a connect request
#[derive(Debug, Clone, Serialize)]
pub struct AuthParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Connect request parameters
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub min_protocol: u32,
    pub max_protocol: u32,
    pub client: ClientInfo,
    pub role: String,
    pub scopes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceBlock>,
    pub auth: AuthParams,
}

/// Sign a device block binding the current settings and optional nonce
pub fn signed_device_block(
    identity: &DeviceIdentity,
    settings: &ClientSettings,
    now: Timestamp,
    nonce: Option<&str>,
) -> DeviceBlock {
    let ctx = AuthContext {
        client_id: CLIENT_ID,
        client_mode: &settings.client_mode,
        role: &settings.role,
        scopes: &settings.scopes,
        signed_at_ms: now.as_millis(),
        token: settings.auth_token.as_deref(),
        nonce,
    };
    let payload = identity.auth_payload(&ctx);
    DeviceBlock {
        id: identity.device_id().to_string(),
        public_key: identity.public_key_b64(),
        signature: identity.sign(&payload),
        signed_at: now.as_millis(),
        nonce: nonce.map(str::to_string),
    }
}

/// Build the connect request
///
/// `identity` is optional: a client whose key generation or persistence
/// failed still connects, just without a signed device block.
pub fn connect_request(
    settings: &ClientSettings,
    identity: Option<&DeviceIdentity>,
    nonce: Option<&str>,
    instance_id: &str,
    now: Timestamp,
) -> OutboundRequest {
    let device = identity.map(|id| signed_device_block(id, settings, now, nonce));
    let params = ConnectParams {
        min_protocol: PROTOCOL_VERSION,
        max_protocol: PROTOCOL_VERSION,
        client: ClientInfo {
            id: CLIENT_ID.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            platform: std::env::consts::OS.to_string(),
            mode: settings.client_mode.clone(),
            display_name: settings.display_name.clone(),
            instance_id: Some(instance_id.to_string()),
        },
        role: settings.role.clone(),
        scopes: settings.scopes.clone(),
        device,
        auth: AuthParams {
            token: settings.auth_token.clone(),
        },
    };
    // ConnectParams contains no map keys that can fail to serialize
    let params = serde_json::to_value(&params).unwrap_or(Value::Null);
    build_request(METHOD_CONNECT, params)
}

/// Build a chat-send request carrying an idempotency key
pub fn chat_send(session_key: &str, text: &str, key: &IdempotencyKey) -> OutboundRequest {
    build_request(
        METHOD_CHAT_SEND,
        json!({
            "sessionKey": session_key,
            "message": text,
            "idempotencyKey": key.as_str(),
        }),
    )
}

/// Build a heartbeat ping
pub fn ping() -> OutboundRequest {
    build_request(METHOD_PING, json!({}))
}

// ----------------------------------------------------------------------------
// Connect Result
// ----------------------------------------------------------------------------

/// Fields of interest pulled from a successful connect result
///
/// The hello body is large and versioned; every field here is optional
/// and absent fields stay `None`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectSummary {
    pub protocol: Option<u64>,
    /// Token the gateway minted for this device; used for later connects
    pub device_token: Option<String>,
    /// Server-advertised heartbeat cadence
    pub tick_interval_ms: Option<u64>,
}

/// Extract the interesting fields from a connect result body
pub fn summarize_connect_result(result: Option<&Value>) -> ConnectSummary {
    let Some(result) = result else {
        return ConnectSummary::default();
    };
    ConnectSummary {
        protocol: result.get("protocol").and_then(Value::as_u64),
        device_token: result
            .get("auth")
            .and_then(|a| a.get("deviceToken"))
            .and_then(Value::as_str)
            .map(str::to_string),
        tick_interval_ms: result
            .get("policy")
            .and_then(|p| p.get("tickIntervalMs"))
            .and_then(Value::as_u64),
    }
}

// ----------------------------------------------------------------------------
// Delta Text Extraction
// ----------------------------------------------------------------------------

/// Probe order for the text-bearing field of a streamed event payload
///
/// Evaluated top to bottom, first hit wins. At each path a plain string is
/// taken directly and an object is probed for a nested `text` string.
pub const DELTA_TEXT_PATHS: &[&str] = &["text", "message", "data", "content", "delta"];

/// Pull streamed delta text out of an event payload, if any
pub fn extract_delta_text(payload: &Value) -> Option<&str> {
    for key in DELTA_TEXT_PATHS {
        let Some(candidate) = payload.get(key) else {
            continue;
        };
        if let Some(text) = candidate.as_str() {
            return Some(text);
        }
        if let Some(text) = candidate.get("text").and_then(Value::as_str) {
            return Some(text);
        }
    }
    None
}

/// Stream lifecycle marker carried by chat events, when present
pub fn stream_state(payload: &Value) -> Option<&str> {
    payload
        .get("state")
        .or_else(|| payload.get("status"))
        .and_then(Value::as_str)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_request_frame() {
        let frame = decode(r#"{"type":"req","id":"r1","method":"connect","params":{"a":1}}"#);
        match frame.unwrap() {
            Frame::Request { id, method, params } => {
                assert_eq!(id.as_str(), "r1");
                assert_eq!(method, "connect");
                assert_eq!(params["a"], 1);
            }
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_response_ok() {
        let frame = decode(r#"{"type":"res","id":"r1","ok":true,"result":{"protocol":3}}"#);
        match frame.unwrap() {
            Frame::Response {
                id,
                ok,
                error,
                result,
            } => {
                assert_eq!(id.as_str(), "r1");
                assert!(ok);
                assert!(error.is_none());
                assert_eq!(result.unwrap()["protocol"], 3);
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_response_payload_alias() {
        // Older gateways used "payload" where current ones use "result"
        let frame = decode(r#"{"type":"res","id":"r1","ok":true,"payload":{"n":1}}"#);
        match frame.unwrap() {
            Frame::Response { result, .. } => assert_eq!(result.unwrap()["n"], 1),
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_response_infers_ok_from_error() {
        let frame =
            decode(r#"{"type":"res","id":"r1","error":{"code":"UNAVAILABLE","message":"busy"}}"#);
        match frame.unwrap() {
            Frame::Response { ok, error, .. } => {
                assert!(!ok);
                assert_eq!(error.unwrap().code, "UNAVAILABLE");
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_event_frame() {
        let frame = decode(r#"{"type":"event","event":"connect.challenge","payload":{"nonce":"n1","ts":5}}"#);
        match frame.unwrap() {
            Frame::Event { event, payload } => {
                assert_eq!(event, "connect.challenge");
                let challenge = ChallengePayload::from_value(payload.as_ref()).unwrap();
                assert_eq!(challenge.nonce, "n1");
                assert_eq!(challenge.ts, Some(5));
            }
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_reports_malformed_frames() {
        assert!(matches!(
            decode("not json at all"),
            Err(FrameError::NotJson { .. })
        ));
        assert!(matches!(
            decode("{}"),
            Err(FrameError::MissingField { field: "type" })
        ));
        assert!(matches!(
            decode(r#"{"type":"mystery"}"#),
            Err(FrameError::UnknownDiscriminant { .. })
        ));
        assert!(matches!(
            decode(r#"{"type":"req","method":"x"}"#),
            Err(FrameError::MissingField { field: "id" })
        ));
        assert!(matches!(
            decode(r#"{"type":"res"}"#),
            Err(FrameError::MissingField { field: "id" })
        ));
        assert!(matches!(
            decode(r#"{"type":"event","payload":{}}"#),
            Err(FrameError::MissingField { field: "event" })
        ));
    }

    #[test]
    fn test_challenge_payload_requires_nonce() {
        assert!(ChallengePayload::from_value(None).is_err());
        let no_nonce = serde_json::json!({"ts": 5});
        assert!(ChallengePayload::from_value(Some(&no_nonce)).is_err());
    }

    #[test]
    fn test_error_shape_not_paired_detection() {
        let by_code = ErrorShape {
            code: "NOT_PAIRED".to_string(),
            message: "device identity required".to_string(),
            retryable: false,
            details: None,
        };
        assert!(by_code.is_not_paired());

        let by_message = ErrorShape {
            code: "AUTH".to_string(),
            message: "Device Not Paired yet".to_string(),
            retryable: false,
            details: None,
        };
        assert!(by_message.is_not_paired());

        let other = ErrorShape {
            code: "UNAVAILABLE".to_string(),
            message: "try later".to_string(),
            retryable: true,
            details: None,
        };
        assert!(!other.is_not_paired());
    }

    #[test]
    fn test_connect_request_shape() {
        let mut settings = ClientSettings::default();
        settings.auth_token = Some("tok".to_string());
        settings.display_name = Some("Test Rig".to_string());
        let identity = DeviceIdentity::generate();

        let req = connect_request(
            &settings,
            Some(&identity),
            Some("nonce-1"),
            "inst-1",
            Timestamp::new(1_700_000_000_000),
        );
        let value: Value = serde_json::from_str(&req.frame).unwrap();

        assert_eq!(value["type"], "req");
        assert_eq!(value["method"], "connect");
        assert_eq!(value["id"], req.id.as_str());

        let params = &value["params"];
        assert_eq!(params["minProtocol"], PROTOCOL_VERSION);
        assert_eq!(params["maxProtocol"], PROTOCOL_VERSION);
        assert_eq!(params["client"]["id"], CLIENT_ID);
        assert_eq!(params["client"]["mode"], "webchat");
        assert_eq!(params["client"]["displayName"], "Test Rig");
        assert_eq!(params["client"]["instanceId"], "inst-1");
        assert_eq!(params["auth"]["token"], "tok");

        let device = &params["device"];
        assert_eq!(device["id"], identity.device_id());
        assert_eq!(device["signedAt"], 1_700_000_000_000u64);
        assert_eq!(device["nonce"], "nonce-1");
        assert!(device["publicKey"].is_string());
        assert!(device["signature"].is_string());
    }

    #[test]
    fn test_connect_request_without_identity_omits_device() {
        let settings = ClientSettings::default();
        let req = connect_request(&settings, None, None, "inst-1", Timestamp::new(0));
        let value: Value = serde_json::from_str(&req.frame).unwrap();

        assert!(value["params"].get("device").is_none());
        // No token configured: the auth block is present but empty
        assert!(value["params"]["auth"].as_object().unwrap().is_empty());
    }

    #[test]
    fn test_chat_send_shape() {
        let key = IdempotencyKey::from("k-1");
        let req = chat_send("agent:main:webchat", "hello", &key);
        let value: Value = serde_json::from_str(&req.frame).unwrap();

        assert_eq!(value["method"], "chat.send");
        assert_eq!(value["params"]["sessionKey"], "agent:main:webchat");
        assert_eq!(value["params"]["message"], "hello");
        assert_eq!(value["params"]["idempotencyKey"], "k-1");
    }

    #[test]
    fn test_fresh_id_per_request() {
        let key = IdempotencyKey::fresh();
        let a = chat_send("s", "x", &key);
        let b = chat_send("s", "x", &key);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_summarize_connect_result() {
        let result = serde_json::json!({
            "protocol": 3,
            "auth": {"deviceToken": "dt-1", "role": "operator"},
            "policy": {"tickIntervalMs": 30000},
        });
        let summary = summarize_connect_result(Some(&result));
        assert_eq!(summary.protocol, Some(3));
        assert_eq!(summary.device_token.as_deref(), Some("dt-1"));
        assert_eq!(summary.tick_interval_ms, Some(30000));

        assert_eq!(summarize_connect_result(None), ConnectSummary::default());
    }

    #[test]
    fn test_extract_delta_text_priority_order() {
        // Direct text wins over everything else
        let payload = serde_json::json!({"text": "a", "message": "b", "delta": "c"});
        assert_eq!(extract_delta_text(&payload), Some("a"));

        // Nested object probed for its text field
        let payload = serde_json::json!({"message": {"text": "b"}});
        assert_eq!(extract_delta_text(&payload), Some("b"));

        let payload = serde_json::json!({"data": {"text": "d"}});
        assert_eq!(extract_delta_text(&payload), Some("d"));

        // The delta alias is last in priority
        let payload = serde_json::json!({"delta": "tail", "content": "c"});
        assert_eq!(extract_delta_text(&payload), Some("c"));

        let payload = serde_json::json!({"other": "x"});
        assert_eq!(extract_delta_text(&payload), None);
    }

    #[test]
    fn test_stream_state() {
        assert_eq!(
            stream_state(&serde_json::json!({"state": "final"})),
            Some("final")
        );
        assert_eq!(
            stream_state(&serde_json::json!({"status": "done"})),
            Some("done")
        );
        assert_eq!(stream_state(&serde_json::json!({"text": "x"})), None);
    }
}
