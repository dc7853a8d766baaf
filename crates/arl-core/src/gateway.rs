use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const GATEWAY_PROTOCOL: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFrame {
    pub event: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectResponse {
    pub id: String,
    // absent on older gateways, which counts as accepted
    #[serde(default)]
    pub ok: Option<bool>,
    #[serde(default)]
    pub error: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum GatewayFrame {
    Res(ConnectResponse),
    Event(EventFrame),
}

pub fn decode_frame(raw: &str) -> Option<GatewayFrame> {
    serde_json::from_str(raw).ok()
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientInfo {
    pub id: String,
    pub version: String,
    pub platform: String,
    pub mode: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthParams {
    pub token: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub min_protocol: u32,
    pub max_protocol: u32,
    pub client: ClientInfo,
    pub role: String,
    pub scopes: Vec<String>,
    pub caps: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthParams>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectRequest {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    pub method: String,
    pub params: ConnectParams,
}

impl ConnectRequest {
    pub fn connect(id: String, client: ClientInfo, token: Option<String>) -> Self {
        ConnectRequest {
            kind: "req".to_string(),
            id,
            method: "connect".to_string(),
            params: ConnectParams {
                min_protocol: GATEWAY_PROTOCOL,
                max_protocol: GATEWAY_PROTOCOL,
                client,
                role: "operator".to_string(),
                scopes: vec!["operator.admin".to_string()],
                caps: Vec::new(),
                auth: token.map(|token| AuthParams { token }),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observer_client() -> ClientInfo {
        ClientInfo {
            id: "arl-observer".to_string(),
            version: "1.0".to_string(),
            platform: "rust".to_string(),
            mode: "observer".to_string(),
        }
    }

    #[test]
    fn decodes_event_frame() {
        let raw = r#"{"type":"event","event":"chat","payload":{"runId":"r1"}}"#;
        match decode_frame(raw) {
            Some(GatewayFrame::Event(frame)) => {
                assert_eq!(frame.event, "chat");
                assert_eq!(frame.payload["runId"], "r1");
            }
            other => panic!("expected event frame, got {other:?}"),
        }
    }

    #[test]
    fn decodes_res_frame_with_and_without_ok() {
        let raw = r#"{"type":"res","id":"c1","ok":false,"error":{"message":"denied"}}"#;
        match decode_frame(raw) {
            Some(GatewayFrame::Res(res)) => {
                assert_eq!(res.id, "c1");
                assert_eq!(res.ok, Some(false));
                assert!(res.error.is_some());
            }
            other => panic!("expected res frame, got {other:?}"),
        }

        let raw = r#"{"type":"res","id":"c2"}"#;
        match decode_frame(raw) {
            Some(GatewayFrame::Res(res)) => assert_eq!(res.ok, None),
            other => panic!("expected res frame, got {other:?}"),
        }
    }

    #[test]
    fn ignores_unknown_and_malformed_frames() {
        assert!(decode_frame(r#"{"type":"req","id":"x"}"#).is_none());
        assert!(decode_frame("not json").is_none());
        assert!(decode_frame(r#"{"event":"chat"}"#).is_none());
    }

    #[test]
    fn connect_request_wire_shape() {
        let request = ConnectRequest::connect(
            "c1".to_string(),
            observer_client(),
            Some("secret".to_string()),
        );
        let value = serde_json::to_value(&request).expect("serialize");
        assert_eq!(value["type"], "req");
        assert_eq!(value["method"], "connect");
        assert_eq!(value["params"]["minProtocol"], 3);
        assert_eq!(value["params"]["maxProtocol"], 3);
        assert_eq!(value["params"]["client"]["mode"], "observer");
        assert_eq!(value["params"]["role"], "operator");
        assert_eq!(value["params"]["scopes"][0], "operator.admin");
        assert_eq!(value["params"]["caps"].as_array().map(Vec::len), Some(0));
        assert_eq!(value["params"]["auth"]["token"], "secret");
    }

    #[test]
    fn connect_request_omits_auth_without_token() {
        let request = ConnectRequest::connect("c2".to_string(), observer_client(), None);
        let value = serde_json::to_value(&request).expect("serialize");
        assert!(value["params"].get("auth").is_none());
    }
}
