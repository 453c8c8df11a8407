//! JSON-RPC 2.0 envelope types (SPEC_FULL §6).

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    pub id: String,
}

impl RpcRequest {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.into(),
            params,
            id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    pub id: String,
}

impl RpcResponse {
    pub fn success(id: String, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn failure(id: String, err: &crate::error::ClusterError) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(RpcError {
                code: err.json_rpc_code(),
                message: err.to_string(),
                data: None,
            }),
            id,
        }
    }

    pub fn parse_error() -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(RpcError {
                code: -32700,
                message: "parse error".to_string(),
                data: None,
            }),
            id: "null".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_method_always_has_one_slash() {
        let req = RpcRequest::new("echo/say", serde_json::json!({"msg": "hi"}));
        assert_eq!(req.method.matches('/').count(), 1);
    }

    #[test]
    fn success_response_has_no_error_field() {
        let resp = RpcResponse::success("1".to_string(), serde_json::json!({"pong": "x"}));
        let s = serde_json::to_string(&resp).unwrap();
        assert!(!s.contains("\"error\""));
    }

    #[test]
    fn failure_response_has_no_result_field() {
        let err = crate::error::ClusterError::MethodNotFound("svc/m".to_string());
        let resp = RpcResponse::failure("1".to_string(), &err);
        let s = serde_json::to_string(&resp).unwrap();
        assert!(!s.contains("\"result\""));
        assert_eq!(resp.error.unwrap().code, -32601);
    }
}
