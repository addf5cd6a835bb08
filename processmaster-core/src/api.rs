use serde::{Deserialize, Serialize};

/// Response envelope shared by every REST endpoint: `{success, data?|error?}`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub message: String,
    pub code: String,
    pub error_id: String,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    /// Original error text, only populated outside production.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ApiResponse {
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(error: ErrorBody) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
        }
    }

    pub fn into_value(self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({ "success": false }))
    }
}

/// Wrap `data` in a success envelope.
pub fn envelope(data: serde_json::Value) -> serde_json::Value {
    ApiResponse::ok(data).into_value()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ok_envelope_omits_error() {
        let v = envelope(serde_json::json!({"id": 1}));
        assert_eq!(v["success"], true);
        assert_eq!(v["data"]["id"], 1);
        assert!(v.get("error").is_none());
    }

    #[test]
    fn test_err_envelope_uses_camel_case() {
        let v = ApiResponse::err(ErrorBody {
            message: "Not found".to_string(),
            code: "NOT_FOUND".to_string(),
            error_id: "err_1".to_string(),
            timestamp: "2024-01-01T00:00:00Z".to_string(),
            details: None,
            detail: None,
        })
        .into_value();
        assert_eq!(v["success"], false);
        assert_eq!(v["error"]["errorId"], "err_1");
        assert!(v.get("data").is_none());
        assert!(v["error"].get("detail").is_none());
    }
}
