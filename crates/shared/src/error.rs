use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthorized,
    Forbidden,
    NotFound,
    Validation,
    RateLimited,
    Internal,
    #[default]
    #[serde(other)]
    Unknown,
}

/// Error body returned by the REST backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    #[serde(default)]
    pub code: ErrorCode,
    pub message: String,
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_codes_fall_back() {
        let err: ApiError =
            serde_json::from_str(r#"{"code":"teapot","message":"short and stout"}"#)
                .expect("api error");
        assert_eq!(err.code, ErrorCode::Unknown);
        assert_eq!(err.to_string(), "Unknown: short and stout");
    }

    #[test]
    fn missing_code_defaults() {
        let err: ApiError = serde_json::from_str(r#"{"message":"nope"}"#).expect("api error");
        assert_eq!(err.code, ErrorCode::Unknown);
    }
}
