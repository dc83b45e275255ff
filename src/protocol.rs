use serde::{Deserialize, Serialize};

use crate::chat::ChatMessage;
use crate::courts::Court;
use crate::error::JamError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Validation,
    Unauthorized,
    Forbidden,
    NotFound,
    DuplicateState,
    RateLimit,
    Storage,
    Internal,
}

impl From<&JamError> for ErrorCode {
    fn from(e: &JamError) -> Self {
        match e {
            JamError::Validation(_) => ErrorCode::Validation,
            JamError::Identity(_) => ErrorCode::Unauthorized,
            JamError::UnknownCourt(_) => ErrorCode::NotFound,
            JamError::Duplicate(_) => ErrorCode::DuplicateState,
            JamError::RateLimit { .. } => ErrorCode::RateLimit,
            JamError::Storage(_) => ErrorCode::Storage,
            JamError::Config(_) => ErrorCode::Internal,
        }
    }
}

/// Uniform error body for REST responses and chat error frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl ErrorBody {
    pub fn from_error(e: &JamError) -> Self {
        Self {
            code: ErrorCode::from(e),
            message: e.to_string(),
            retry_after_ms: e.retry_after_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyResponse {
    pub subject_id: String,
    pub display_name: String,
    pub authenticated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckInResponse {
    pub court_id: String,
    pub subject_id: String,
    pub display_name: String,
    pub timestamp_ms: i64,
    pub current_players: u32,
    pub total_checkins: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckOutResponse {
    pub court_id: String,
    pub subject_id: String,
    pub current_players: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatingRequest {
    pub stars: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatingResponse {
    pub court_id: String,
    pub rating: f64,
    pub rating_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CourtListResponse {
    pub courts: Vec<Court>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesResponse {
    pub court_id: String,
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsResponse {
    pub courts: usize,
    pub active_checkins: usize,
    pub cached_messages: usize,
    pub uptime_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminResetRequest {
    pub mode: ResetMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetMode {
    Daily,
    All,
    Restore,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminResetResponse {
    pub mode: ResetMode,
    pub courts: usize,
}

// Chat socket frames, client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatClientFrame {
    Post { text: String },
    Ping,
}

// Chat socket frames, server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatServerFrame {
    History { messages: Vec<ChatMessage> },
    Message { message: ChatMessage },
    Pong,
    Error { body: ErrorBody },
}

impl ChatServerFrame {
    pub fn error(e: &JamError) -> Self {
        Self::Error {
            body: ErrorBody::from_error(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_names() {
        let codes = vec![
            ErrorCode::Validation,
            ErrorCode::Unauthorized,
            ErrorCode::Forbidden,
            ErrorCode::NotFound,
            ErrorCode::DuplicateState,
            ErrorCode::RateLimit,
            ErrorCode::Storage,
            ErrorCode::Internal,
        ];

        let expected_names = vec![
            "VALIDATION",
            "UNAUTHORIZED",
            "FORBIDDEN",
            "NOT_FOUND",
            "DUPLICATE_STATE",
            "RATE_LIMIT",
            "STORAGE",
            "INTERNAL",
        ];

        for (code, expected) in codes.iter().zip(expected_names.iter()) {
            let json = serde_json::to_string(&code).unwrap();
            assert_eq!(json, format!("\"{}\"", expected));
        }
    }

    #[test]
    fn test_error_body_retry_after_serialization() {
        let limited = ErrorBody::from_error(&JamError::RateLimit {
            retry_after_ms: 1500,
        });
        let json = serde_json::to_string(&limited).unwrap();
        assert!(json.contains("\"code\":\"RATE_LIMIT\""));
        assert!(json.contains("\"retry_after_ms\":1500"));

        let invalid = ErrorBody::from_error(&JamError::Validation("empty nickname".to_string()));
        let json = serde_json::to_string(&invalid).unwrap();
        assert!(json.contains("\"code\":\"VALIDATION\""));
        assert!(!json.contains("retry_after_ms"));
    }

    #[test]
    fn test_error_code_mapping() {
        let cases = vec![
            (JamError::Validation("x".into()), ErrorCode::Validation),
            (JamError::Identity("x".into()), ErrorCode::Unauthorized),
            (JamError::UnknownCourt("9".into()), ErrorCode::NotFound),
            (JamError::Duplicate("x".into()), ErrorCode::DuplicateState),
            (JamError::RateLimit { retry_after_ms: 1 }, ErrorCode::RateLimit),
            (JamError::Storage("x".into()), ErrorCode::Storage),
            (JamError::Config("x".into()), ErrorCode::Internal),
        ];
        for (err, code) in cases {
            assert_eq!(ErrorCode::from(&err), code);
        }
    }

    #[test]
    fn test_check_in_response_serialization() {
        let response = CheckInResponse {
            court_id: "1".to_string(),
            subject_id: "alice".to_string(),
            display_name: "Alice".to_string(),
            timestamp_ms: 1_700_000_000_000,
            current_players: 3,
            total_checkins: 51,
        };

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"court_id\":\"1\""));
        assert!(json.contains("\"subject_id\":\"alice\""));
        assert!(json.contains("\"current_players\":3"));
        assert!(json.contains("\"total_checkins\":51"));
    }

    #[test]
    fn test_chat_client_frame_deserialization() {
        let frame: ChatClientFrame =
            serde_json::from_str(r#"{"type":"post","text":"who's at the court?"}"#).unwrap();
        match frame {
            ChatClientFrame::Post { text } => assert_eq!(text, "who's at the court?"),
            _ => panic!("Wrong frame type"),
        }

        let frame: ChatClientFrame = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(frame, ChatClientFrame::Ping));
    }

    #[test]
    fn test_chat_server_frame_serialization() {
        let frame = ChatServerFrame::Message {
            message: ChatMessage {
                id: "m-1".to_string(),
                court_id: "1".to_string(),
                subject_id: "alice".to_string(),
                display_name: "Alice".to_string(),
                text: "ball out".to_string(),
                timestamp_ms: 1_700_000_000_000,
            },
        };

        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"type\":\"message\""));
        assert!(json.contains("\"text\":\"ball out\""));

        let frame = ChatServerFrame::error(&JamError::RateLimit { retry_after_ms: 900 });
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"type\":\"error\""));
        assert!(json.contains("\"code\":\"RATE_LIMIT\""));
        assert!(json.contains("\"retry_after_ms\":900"));
    }

    #[test]
    fn test_reset_mode_tags() {
        let request: AdminResetRequest = serde_json::from_str(r#"{"mode":"daily"}"#).unwrap();
        assert_eq!(request.mode, ResetMode::Daily);
        let request: AdminResetRequest = serde_json::from_str(r#"{"mode":"all"}"#).unwrap();
        assert_eq!(request.mode, ResetMode::All);
        let request: AdminResetRequest = serde_json::from_str(r#"{"mode":"restore"}"#).unwrap();
        assert_eq!(request.mode, ResetMode::Restore);
        assert!(serde_json::from_str::<AdminResetRequest>(r#"{"mode":"nope"}"#).is_err());
    }
}
