use super::frames::ErrorPayload;

pub const CLOSE_HANDSHAKE_TIMEOUT: u16 = 4401;
pub const CLOSE_MALFORMED_HANDSHAKE: u16 = 4402;
pub const CLOSE_MISSING_NODE_ID: u16 = 4403;
pub const CLOSE_INVALID_SIGNATURE: u16 = 4404;
pub const CLOSE_SESSION_REPLACED: u16 = 4409;

pub const ERROR_MALFORMED_FRAME: &str = "MALFORMED_FRAME";
pub const ERROR_UNSUPPORTED_TYPE: &str = "UNSUPPORTED_TYPE";
pub const ERROR_UNEXPECTED_FRAME: &str = "UNEXPECTED_FRAME";
pub const ERROR_PAYLOAD_TOO_LARGE: &str = "PAYLOAD_TOO_LARGE";

#[derive(Debug, Clone, PartialEq)]
pub struct FrameError {
    pub code: &'static str,
    pub message: String,
}

impl FrameError {
    #[must_use]
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn to_payload(&self, related_message_id: Option<String>) -> ErrorPayload {
        ErrorPayload {
            error_code: self.code.to_owned(),
            error_message: self.message.clone(),
            related_message_id,
        }
    }
}
