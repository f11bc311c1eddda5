/// Failure to route a single inbound message. Always local to that message:
/// the session reports it and keeps reading.
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("decode error: empty message")]
    Empty,
}

impl RouteError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Decode(_) | Self::Empty => "decode",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_error_display_carries_cause() {
        let err: RouteError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert!(err.to_string().starts_with("decode error: "), "got: {err}");
        assert_eq!(err.error_kind(), "decode");
    }

    #[test]
    fn empty_message_is_a_decode_kind() {
        assert_eq!(RouteError::Empty.error_kind(), "decode");
        assert_eq!(RouteError::Empty.to_string(), "decode error: empty message");
    }
}
