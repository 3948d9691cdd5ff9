use thiserror::Error;

/// Errors returned by frame encode/decode operations.
#[derive(Debug, Error)]
pub enum CodecError {
    /// CBOR serialization failure.
    #[error("encode error: {0}")]
    Encode(String),
    /// CBOR deserialization failure.
    #[error("decode error: {0}")]
    Decode(String),
    /// Declared frame length exceeds [`crate::MAX_FRAME_LEN`].
    #[error("frame of {0} bytes exceeds the maximum frame length")]
    FrameTooLarge(usize),
    /// Structurally valid frame with inconsistent content.
    #[error("invalid frame: {0}")]
    InvalidFrame(&'static str),
}

#[cfg(test)]
mod tests {
    use super::CodecError;

    #[test]
    fn error_messages_are_stable() {
        assert_eq!(
            CodecError::FrameTooLarge(9).to_string(),
            "frame of 9 bytes exceeds the maximum frame length"
        );
        assert_eq!(
            CodecError::InvalidFrame("empty chunk").to_string(),
            "invalid frame: empty chunk"
        );
    }
}
