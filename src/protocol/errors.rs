//! Error codes carried in the `error` field of a message head

use thiserror::Error;

use super::CodecError;

/// First code available for application-defined errors
pub const MIN_USER_ERROR: u16 = 256;

/// Well-known error codes
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    #[error("success")]
    Success,
    #[error("pb pack error")]
    PbPack,
    #[error("pb unpack error")]
    PbUnpack,
    #[error("json pack error")]
    JsonPack,
    #[error("json unpack error")]
    JsonUnpack,
    #[error("cmd parse error")]
    CmdUnpack,
    #[error("message too long")]
    MsgLenTooLong,
    #[error("message too short")]
    MsgLenTooShort,
    #[error("bad db type")]
    DbDataType,
    #[error("unknown error code")]
    Unknown,
    #[error("user error {0}")]
    User(u16),
}

impl ErrorCode {
    pub fn id(&self) -> u16 {
        match self {
            ErrorCode::Success => 0,
            ErrorCode::PbPack => 1,
            ErrorCode::PbUnpack => 2,
            ErrorCode::JsonPack => 3,
            ErrorCode::JsonUnpack => 4,
            ErrorCode::CmdUnpack => 5,
            ErrorCode::MsgLenTooLong => 6,
            ErrorCode::MsgLenTooShort => 7,
            ErrorCode::DbDataType => 8,
            ErrorCode::Unknown => 255,
            ErrorCode::User(id) => *id,
        }
    }

    /// Map a wire code back to a known error; unassigned system codes map to
    /// [`ErrorCode::Unknown`].
    pub fn from_id(id: u16) -> Self {
        match id {
            0 => ErrorCode::Success,
            1 => ErrorCode::PbPack,
            2 => ErrorCode::PbUnpack,
            3 => ErrorCode::JsonPack,
            4 => ErrorCode::JsonUnpack,
            5 => ErrorCode::CmdUnpack,
            6 => ErrorCode::MsgLenTooLong,
            7 => ErrorCode::MsgLenTooShort,
            8 => ErrorCode::DbDataType,
            id if id >= MIN_USER_ERROR => ErrorCode::User(id),
            _ => ErrorCode::Unknown,
        }
    }
}

impl From<CodecError> for ErrorCode {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::LenTooShort(_) => ErrorCode::MsgLenTooShort,
            CodecError::LenTooLong { .. } => ErrorCode::MsgLenTooLong,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_codes_round_trip() {
        for id in (0..=8).chain([255, MIN_USER_ERROR, 4000]) {
            assert_eq!(ErrorCode::from_id(id).id(), id);
        }
    }

    #[test]
    fn test_unassigned_system_code_is_unknown() {
        assert_eq!(ErrorCode::from_id(42), ErrorCode::Unknown);
        assert_eq!(ErrorCode::Unknown.to_string(), "unknown error code");
    }

    #[test]
    fn test_codec_error_mapping() {
        assert_eq!(
            ErrorCode::from(CodecError::LenTooLong { len: 9, max: 8 }),
            ErrorCode::MsgLenTooLong
        );
        assert_eq!(ErrorCode::from(CodecError::LenTooShort(3)).id(), 7);
    }
}
