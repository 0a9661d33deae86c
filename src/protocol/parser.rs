//! Application parser contract
//!
//! A parser turns raw payload bytes into a typed object before handlers
//! run. What happens when parsing fails is up to the parser's
//! [`ParseErrorPolicy`].

use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::sync::Arc;
use thiserror::Error;

use super::{Attachment, ErrorCode, Message, MsgType};

/// Parse errors
#[derive(Error, Debug, Clone)]
pub enum ParseError {
    #[error("json unpack error: {0}")]
    Json(String),

    #[error("cmd parse error: {0}")]
    Cmd(String),

    #[error("{0}")]
    Code(ErrorCode),
}

impl ParseError {
    /// Error code sent back in a remind message
    pub fn code(&self) -> ErrorCode {
        match self {
            ParseError::Json(_) => ErrorCode::JsonUnpack,
            ParseError::Cmd(_) => ErrorCode::CmdUnpack,
            ParseError::Code(code) => *code,
        }
    }
}

/// What a queue does with a message that fails to parse
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParseErrorPolicy {
    /// Reply with the parser's remind message and keep the connection
    #[default]
    SendRemind,
    /// Drop the connection
    Close,
    /// Ignore the message and keep reading
    Continue,
}

pub trait MessageParser: Send + Sync + 'static {
    /// Produce the typed object for `msg`
    fn parse(&self, msg: &Message) -> Result<Attachment, ParseError>;

    fn error_policy(&self) -> ParseErrorPolicy {
        ParseErrorPolicy::SendRemind
    }

    /// Reply sent under [`ParseErrorPolicy::SendRemind`]
    fn remind_message(&self, err: &ParseError, msg_type: MsgType) -> Message {
        match msg_type {
            MsgType::Framed => Message::error(err.code()),
            MsgType::Line => Message::text(format!("{}\n", err)),
        }
    }
}

/// Parses payloads as JSON into `T`
pub struct JsonParser<T> {
    policy: ParseErrorPolicy,
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonParser<T> {
    pub fn new(policy: ParseErrorPolicy) -> Self {
        Self {
            policy,
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonParser<T> {
    fn default() -> Self {
        Self::new(ParseErrorPolicy::default())
    }
}

impl<T> MessageParser for JsonParser<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    fn parse(&self, msg: &Message) -> Result<Attachment, ParseError> {
        let value: T =
            serde_json::from_slice(msg.payload()).map_err(|e| ParseError::Json(e.to_string()))?;
        Ok(Arc::new(value))
    }

    fn error_policy(&self) -> ParseErrorPolicy {
        self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct GetUserLevel {
        user: u32,
        level: u32,
    }

    #[test]
    fn test_json_parser() {
        let parser = JsonParser::<GetUserLevel>::default();
        let msg = Message::with_data(&br#"{"user":1,"level":7}"#[..]);
        let parsed = parser.parse(&msg).unwrap();
        assert_eq!(
            parsed.downcast_ref::<GetUserLevel>(),
            Some(&GetUserLevel { user: 1, level: 7 })
        );
    }

    #[test]
    fn test_json_parser_error_and_remind() {
        let parser = JsonParser::<GetUserLevel>::new(ParseErrorPolicy::Close);
        assert_eq!(parser.error_policy(), ParseErrorPolicy::Close);

        let err = parser.parse(&Message::with_data(&b"not json"[..])).unwrap_err();
        assert_eq!(err.code(), ErrorCode::JsonUnpack);

        let framed = parser.remind_message(&err, MsgType::Framed);
        assert_eq!(framed.head.map(|h| h.error), Some(ErrorCode::JsonUnpack.id()));

        let line = parser.remind_message(&err, MsgType::Line);
        assert!(line.head.is_none());
        assert!(line.payload().ends_with(b"\n"));
    }
}
