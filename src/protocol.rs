//! Memcached text protocol, client side.
//!
//! Only what a lookup needs:
//! - Request: `get <key>*`
//! - Replies: `VALUE <key> <flags> <bytes>` blocks terminated by `END`,
//!   plus `ERROR`, `CLIENT_ERROR <msg>` and `SERVER_ERROR <msg>`

use bytes::{Bytes, BytesMut};
use std::str;

/// Maximum key length allowed by memcached protocol
pub const MAX_KEY_LENGTH: usize = 250;

/// A value returned by the server
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    pub key: String,
    pub flags: u32,
    pub value: Bytes,
}

/// Parsed server reply to a retrieval command
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Zero or more values followed by END. Missing keys are simply absent.
    Values(Vec<Item>),
    /// Server did not understand the command
    Error,
    /// Server rejected the request
    ClientError(String),
    /// Server failed to serve the request
    ServerError(String),
}

/// Protocol parsing errors
#[derive(Debug, Clone, PartialEq)]
pub enum ParseError {
    /// Need more data to complete parsing
    Incomplete,
    /// Malformed VALUE header
    InvalidHeader(String),
    /// Invalid number format
    InvalidNumber(String),
    /// Data block not terminated by \r\n
    BadDataTerminator,
    /// Line that is not a retrieval reply
    UnexpectedReply(String),
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::Incomplete => write!(f, "Incomplete reply"),
            ParseError::InvalidHeader(line) => write!(f, "Invalid VALUE header: {}", line),
            ParseError::InvalidNumber(msg) => write!(f, "Invalid number: {}", msg),
            ParseError::BadDataTerminator => write!(f, "Data block must end with \\r\\n"),
            ParseError::UnexpectedReply(line) => write!(f, "Unexpected reply: {}", line),
        }
    }
}

impl std::error::Error for ParseError {}

/// Result of parsing a reply
#[derive(Debug)]
pub enum ParseResult {
    /// Successfully parsed reply with bytes consumed
    Complete(Reply, usize),
    /// Parse error
    Error(ParseError),
}

/// Check that a key can be sent on the text protocol.
pub fn validate_key(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= MAX_KEY_LENGTH
        && key.bytes().all(|b| b > b' ' && b != 0x7f)
}

/// Append a `get` request for `keys` to `buffer`.
pub fn encode_get(keys: &[String], buffer: &mut BytesMut) {
    buffer.extend_from_slice(b"get");
    for key in keys {
        buffer.extend_from_slice(b" ");
        buffer.extend_from_slice(key.as_bytes());
    }
    buffer.extend_from_slice(b"\r\n");
}

/// Parse one complete retrieval reply from the front of `buffer`.
pub fn parse_reply(buffer: &[u8]) -> ParseResult {
    let mut items = Vec::new();
    let mut pos = 0;

    loop {
        let line_end = match find_crlf(&buffer[pos..]) {
            Some(n) => pos + n,
            None => return ParseResult::Error(ParseError::Incomplete),
        };
        let next = line_end + 2;

        let line = match str::from_utf8(&buffer[pos..line_end]) {
            Ok(s) => s,
            Err(_) => {
                return ParseResult::Error(ParseError::UnexpectedReply(
                    "Invalid UTF-8 in reply".to_string(),
                ))
            }
        };

        if line == "END" {
            return ParseResult::Complete(Reply::Values(items), next);
        }

        if let Some(header) = line.strip_prefix("VALUE ") {
            let (key, flags, bytes) = match parse_value_header(header) {
                Ok(h) => h,
                Err(e) => return ParseResult::Error(e),
            };

            let (data_end, block_end) = match next
                .checked_add(bytes)
                .and_then(|end| Some((end, end.checked_add(2)?)))
            {
                Some(ends) => ends,
                None => {
                    return ParseResult::Error(ParseError::InvalidNumber(format!(
                        "Invalid bytes: {}",
                        bytes
                    )))
                }
            };
            if buffer.len() < block_end {
                return ParseResult::Error(ParseError::Incomplete);
            }
            if &buffer[data_end..block_end] != b"\r\n" {
                return ParseResult::Error(ParseError::BadDataTerminator);
            }

            items.push(Item {
                key,
                flags,
                value: Bytes::copy_from_slice(&buffer[next..data_end]),
            });
            pos = block_end;
            continue;
        }

        // Errors may only appear in place of the whole reply
        if items.is_empty() {
            if line == "ERROR" {
                return ParseResult::Complete(Reply::Error, next);
            }
            if let Some(msg) = line.strip_prefix("CLIENT_ERROR") {
                return ParseResult::Complete(Reply::ClientError(msg.trim().to_string()), next);
            }
            if let Some(msg) = line.strip_prefix("SERVER_ERROR") {
                return ParseResult::Complete(Reply::ServerError(msg.trim().to_string()), next);
            }
        }

        return ParseResult::Error(ParseError::UnexpectedReply(line.to_string()));
    }
}

/// Parse `<key> <flags> <bytes> [<cas unique>]`. A cas token is checked but dropped.
fn parse_value_header(header: &str) -> Result<(String, u32, usize), ParseError> {
    let parts: Vec<&str> = header.split_whitespace().collect();
    if parts.len() < 3 || parts.len() > 4 {
        return Err(ParseError::InvalidHeader(header.to_string()));
    }

    let flags = parts[1]
        .parse::<u32>()
        .map_err(|_| ParseError::InvalidNumber(format!("Invalid flags: {}", parts[1])))?;
    let bytes = parts[2]
        .parse::<usize>()
        .map_err(|_| ParseError::InvalidNumber(format!("Invalid bytes: {}", parts[2])))?;
    if let Some(raw) = parts.get(3) {
        raw.parse::<u64>()
            .map_err(|_| ParseError::InvalidNumber(format!("Invalid cas unique: {}", raw)))?;
    }

    Ok((parts[0].to_string(), flags, bytes))
}

/// Find \r\n in buffer
fn find_crlf(buffer: &[u8]) -> Option<usize> {
    (0..buffer.len().saturating_sub(1)).find(|&i| buffer[i] == b'\r' && buffer[i + 1] == b'\n')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_get() {
        let mut buffer = BytesMut::new();
        encode_get(&["key1".to_string(), "key2".to_string()], &mut buffer);
        assert_eq!(&buffer[..], b"get key1 key2\r\n");
    }

    #[test]
    fn test_parse_miss() {
        match parse_reply(b"END\r\n") {
            ParseResult::Complete(Reply::Values(items), 5) => assert!(items.is_empty()),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_hit() {
        let buffer = b"VALUE roger 7 5\r\nhello\r\nEND\r\n";
        match parse_reply(buffer) {
            ParseResult::Complete(Reply::Values(items), consumed) => {
                assert_eq!(consumed, buffer.len());
                assert_eq!(items.len(), 1);
                assert_eq!(items[0].key, "roger");
                assert_eq!(items[0].flags, 7);
                assert_eq!(&items[0].value[..], b"hello");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_multiple_values_with_cas() {
        let buffer = b"VALUE a 0 1 11\r\nx\r\nVALUE b 0 2 12\r\nyz\r\nEND\r\n";
        match parse_reply(buffer) {
            ParseResult::Complete(Reply::Values(items), _) => {
                assert_eq!(items.len(), 2);
                assert_eq!(&items[0].value[..], b"x");
                assert_eq!(items[1].key, "b");
                assert_eq!(&items[1].value[..], b"yz");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_value_may_contain_crlf() {
        let buffer = b"VALUE k 0 4\r\na\r\nb\r\nEND\r\n";
        match parse_reply(buffer) {
            ParseResult::Complete(Reply::Values(items), _) => {
                assert_eq!(&items[0].value[..], b"a\r\nb");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_leaves_trailing_bytes() {
        match parse_reply(b"END\r\nVALUE") {
            ParseResult::Complete(Reply::Values(_), 5) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_incomplete() {
        for partial in [
            &b"EN"[..],
            &b"VALUE roger 0 5\r\nhel"[..],
            &b"VALUE roger 0 5\r\nhello\r\n"[..],
        ] {
            match parse_reply(partial) {
                ParseResult::Error(ParseError::Incomplete) => {}
                other => panic!("unexpected: {:?}", other),
            }
        }
    }

    #[test]
    fn test_parse_server_errors() {
        match parse_reply(b"SERVER_ERROR out of memory\r\n") {
            ParseResult::Complete(Reply::ServerError(msg), _) => assert_eq!(msg, "out of memory"),
            other => panic!("unexpected: {:?}", other),
        }
        match parse_reply(b"CLIENT_ERROR bad command line format\r\n") {
            ParseResult::Complete(Reply::ClientError(msg), _) => {
                assert_eq!(msg, "bad command line format")
            }
            other => panic!("unexpected: {:?}", other),
        }
        match parse_reply(b"ERROR\r\n") {
            ParseResult::Complete(Reply::Error, 7) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_bad_data_terminator() {
        match parse_reply(b"VALUE k 0 2\r\nabXXEND\r\n") {
            ParseResult::Error(ParseError::BadDataTerminator) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_invalid_header() {
        match parse_reply(b"VALUE k notanumber 2\r\nab\r\nEND\r\n") {
            ParseResult::Error(ParseError::InvalidNumber(_)) => {}
            other => panic!("unexpected: {:?}", other),
        }
        match parse_reply(b"VALUE k\r\nEND\r\n") {
            ParseResult::Error(ParseError::InvalidHeader(_)) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_oversized_length_rejected() {
        let buffer = format!("VALUE k 0 {}\r\nEND\r\n", usize::MAX);
        match parse_reply(buffer.as_bytes()) {
            ParseResult::Error(ParseError::InvalidNumber(_)) => {}
            other => panic!("unexpected: {:?}", other),
        }

        // Data end fits, the trailing \r\n does not
        let buffer = format!("VALUE k 0 {}\r\nEND\r\n", usize::MAX - 33);
        match parse_reply(buffer.as_bytes()) {
            ParseResult::Error(ParseError::InvalidNumber(_)) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_unexpected_reply() {
        match parse_reply(b"STORED\r\n") {
            ParseResult::Error(ParseError::UnexpectedReply(line)) => assert_eq!(line, "STORED"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_validate_key() {
        assert!(validate_key("roger"));
        assert!(!validate_key(""));
        assert!(!validate_key("two words"));
        assert!(!validate_key("tab\there"));
        assert!(validate_key(&"k".repeat(MAX_KEY_LENGTH)));
        assert!(!validate_key(&"k".repeat(MAX_KEY_LENGTH + 1)));
    }
}
