//! # Incremental Reply Parser
//!
//! Purpose: Decode one reply from a byte stream that arrives in arbitrary
//! chunks, resuming exactly where the previous chunk stopped.
//!
//! ## Design Principles
//! 1. **Explicit State Machine**: Every byte advances a small `State`; nothing
//!    blocks or looks ahead past the chunk it was given.
//! 2. **Frame Stack, Not Recursion**: Nested arrays push `(remaining, items)`
//!    frames onto a `Vec`, so nesting depth is bounded by memory only.
//! 3. **Fail Fast, Stay Failed**: Malformed input poisons the parser; the
//!    stream cannot be re-framed, so the owner must discard it.
//! 4. **Binary-Safe Bulk Reads**: Bulk payloads are copied by length, so CR/LF
//!    inside them are data.
//!
//! ## Usage Notes
//!
//! - `parse` returns how many bytes it consumed. Bytes after a completed value
//!   are left for the caller to feed again.
//! - After `Completed`, `take_value` hands out the value once and rearms the
//!   parser for the next reply.

use crate::error::ProtocolError;
use crate::value::RespValue;

/// Largest bulk string accepted (matches the server-side default limit).
pub const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// Longest simple string, error or length line accepted.
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Upper bound on speculative pre-allocation driven by untrusted lengths.
const PREALLOC_LIMIT: usize = 64 * 1024;

const STRING_REPLY: u8 = b'+';
const ERROR_REPLY: u8 = b'-';
const INTEGER_REPLY: u8 = b':';
const BULK_REPLY: u8 = b'$';
const ARRAY_REPLY: u8 = b'*';

/// Outcome of feeding one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseResult {
    /// A full value is ready in `take_value`.
    Completed,
    /// The chunk was consumed entirely; more bytes are required.
    Incomplete,
    /// The input is malformed; the parser is poisoned.
    Error(ProtocolError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineKind {
    Simple,
    Error,
    Integer,
    BulkLen,
    ArrayLen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Start,
    Line(LineKind),
    LineLf(LineKind),
    Bulk(usize),
    BulkCr,
    BulkLf,
    Done,
    Poisoned,
}

#[derive(Debug)]
struct Frame {
    remaining: usize,
    items: Vec<RespValue>,
}

/// Resumable decoder for a single reply value.
#[derive(Debug)]
pub struct RespParser {
    state: State,
    line: Vec<u8>,
    bulk: Vec<u8>,
    frames: Vec<Frame>,
    value: Option<RespValue>,
    error: Option<ProtocolError>,
}

impl Default for RespParser {
    fn default() -> Self {
        Self::new()
    }
}

impl RespParser {
    pub fn new() -> Self {
        RespParser {
            state: State::Start,
            line: Vec::with_capacity(64),
            bulk: Vec::new(),
            frames: Vec::new(),
            value: None,
            error: None,
        }
    }

    /// Feeds `chunk` and reports how many bytes were consumed.
    ///
    /// Consumption stops right after a completed value. On `Incomplete` the
    /// whole chunk has been absorbed into internal state.
    pub fn parse(&mut self, chunk: &[u8]) -> (usize, ParseResult) {
        let mut pos = 0;
        loop {
            match self.state {
                State::Done => return (pos, ParseResult::Completed),
                State::Poisoned => {
                    let err = self.error.clone().unwrap_or(ProtocolError::MissingCrlf);
                    return (pos, ParseResult::Error(err));
                }
                _ => {}
            }
            if pos >= chunk.len() {
                return (pos, ParseResult::Incomplete);
            }
            if let Err(err) = self.step(chunk, &mut pos) {
                self.state = State::Poisoned;
                self.error = Some(err.clone());
                self.frames.clear();
                return (pos, ParseResult::Error(err));
            }
        }
    }

    /// Takes the completed value and rearms the parser.
    ///
    /// Returns `None` if no value has completed since the last call.
    pub fn take_value(&mut self) -> Option<RespValue> {
        let value = self.value.take();
        if value.is_some() {
            self.state = State::Start;
        }
        value
    }

    /// True once malformed input has been seen.
    pub fn is_poisoned(&self) -> bool {
        self.state == State::Poisoned
    }

    /// The error that poisoned the parser, if any.
    pub fn error(&self) -> Option<&ProtocolError> {
        self.error.as_ref()
    }

    /// Current array nesting depth (0 between values).
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    fn step(&mut self, chunk: &[u8], pos: &mut usize) -> Result<(), ProtocolError> {
        match self.state {
            State::Start => {
                let kind = match chunk[*pos] {
                    STRING_REPLY => LineKind::Simple,
                    ERROR_REPLY => LineKind::Error,
                    INTEGER_REPLY => LineKind::Integer,
                    BULK_REPLY => LineKind::BulkLen,
                    ARRAY_REPLY => LineKind::ArrayLen,
                    other => return Err(ProtocolError::InvalidTypeByte(other)),
                };
                *pos += 1;
                self.line.clear();
                self.state = State::Line(kind);
            }
            State::Line(kind) => {
                let rest = &chunk[*pos..];
                let end = rest.iter().position(|&b| b == b'\r');
                let take = end.unwrap_or(rest.len());
                if self.line.len() + take > MAX_LINE_LEN {
                    return Err(ProtocolError::LineTooLong(self.line.len() + take));
                }
                self.line.extend_from_slice(&rest[..take]);
                match end {
                    Some(idx) => {
                        *pos += idx + 1;
                        self.state = State::LineLf(kind);
                    }
                    None => *pos += rest.len(),
                }
            }
            State::LineLf(kind) => {
                if chunk[*pos] != b'\n' {
                    return Err(ProtocolError::MissingCrlf);
                }
                *pos += 1;
                self.finish_line(kind)?;
            }
            State::Bulk(remaining) => {
                let rest = &chunk[*pos..];
                let take = remaining.min(rest.len());
                self.bulk.extend_from_slice(&rest[..take]);
                *pos += take;
                self.state = if take == remaining {
                    State::BulkCr
                } else {
                    State::Bulk(remaining - take)
                };
            }
            State::BulkCr => {
                if chunk[*pos] != b'\r' {
                    return Err(ProtocolError::MissingCrlf);
                }
                *pos += 1;
                self.state = State::BulkLf;
            }
            State::BulkLf => {
                if chunk[*pos] != b'\n' {
                    return Err(ProtocolError::MissingCrlf);
                }
                *pos += 1;
                let data = std::mem::take(&mut self.bulk);
                self.complete(RespValue::Bytes(data));
            }
            State::Done | State::Poisoned => {}
        }
        Ok(())
    }

    fn finish_line(&mut self, kind: LineKind) -> Result<(), ProtocolError> {
        match kind {
            LineKind::Simple => {
                let line = std::mem::take(&mut self.line);
                self.complete(RespValue::Bytes(line));
            }
            LineKind::Error => {
                let line = std::mem::take(&mut self.line);
                self.complete(RespValue::Error(line));
            }
            LineKind::Integer => {
                let value = parse_i64(&self.line)?;
                self.complete(RespValue::Integer(value));
            }
            LineKind::BulkLen => match parse_i64(&self.line)? {
                -1 => self.complete(RespValue::Null),
                len if len < -1 => return Err(ProtocolError::InvalidLength(len)),
                len if len > MAX_BULK_LEN => return Err(ProtocolError::BulkTooLarge(len)),
                len => {
                    let len = len as usize;
                    self.bulk = Vec::with_capacity(len.min(PREALLOC_LIMIT));
                    self.state = if len == 0 {
                        State::BulkCr
                    } else {
                        State::Bulk(len)
                    };
                }
            },
            LineKind::ArrayLen => match parse_i64(&self.line)? {
                -1 => self.complete(RespValue::Null),
                0 => self.complete(RespValue::Array(Vec::new())),
                len if len < -1 => return Err(ProtocolError::InvalidLength(len)),
                len => {
                    let len = len as usize;
                    self.frames.push(Frame {
                        remaining: len,
                        items: Vec::with_capacity(len.min(PREALLOC_LIMIT / 64)),
                    });
                    self.state = State::Start;
                }
            },
        }
        Ok(())
    }

    /// Attaches a finished value to the innermost open array, closing every
    /// array it completes on the way out.
    fn complete(&mut self, value: RespValue) {
        let mut value = value;
        loop {
            let Some(frame) = self.frames.last_mut() else {
                self.value = Some(value);
                self.state = State::Done;
                return;
            };
            frame.items.push(value);
            frame.remaining -= 1;
            if frame.remaining > 0 {
                self.state = State::Start;
                return;
            }
            match self.frames.pop() {
                Some(done) => value = RespValue::Array(done.items),
                None => return,
            }
        }
    }
}

fn parse_i64(data: &[u8]) -> Result<i64, ProtocolError> {
    let invalid = || ProtocolError::InvalidInteger(String::from_utf8_lossy(data).into_owned());
    let (negative, digits) = match data.split_first() {
        Some((b'-', rest)) => (true, rest),
        _ => (false, data),
    };
    if digits.is_empty() {
        return Err(invalid());
    }

    let mut value: i64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return Err(invalid());
        }
        let digit = (b - b'0') as i64;
        value = value.checked_mul(10).ok_or_else(invalid)?;
        value = if negative {
            value.checked_sub(digit)
        } else {
            value.checked_add(digit)
        }
        .ok_or_else(invalid)?;
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::encode_reply;

    fn parse_all(input: &[u8]) -> (usize, ParseResult, Option<RespValue>) {
        let mut parser = RespParser::new();
        let (used, result) = parser.parse(input);
        (used, result, parser.take_value())
    }

    fn parse_split(input: &[u8], split: usize) -> RespValue {
        let mut parser = RespParser::new();
        let (used, result) = parser.parse(&input[..split]);
        assert_eq!(used, split);
        if result == ParseResult::Completed {
            return parser.take_value().expect("value");
        }
        assert_eq!(result, ParseResult::Incomplete);
        let (used, result) = parser.parse(&input[split..]);
        assert_eq!(used, input.len() - split);
        assert_eq!(result, ParseResult::Completed);
        parser.take_value().expect("value")
    }

    fn sample_reply() -> RespValue {
        RespValue::Array(vec![
            RespValue::from("message"),
            RespValue::from(b"ch\r\nan".to_vec()),
            RespValue::Array(vec![
                RespValue::Integer(-17),
                RespValue::Null,
                RespValue::Array(Vec::new()),
                RespValue::error("ERR inner"),
            ]),
            RespValue::from(Vec::<u8>::new()),
        ])
    }

    #[test]
    fn parses_simple_string() {
        let (used, result, value) = parse_all(b"+OK\r\n");
        assert_eq!((used, result), (5, ParseResult::Completed));
        assert_eq!(value, Some(RespValue::from("OK")));
    }

    #[test]
    fn parses_error_with_flag() {
        let (_, result, value) = parse_all(b"-ERR bad\r\n");
        assert_eq!(result, ParseResult::Completed);
        let value = value.expect("value");
        assert!(value.is_error());
        assert_eq!(value.as_bytes(), b"ERR bad");
    }

    #[test]
    fn parses_integer() {
        let (_, _, value) = parse_all(b":-42\r\n");
        assert_eq!(value, Some(RespValue::Integer(-42)));
        let (_, _, value) = parse_all(b":9223372036854775807\r\n");
        assert_eq!(value, Some(RespValue::Integer(i64::MAX)));
        let (_, _, value) = parse_all(b":-9223372036854775808\r\n");
        assert_eq!(value, Some(RespValue::Integer(i64::MIN)));
    }

    #[test]
    fn parses_null_bulk_string() {
        let (_, _, value) = parse_all(b"$-1\r\n");
        assert_eq!(value, Some(RespValue::Null));
    }

    #[test]
    fn parses_null_array() {
        let (_, _, value) = parse_all(b"*-1\r\n");
        let value = value.expect("value");
        assert!(value.is_null());
        assert!(value.to_array().is_empty());
    }

    #[test]
    fn parses_empty_array_and_bulk() {
        let (_, _, value) = parse_all(b"*0\r\n");
        assert_eq!(value, Some(RespValue::Array(Vec::new())));
        let (_, _, value) = parse_all(b"$0\r\n\r\n");
        assert_eq!(value, Some(RespValue::Bytes(Vec::new())));
    }

    #[test]
    fn bulk_may_contain_crlf() {
        let (_, _, value) = parse_all(b"$6\r\na\r\nb\r\n\r\n");
        assert_eq!(value, Some(RespValue::Bytes(b"a\r\nb\r\n".to_vec())));
    }

    #[test]
    fn stops_after_first_value() {
        let input = b":1\r\n:2\r\n";
        let mut parser = RespParser::new();
        let (used, result) = parser.parse(input);
        assert_eq!((used, result), (4, ParseResult::Completed));
        assert_eq!(parser.take_value(), Some(RespValue::Integer(1)));
        let (used, result) = parser.parse(&input[4..]);
        assert_eq!((used, result), (4, ParseResult::Completed));
        assert_eq!(parser.take_value(), Some(RespValue::Integer(2)));
        assert_eq!(parser.take_value(), None);
    }

    #[test]
    fn every_split_point_decodes_identically() {
        let expected = sample_reply();
        let mut encoded = Vec::new();
        encode_reply(&expected, &mut encoded);
        for split in 0..=encoded.len() {
            assert_eq!(parse_split(&encoded, split), expected, "split at {split}");
        }
    }

    #[test]
    fn byte_at_a_time_decodes() {
        let expected = sample_reply();
        let mut encoded = Vec::new();
        encode_reply(&expected, &mut encoded);

        let mut parser = RespParser::new();
        for (idx, byte) in encoded.iter().enumerate() {
            let (used, result) = parser.parse(std::slice::from_ref(byte));
            assert_eq!(used, 1);
            if idx + 1 == encoded.len() {
                assert_eq!(result, ParseResult::Completed);
            } else {
                assert_eq!(result, ParseResult::Incomplete);
            }
        }
        assert_eq!(parser.take_value(), Some(expected));
    }

    #[test]
    fn deep_nesting_uses_frame_stack() {
        let depth = 2_000;
        let mut input = Vec::new();
        for _ in 0..depth {
            input.extend_from_slice(b"*1\r\n");
        }
        input.extend_from_slice(b":1\r\n");

        let mut parser = RespParser::new();
        let (_, result) = parser.parse(&input[..input.len() - 2]);
        assert_eq!(result, ParseResult::Incomplete);
        assert_eq!(parser.depth(), depth);
        let (_, result) = parser.parse(b"\r\n");
        assert_eq!(result, ParseResult::Completed);

        let mut value = parser.take_value().expect("value");
        let mut levels = 0;
        while let RespValue::Array(mut items) = value {
            levels += 1;
            value = items.pop().expect("one item");
        }
        assert_eq!(levels, depth);
        assert_eq!(value, RespValue::Integer(1));
    }

    #[test]
    fn rejects_bad_type_byte_and_stays_poisoned() {
        let mut parser = RespParser::new();
        let (_, result) = parser.parse(b"?oops\r\n");
        assert_eq!(result, ParseResult::Error(ProtocolError::InvalidTypeByte(b'?')));
        assert!(parser.is_poisoned());

        let (used, result) = parser.parse(b"+OK\r\n");
        assert_eq!(used, 0);
        assert!(matches!(result, ParseResult::Error(_)));
    }

    #[test]
    fn rejects_non_numeric_lengths() {
        let (_, result, _) = parse_all(b"$abc\r\n");
        assert!(matches!(result, ParseResult::Error(ProtocolError::InvalidInteger(_))));
        let (_, result, _) = parse_all(b":\r\n");
        assert!(matches!(result, ParseResult::Error(ProtocolError::InvalidInteger(_))));
        let (_, result, _) = parse_all(b":12a\r\n");
        assert!(matches!(result, ParseResult::Error(ProtocolError::InvalidInteger(_))));
    }

    #[test]
    fn rejects_negative_lengths_other_than_null() {
        let (_, result, _) = parse_all(b"$-2\r\n");
        assert_eq!(result, ParseResult::Error(ProtocolError::InvalidLength(-2)));
        let (_, result, _) = parse_all(b"*-5\r\n");
        assert_eq!(result, ParseResult::Error(ProtocolError::InvalidLength(-5)));
    }

    #[test]
    fn rejects_missing_bulk_terminator() {
        let (_, result, _) = parse_all(b"$2\r\nabXY");
        assert_eq!(result, ParseResult::Error(ProtocolError::MissingCrlf));
    }

    #[test]
    fn rejects_oversized_bulk() {
        let (_, result, _) = parse_all(b"$999999999999\r\n");
        assert_eq!(
            result,
            ParseResult::Error(ProtocolError::BulkTooLarge(999_999_999_999))
        );
    }

    #[test]
    fn rejects_unterminated_line_past_limit() {
        let mut parser = RespParser::new();
        let (_, result) = parser.parse(b"+");
        assert_eq!(result, ParseResult::Incomplete);
        let filler = vec![b'a'; 4096];
        let mut fed = 0;
        let result = loop {
            let (_, result) = parser.parse(&filler);
            fed += filler.len();
            if result != ParseResult::Incomplete {
                break result;
            }
            assert!(fed <= MAX_LINE_LEN, "line grew past the limit");
        };
        assert!(matches!(result, ParseResult::Error(ProtocolError::LineTooLong(_))));
        assert!(parser.is_poisoned());
    }

    #[test]
    fn accepts_line_at_limit() {
        let mut input = vec![b'+'];
        input.extend(std::iter::repeat(b'x').take(MAX_LINE_LEN));
        input.extend_from_slice(b"\r\n");
        let (used, result, value) = parse_all(&input);
        assert_eq!((used, result), (input.len(), ParseResult::Completed));
        assert_eq!(value.expect("value").as_bytes().len(), MAX_LINE_LEN);
    }
}
