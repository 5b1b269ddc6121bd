//! # Wire Encoder
//!
//! Purpose: Frame commands as RESP arrays of bulk strings, and frame reply
//! values for test servers and round-trip checks.
//!
//! ## Design Principles
//! 1. **Pure Functions**: No I/O; output depends only on the arguments.
//! 2. **Buffer Reuse**: Callers pass any `BufMut` (a `Vec<u8>` or the
//!    connection's outbound `BytesMut`) so framing never allocates on its own.
//! 3. **Binary-Safe**: Arguments are length-prefixed raw bytes.

use bytes::BufMut;

use crate::value::RespValue;

/// Encodes a command (name first, then arguments) into `out`.
///
/// Format: `*<N>\r\n` followed by `$<len>\r\n<bytes>\r\n` per argument.
pub fn encode_command<A: AsRef<[u8]>, B: BufMut>(args: &[A], out: &mut B) {
    out.put_u8(b'*');
    push_usize(out, args.len());
    out.put_slice(b"\r\n");
    for arg in args {
        push_bulk(out, arg.as_ref());
    }
}

/// Encodes a command into a freshly allocated buffer.
///
/// ```rust
/// use redwire_common::encode;
///
/// assert_eq!(encode(&["SET", "k", "v"]), b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n");
/// ```
pub fn encode<A: AsRef<[u8]>>(args: &[A]) -> Vec<u8> {
    let payload: usize = args.iter().map(|arg| arg.as_ref().len() + 16).sum();
    let mut out = Vec::with_capacity(16 + payload);
    encode_command(args, &mut out);
    out
}

/// Encodes a reply value in the five-type grammar.
///
/// Byte strings are written as bulk strings, `Null` as `$-1`. This is the
/// inverse of the parser and is what test servers write back to clients.
pub fn encode_reply<B: BufMut>(value: &RespValue, out: &mut B) {
    match value {
        RespValue::Null => out.put_slice(b"$-1\r\n"),
        RespValue::Integer(number) => {
            out.put_u8(b':');
            push_i64(out, *number);
            out.put_slice(b"\r\n");
        }
        RespValue::Bytes(data) => push_bulk(out, data),
        RespValue::Error(message) => {
            out.put_u8(b'-');
            out.put_slice(message);
            out.put_slice(b"\r\n");
        }
        RespValue::Array(items) => {
            out.put_u8(b'*');
            push_usize(out, items.len());
            out.put_slice(b"\r\n");
            for item in items {
                encode_reply(item, out);
            }
        }
    }
}

/// Encodes a `+<line>` simple-string reply.
pub fn encode_simple<B: BufMut>(line: &[u8], out: &mut B) {
    out.put_u8(b'+');
    out.put_slice(line);
    out.put_slice(b"\r\n");
}

fn push_bulk<B: BufMut>(out: &mut B, data: &[u8]) {
    out.put_u8(b'$');
    push_usize(out, data.len());
    out.put_slice(b"\r\n");
    out.put_slice(data);
    out.put_slice(b"\r\n");
}

fn push_i64<B: BufMut>(out: &mut B, value: i64) {
    if value < 0 {
        out.put_u8(b'-');
    }
    push_u64(out, value.unsigned_abs());
}

fn push_usize<B: BufMut>(out: &mut B, value: usize) {
    push_u64(out, value as u64);
}

fn push_u64<B: BufMut>(out: &mut B, mut value: u64) {
    // Digits go into a stack buffer to keep framing allocation-free.
    let mut buf = [0u8; 20];
    let mut len = 0;
    if value == 0 {
        buf[0] = b'0';
        len = 1;
    } else {
        while value > 0 {
            buf[len] = b'0' + (value % 10) as u8;
            value /= 10;
            len += 1;
        }
    }
    buf[..len].reverse();
    out.put_slice(&buf[..len]);
}
