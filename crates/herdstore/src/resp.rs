//! RESP2 frame codec
//!
//! Encodes commands and decodes replies for Redis-compatible servers. The
//! decoder works incrementally on a `BytesMut`: an incomplete frame yields
//! `Ok(None)` and leaves the buffer untouched.

use bytes::{Buf, BytesMut};
use std::io::Cursor;

use crate::backend::Reply;
use crate::error::{Result, StoreError};

/// Maximum bulk string size (512MB)
const MAX_BULK_LEN: usize = 512 * 1024 * 1024;

/// Maximum array length (1M elements)
const MAX_ARRAY_LEN: usize = 1024 * 1024;

/// RESP2 value
#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    /// `+OK\r\n`
    SimpleString(String),
    /// `-ERR message\r\n`
    Error(String),
    /// `:42\r\n`
    Integer(i64),
    /// `$3\r\nfoo\r\n`, or `$-1\r\n` for nil
    BulkString(Option<Vec<u8>>),
    /// `*2\r\n...`, or `*-1\r\n` for nil
    Array(Option<Vec<RespValue>>),
}

impl RespValue {
    /// Build a command frame: an array of bulk strings
    pub fn command<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        RespValue::Array(Some(
            parts
                .into_iter()
                .map(|p| RespValue::BulkString(Some(p.as_ref().to_vec())))
                .collect(),
        ))
    }

    /// Append the wire encoding of this value to `out`
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            RespValue::SimpleString(s) => {
                out.push(b'+');
                out.extend_from_slice(s.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
            RespValue::Error(e) => {
                out.push(b'-');
                out.extend_from_slice(e.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
            RespValue::Integer(n) => {
                out.extend_from_slice(format!(":{}\r\n", n).as_bytes());
            }
            RespValue::BulkString(None) => out.extend_from_slice(b"$-1\r\n"),
            RespValue::BulkString(Some(data)) => {
                out.extend_from_slice(format!("${}\r\n", data.len()).as_bytes());
                out.extend_from_slice(data);
                out.extend_from_slice(b"\r\n");
            }
            RespValue::Array(None) => out.extend_from_slice(b"*-1\r\n"),
            RespValue::Array(Some(items)) => {
                out.extend_from_slice(format!("*{}\r\n", items.len()).as_bytes());
                for item in items {
                    item.encode(out);
                }
            }
        }
    }

    /// Wire encoding of this value
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode(&mut out);
        out
    }

    /// Decode one frame from the front of `buf`
    ///
    /// Consumes the frame's bytes on success; returns `Ok(None)` if more data
    /// is needed.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<RespValue>> {
        if buf.is_empty() {
            return Ok(None);
        }
        let mut cursor = Cursor::new(&buf[..]);
        match read_value(&mut cursor)? {
            Some(value) => {
                let consumed = cursor.position() as usize;
                buf.advance(consumed);
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Bulk or simple string payload as UTF-8
    pub fn as_text(&self) -> Option<String> {
        match self {
            RespValue::SimpleString(s) => Some(s.clone()),
            RespValue::BulkString(Some(data)) => Some(String::from_utf8_lossy(data).into_owned()),
            _ => None,
        }
    }

    /// Convert a server reply into a script [`Reply`]
    ///
    /// Error replies become [`StoreError::Script`].
    pub fn into_reply(self) -> Result<Reply> {
        match self {
            RespValue::Error(e) => Err(StoreError::Script(e)),
            RespValue::Integer(n) => Ok(Reply::Integer(n)),
            RespValue::SimpleString(s) => Ok(Reply::Text(s)),
            RespValue::BulkString(Some(data)) => {
                Ok(Reply::Text(String::from_utf8_lossy(&data).into_owned()))
            }
            RespValue::BulkString(None) | RespValue::Array(None) => Ok(Reply::Nil),
            RespValue::Array(Some(items)) => items
                .into_iter()
                .map(RespValue::into_reply)
                .collect::<Result<Vec<_>>>()
                .map(Reply::List),
        }
    }
}

fn read_value(cursor: &mut Cursor<&[u8]>) -> Result<Option<RespValue>> {
    if !cursor.has_remaining() {
        return Ok(None);
    }
    match cursor.get_u8() {
        b'+' => Ok(read_line(cursor)?.map(|line| RespValue::SimpleString(lossy(line)))),
        b'-' => Ok(read_line(cursor)?.map(|line| RespValue::Error(lossy(line)))),
        b':' => match read_line(cursor)? {
            Some(line) => Ok(Some(RespValue::Integer(parse_int(&line)?))),
            None => Ok(None),
        },
        b'$' => read_bulk(cursor),
        b'*' => read_array(cursor),
        other => Err(StoreError::Protocol(format!(
            "unknown RESP type byte: {:?}",
            other as char
        ))),
    }
}

fn read_bulk(cursor: &mut Cursor<&[u8]>) -> Result<Option<RespValue>> {
    let len = match read_line(cursor)? {
        Some(line) => parse_int(&line)?,
        None => return Ok(None),
    };
    if len < 0 {
        return Ok(Some(RespValue::BulkString(None)));
    }
    let len = len as usize;
    if len > MAX_BULK_LEN {
        return Err(StoreError::Protocol(format!(
            "bulk string too large: {} bytes (max: {} bytes)",
            len, MAX_BULK_LEN
        )));
    }
    if cursor.remaining() < len + 2 {
        return Ok(None);
    }
    let mut data = vec![0u8; len];
    cursor.copy_to_slice(&mut data);
    if cursor.get_u8() != b'\r' || cursor.get_u8() != b'\n' {
        return Err(StoreError::Protocol(
            "bulk string not terminated by CRLF".into(),
        ));
    }
    Ok(Some(RespValue::BulkString(Some(data))))
}

fn read_array(cursor: &mut Cursor<&[u8]>) -> Result<Option<RespValue>> {
    let len = match read_line(cursor)? {
        Some(line) => parse_int(&line)?,
        None => return Ok(None),
    };
    if len < 0 {
        return Ok(Some(RespValue::Array(None)));
    }
    let len = len as usize;
    if len > MAX_ARRAY_LEN {
        return Err(StoreError::Protocol(format!(
            "array too large: {} elements (max: {} elements)",
            len, MAX_ARRAY_LEN
        )));
    }
    let mut items = Vec::with_capacity(len);
    for _ in 0..len {
        match read_value(cursor)? {
            Some(item) => items.push(item),
            None => return Ok(None),
        }
    }
    Ok(Some(RespValue::Array(Some(items))))
}

fn read_line<'a>(cursor: &mut Cursor<&'a [u8]>) -> Result<Option<&'a [u8]>> {
    let start = cursor.position() as usize;
    let data: &'a [u8] = *cursor.get_ref();
    match data[start..].windows(2).position(|w| w == b"\r\n") {
        Some(offset) => {
            cursor.set_position((start + offset + 2) as u64);
            Ok(Some(&data[start..start + offset]))
        }
        None => Ok(None),
    }
}

fn parse_int(line: &[u8]) -> Result<i64> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| StoreError::Protocol(format!("invalid integer: {:?}", lossy(line))))
}

fn lossy(line: &[u8]) -> String {
    String::from_utf8_lossy(line).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(data: &[u8]) -> RespValue {
        let mut buf = BytesMut::from(data);
        let value = RespValue::decode(&mut buf).unwrap().unwrap();
        assert!(buf.is_empty());
        value
    }

    #[test]
    fn test_command_encoding() {
        let cmd = RespValue::command(["SET", "key", "value"]);
        assert_eq!(
            cmd.to_bytes(),
            b"*3\r\n$3\r\nSET\r\n$3\r\nkey\r\n$5\r\nvalue\r\n".to_vec()
        );
    }

    #[test]
    fn test_scalar_replies() {
        assert_eq!(decode_all(b"+OK\r\n"), RespValue::SimpleString("OK".into()));
        assert_eq!(decode_all(b":-1\r\n"), RespValue::Integer(-1));
        assert_eq!(decode_all(b"$-1\r\n"), RespValue::BulkString(None));
        assert_eq!(
            decode_all(b"-ERR wrong type\r\n"),
            RespValue::Error("ERR wrong type".into())
        );
    }

    #[test]
    fn test_nested_array() {
        let value = decode_all(b"*2\r\n:1\r\n*1\r\n$3\r\nfoo\r\n");
        assert_eq!(
            value.into_reply().unwrap(),
            Reply::List(vec![
                Reply::Integer(1),
                Reply::List(vec![Reply::Text("foo".into())]),
            ])
        );
    }

    #[test]
    fn test_incomplete_frame_keeps_buffer() {
        let mut buf = BytesMut::from(&b"*2\r\n$3\r\nfoo\r\n$3\r\nba"[..]);
        assert!(RespValue::decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 19);
        buf.extend_from_slice(b"r\r\n");
        assert!(RespValue::decode(&mut buf).unwrap().is_some());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_two_frames_in_one_read() {
        let mut buf = BytesMut::from(&b"+OK\r\n:5\r\n"[..]);
        assert_eq!(
            RespValue::decode(&mut buf).unwrap(),
            Some(RespValue::SimpleString("OK".into()))
        );
        assert_eq!(RespValue::decode(&mut buf).unwrap(), Some(RespValue::Integer(5)));
    }

    #[test]
    fn test_error_reply_maps_to_script_error() {
        let err = RespValue::Error("NOSCRIPT".into()).into_reply().unwrap_err();
        assert!(matches!(err, StoreError::Script(msg) if msg == "NOSCRIPT"));
    }

    #[test]
    fn test_rejects_unknown_type_and_oversized_bulk() {
        let mut buf = BytesMut::from(&b"?what\r\n"[..]);
        assert!(RespValue::decode(&mut buf).is_err());

        let mut buf = BytesMut::from(&b"$999999999999\r\n"[..]);
        assert!(RespValue::decode(&mut buf).is_err());
    }
}
