// src/protocol.rs

//! Control-channel wire format.
//!
//! Every message is a single frame: a big-endian `u32` payload length
//! followed by the payload. A command payload is a counted list of
//! length-prefixed UTF-8 strings; a response payload carries a status
//! word first, then the same list encoding. Status 0 is success. The
//! codec is self-describing and language-neutral; nothing here depends on
//! the transport beyond `Read`/`Write`.

use crate::error::{Error, Result};
use std::io::{Read, Write};

/// Upper bound on a single frame; anything larger is a protocol error.
pub const MAX_FRAME: u32 = 1024 * 1024;

/// Status word for a successful response.
pub const STATUS_OK: u32 = 0;

/// Status word for a failed command; the payload is `[kind, message]`.
pub const STATUS_ERROR: u32 = 1;

/// A decoded server reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u32,
    pub payload: Vec<String>,
}

impl Response {
    pub fn ok(payload: Vec<String>) -> Self {
        Self {
            status: STATUS_OK,
            payload,
        }
    }

    pub fn error(kind: &str, message: &str) -> Self {
        Self {
            status: STATUS_ERROR,
            payload: vec![kind.to_string(), message.to_string()],
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == STATUS_OK
    }
}

fn encode_items(buf: &mut Vec<u8>, items: &[String]) {
    buf.extend_from_slice(&(items.len() as u32).to_be_bytes());
    for item in items {
        let bytes = item.as_bytes();
        buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
        buf.extend_from_slice(bytes);
    }
}

fn decode_items(buf: &[u8]) -> Result<Vec<String>> {
    let mut pos = 0usize;
    let count = read_u32(buf, &mut pos)? as usize;
    let mut items = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let len = read_u32(buf, &mut pos)? as usize;
        let end = pos
            .checked_add(len)
            .filter(|&end| end <= buf.len())
            .ok_or_else(|| Error::Protocol("truncated string item".into()))?;
        let item = std::str::from_utf8(&buf[pos..end])
            .map_err(|_| Error::Protocol("invalid UTF-8 in string item".into()))?;
        items.push(item.to_string());
        pos = end;
    }
    if pos != buf.len() {
        return Err(Error::Protocol("trailing bytes in frame".into()));
    }
    Ok(items)
}

fn read_u32(buf: &[u8], pos: &mut usize) -> Result<u32> {
    let end = *pos + 4;
    if end > buf.len() {
        return Err(Error::Protocol("truncated frame".into()));
    }
    let value = u32::from_be_bytes([buf[*pos], buf[*pos + 1], buf[*pos + 2], buf[*pos + 3]]);
    *pos = end;
    Ok(value)
}

fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> Result<()> {
    if payload.len() as u64 > MAX_FRAME as u64 {
        return Err(Error::Protocol(format!(
            "frame too large: {} bytes",
            payload.len()
        )));
    }
    writer.write_all(&(payload.len() as u32).to_be_bytes())?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame payload. `Ok(None)` on a clean end of stream.
fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read(&mut len_buf)? {
        0 => return Ok(None),
        n if n < 4 => reader.read_exact(&mut len_buf[n..])?,
        _ => {}
    }
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME {
        return Err(Error::Protocol(format!("frame too large: {} bytes", len)));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload)?;
    Ok(Some(payload))
}

/// Send a command: an ordered list of string tokens.
pub fn write_command<W: Write>(writer: &mut W, command: &[String]) -> Result<()> {
    let mut payload = Vec::new();
    encode_items(&mut payload, command);
    write_frame(writer, &payload)
}

/// Receive one command. `Ok(None)` when the peer closed the connection.
pub fn read_command<R: Read>(reader: &mut R) -> Result<Option<Vec<String>>> {
    match read_frame(reader)? {
        Some(payload) => Ok(Some(decode_items(&payload)?)),
        None => Ok(None),
    }
}

/// Send a `(status, payload)` reply.
pub fn write_response<W: Write>(writer: &mut W, response: &Response) -> Result<()> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&response.status.to_be_bytes());
    encode_items(&mut payload, &response.payload);
    write_frame(writer, &payload)
}

/// Receive a reply; an unexpectedly closed connection is a protocol
/// error here, not an end of stream.
pub fn read_response<R: Read>(reader: &mut R) -> Result<Response> {
    let payload = read_frame(reader)?
        .ok_or_else(|| Error::Protocol("connection closed before response".into()))?;
    if payload.len() < 4 {
        return Err(Error::Protocol("short response frame".into()));
    }
    let status = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
    let items = decode_items(&payload[4..])?;
    Ok(Response {
        status,
        payload: items,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_command_roundtrip() {
        let mut buf = Vec::new();
        let cmd = strings(&["set", "sshd", "bantime", "600"]);
        write_command(&mut buf, &cmd).unwrap();
        let decoded = read_command(&mut Cursor::new(buf)).unwrap();
        assert_eq!(decoded, Some(cmd));
    }

    #[test]
    fn test_empty_and_unicode_tokens() {
        let mut buf = Vec::new();
        let cmd = strings(&["echo", "", "héllo wörld", "…"]);
        write_command(&mut buf, &cmd).unwrap();
        assert_eq!(read_command(&mut Cursor::new(buf)).unwrap(), Some(cmd));
    }

    #[test]
    fn test_multiple_frames_on_one_stream() {
        let mut buf = Vec::new();
        write_command(&mut buf, &strings(&["ping"])).unwrap();
        write_command(&mut buf, &strings(&["status"])).unwrap();
        let mut cursor = Cursor::new(buf);
        assert_eq!(
            read_command(&mut cursor).unwrap(),
            Some(strings(&["ping"]))
        );
        assert_eq!(
            read_command(&mut cursor).unwrap(),
            Some(strings(&["status"]))
        );
        assert_eq!(read_command(&mut cursor).unwrap(), None);
    }

    #[test]
    fn test_response_roundtrip() {
        let mut buf = Vec::new();
        let response = Response::ok(strings(&["pong"]));
        write_response(&mut buf, &response).unwrap();
        assert_eq!(read_response(&mut Cursor::new(buf)).unwrap(), response);

        let mut buf = Vec::new();
        let response = Response::error("socket", "server not running");
        write_response(&mut buf, &response).unwrap();
        let decoded = read_response(&mut Cursor::new(buf)).unwrap();
        assert!(!decoded.is_ok());
        assert_eq!(decoded.payload, strings(&["socket", "server not running"]));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_FRAME + 1).to_be_bytes());
        assert!(matches!(
            read_command(&mut Cursor::new(buf)),
            Err(Error::Protocol(_))
        ));

        let big = vec!["x".repeat(MAX_FRAME as usize); 2];
        let mut out = Vec::new();
        assert!(matches!(
            write_command(&mut out, &big),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let mut buf = Vec::new();
        write_command(&mut buf, &strings(&["ping"])).unwrap();
        buf.truncate(buf.len() - 2);
        assert!(read_command(&mut Cursor::new(buf)).is_err());
    }

    #[test]
    fn test_trailing_garbage_rejected() {
        // frame claims one item but carries extra bytes
        let mut payload = Vec::new();
        encode_items(&mut payload, &strings(&["ping"]));
        payload.push(0xFF);
        let mut buf = Vec::new();
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&payload);
        assert!(matches!(
            read_command(&mut Cursor::new(buf)),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_clean_eof_is_none() {
        let empty: Vec<u8> = Vec::new();
        assert_eq!(read_command(&mut Cursor::new(empty)).unwrap(), None);
    }
}
