//! Wire protocol between the broker and its clients.
//!
//! Every frame is a big-endian u32 length prefix followed by a one-byte
//! frame type and the frame fields. Strings carry a u16 length prefix;
//! payloads run to the end of the frame.

use std::fmt;
use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Cap per frame, to protect against malformed peers.
pub const MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

const CMD_PUB: u8 = 0;
const CMD_SUB: u8 = 1;
const CMD_FIN: u8 = 2;

const FRAME_ACK: u8 = 0;
const FRAME_MSG: u8 = 1;

/// Client-to-broker command.
#[derive(Debug, Clone)]
pub enum Command {
    /// Publish one payload to a topic.
    Pub { topic: String, body: Bytes },
    /// Subscribe to `(topic, channel)` with a delivery cap of
    /// `max_in_flight` unacknowledged messages.
    Sub {
        topic: String,
        channel: String,
        max_in_flight: u32,
    },
    /// Acknowledge (finish) a delivered message.
    Fin { id: u64 },
}

/// Broker-to-client frame.
#[derive(Debug, Clone)]
pub enum ServerFrame {
    /// Reply to `Pub` and `Sub`.
    Ack(Ack),
    /// One delivered message.
    Msg(Msg),
}

#[derive(Debug, Clone)]
pub struct Ack {
    pub ok: bool,
    pub info: String,
}

#[derive(Debug, Clone)]
pub struct Msg {
    pub id: u64,
    pub body: Bytes,
}

/// Frame encode or decode failure.
#[derive(Debug)]
pub enum FrameError {
    Truncated,
    UnknownType(u8),
    BadString,
    /// A topic, channel, or info string longer than the u16 length
    /// prefix can carry.
    StringTooLong(usize),
}

impl std::error::Error for FrameError {}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::Truncated => write!(f, "frame truncated"),
            FrameError::UnknownType(t) => write!(f, "unknown frame type {t}"),
            FrameError::BadString => write!(f, "frame string is not valid utf-8"),
            FrameError::StringTooLong(len) => {
                write!(f, "frame string of {len} bytes exceeds the u16 length prefix")
            }
        }
    }
}

fn put_str(buf: &mut BytesMut, s: &str) -> Result<(), FrameError> {
    let len = u16::try_from(s.len()).map_err(|_| FrameError::StringTooLong(s.len()))?;
    buf.put_u16(len);
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}

fn take_str(buf: &mut &[u8]) -> Result<String, FrameError> {
    if buf.remaining() < 2 {
        return Err(FrameError::Truncated);
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(FrameError::Truncated);
    }
    let s = std::str::from_utf8(&buf[..len])
        .map_err(|_| FrameError::BadString)?
        .to_owned();
    buf.advance(len);
    Ok(s)
}

/// Encodes a command with its length prefix into `buf`.
///
/// On error `buf` is left exactly as it was.
pub fn encode_command_into(cmd: &Command, buf: &mut BytesMut) -> Result<(), FrameError> {
    let start = buf.len();
    buf.put_u32(0); // patched below
    let encoded = match cmd {
        Command::Pub { topic, body } => {
            buf.put_u8(CMD_PUB);
            put_str(buf, topic).map(|_| buf.extend_from_slice(body))
        }
        Command::Sub {
            topic,
            channel,
            max_in_flight,
        } => {
            buf.put_u8(CMD_SUB);
            put_str(buf, topic)
                .and_then(|_| put_str(buf, channel))
                .map(|_| buf.put_u32(*max_in_flight))
        }
        Command::Fin { id } => {
            buf.put_u8(CMD_FIN);
            buf.put_u64(*id);
            Ok(())
        }
    };
    if let Err(e) = encoded {
        buf.truncate(start);
        return Err(e);
    }
    let len = (buf.len() - start - 4) as u32;
    buf[start..start + 4].copy_from_slice(&len.to_be_bytes());
    Ok(())
}

/// Builds an owned, length-prefixed command frame.
pub fn encode_command(cmd: &Command) -> Result<Bytes, FrameError> {
    let mut buf = BytesMut::with_capacity(64);
    encode_command_into(cmd, &mut buf)?;
    Ok(buf.freeze())
}

/// Decodes a command from a frame body (length prefix already stripped).
pub fn decode_command(bytes: &[u8]) -> Result<Command, FrameError> {
    let mut buf = bytes;
    if buf.remaining() < 1 {
        return Err(FrameError::Truncated);
    }
    match buf.get_u8() {
        CMD_PUB => {
            let topic = take_str(&mut buf)?;
            Ok(Command::Pub {
                topic,
                body: Bytes::copy_from_slice(buf),
            })
        }
        CMD_SUB => {
            let topic = take_str(&mut buf)?;
            let channel = take_str(&mut buf)?;
            if buf.remaining() < 4 {
                return Err(FrameError::Truncated);
            }
            Ok(Command::Sub {
                topic,
                channel,
                max_in_flight: buf.get_u32(),
            })
        }
        CMD_FIN => {
            if buf.remaining() < 8 {
                return Err(FrameError::Truncated);
            }
            Ok(Command::Fin { id: buf.get_u64() })
        }
        other => Err(FrameError::UnknownType(other)),
    }
}

/// Encodes a server frame with its length prefix into `buf`.
///
/// On error `buf` is left exactly as it was.
pub fn encode_frame_into(frame: &ServerFrame, buf: &mut BytesMut) -> Result<(), FrameError> {
    let start = buf.len();
    buf.put_u32(0);
    let encoded = match frame {
        ServerFrame::Ack(ack) => {
            buf.put_u8(FRAME_ACK);
            buf.put_u8(ack.ok as u8);
            put_str(buf, &ack.info)
        }
        ServerFrame::Msg(msg) => {
            buf.put_u8(FRAME_MSG);
            buf.put_u64(msg.id);
            buf.extend_from_slice(&msg.body);
            Ok(())
        }
    };
    if let Err(e) = encoded {
        buf.truncate(start);
        return Err(e);
    }
    let len = (buf.len() - start - 4) as u32;
    buf[start..start + 4].copy_from_slice(&len.to_be_bytes());
    Ok(())
}

/// Builds an owned, length-prefixed server frame.
pub fn encode_frame(frame: &ServerFrame) -> Result<Bytes, FrameError> {
    let mut buf = BytesMut::with_capacity(64);
    encode_frame_into(frame, &mut buf)?;
    Ok(buf.freeze())
}

/// Decodes a server frame from a frame body (length prefix already
/// stripped).
pub fn decode_frame(bytes: &[u8]) -> Result<ServerFrame, FrameError> {
    let mut buf = bytes;
    if buf.remaining() < 1 {
        return Err(FrameError::Truncated);
    }
    match buf.get_u8() {
        FRAME_ACK => {
            if buf.remaining() < 1 {
                return Err(FrameError::Truncated);
            }
            let ok = buf.get_u8() != 0;
            let info = take_str(&mut buf)?;
            Ok(ServerFrame::Ack(Ack { ok, info }))
        }
        FRAME_MSG => {
            if buf.remaining() < 8 {
                return Err(FrameError::Truncated);
            }
            let id = buf.get_u64();
            Ok(ServerFrame::Msg(Msg {
                id,
                body: Bytes::copy_from_slice(buf),
            }))
        }
        other => Err(FrameError::UnknownType(other)),
    }
}

/// Reads one length-prefixed frame body from `reader`.
///
/// Returns `Ok(None)` on a clean EOF at a frame boundary.
pub async fn read_frame<R>(reader: &mut R) -> io::Result<Option<Bytes>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame length {len} exceeds cap {MAX_FRAME_LEN}"),
        ));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(Bytes::from(body)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pub_command_round_trips() {
        let cmd = Command::Pub {
            topic: "user_event".into(),
            body: Bytes::from_static(b"{\"k\":1}"),
        };
        let frame = encode_command(&cmd).unwrap();
        let decoded = decode_command(&frame[4..]).unwrap();
        match decoded {
            Command::Pub { topic, body } => {
                assert_eq!(topic, "user_event");
                assert_eq!(&body[..], b"{\"k\":1}");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn sub_command_round_trips() {
        let cmd = Command::Sub {
            topic: "t".into(),
            channel: "c".into(),
            max_in_flight: 100,
        };
        let frame = encode_command(&cmd).unwrap();
        match decode_command(&frame[4..]).unwrap() {
            Command::Sub {
                topic,
                channel,
                max_in_flight,
            } => {
                assert_eq!((topic.as_str(), channel.as_str(), max_in_flight), ("t", "c", 100));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn msg_frame_round_trips() {
        let frame = encode_frame(&ServerFrame::Msg(Msg {
            id: 7,
            body: Bytes::from_static(b"payload"),
        }))
        .unwrap();
        match decode_frame(&frame[4..]).unwrap() {
            ServerFrame::Msg(msg) => {
                assert_eq!(msg.id, 7);
                assert_eq!(&msg.body[..], b"payload");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let frame = encode_command(&Command::Fin { id: 9 }).unwrap();
        assert!(matches!(
            decode_command(&frame[4..frame.len() - 4]),
            Err(FrameError::Truncated)
        ));
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(matches!(
            decode_command(&[0xEE]),
            Err(FrameError::UnknownType(0xEE))
        ));
    }

    #[test]
    fn oversized_name_is_rejected_at_encode() {
        let topic = "t".repeat(u16::MAX as usize + 1);
        let cmd = Command::Pub {
            topic,
            body: Bytes::from_static(b"x"),
        };
        let mut buf = BytesMut::from(&b"prior"[..]);
        assert!(matches!(
            encode_command_into(&cmd, &mut buf),
            Err(FrameError::StringTooLong(_))
        ));
        // Nothing half-written into the buffer.
        assert_eq!(&buf[..], b"prior");
    }
}
