//! TCP 流上的消息分帧
//!
//! 每条消息自带长度（消息头的 `length` 字段），先读 8 字节消息头，再读
//! 剩余部分。

use pendule_protocol::{HEADER_LEN, Message, MessageHeader, ProtocolError, decode_message};
use std::io::{self, Read};

use crate::RemoteError;

/// 单条消息的最大长度
pub(crate) const MAX_FRAME_LEN: usize = 256;

/// 读取一条完整消息
///
/// 对端在消息边界处关闭连接时返回 `Ok(None)`。
pub(crate) fn read_message(
    stream: &mut impl Read,
    buf: &mut [u8; MAX_FRAME_LEN],
) -> Result<Option<Message>, RemoteError> {
    match stream.read_exact(&mut buf[..HEADER_LEN]) {
        Ok(()) => {},
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let header = MessageHeader::decode(&buf[..HEADER_LEN])?;
    let length = header.length as usize;
    if length > MAX_FRAME_LEN {
        return Err(ProtocolError::TooLarge(length).into());
    }
    if length < HEADER_LEN {
        return Err(ProtocolError::LengthMismatch {
            declared: length,
            actual: HEADER_LEN,
        }
        .into());
    }
    stream.read_exact(&mut buf[HEADER_LEN..length])?;
    Ok(Some(decode_message(&buf[..length])?))
}

/// 读超时在不同平台上表现为 `WouldBlock` 或 `TimedOut`
pub(crate) fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pendule_protocol::{COMMAND_MESSAGE_LEN, CommandRequest, encode_command};
    use std::io::Cursor;

    #[test]
    fn test_reads_back_to_back_frames() {
        let mut bytes = Vec::new();
        let mut frame = [0u8; COMMAND_MESSAGE_LEN];
        bytes.extend_from_slice(encode_command(&CommandRequest::drive(1, 0.5), &mut frame));
        bytes.extend_from_slice(encode_command(&CommandRequest::drive(2, -0.5), &mut frame));

        let mut cursor = Cursor::new(bytes);
        let mut buf = [0u8; MAX_FRAME_LEN];
        let first = read_message(&mut cursor, &mut buf).unwrap();
        assert!(matches!(first, Some(Message::Command(r)) if r.seq == 1 && r.power == 0.5));
        let second = read_message(&mut cursor, &mut buf).unwrap();
        assert!(matches!(second, Some(Message::Command(r)) if r.seq == 2));
        assert!(read_message(&mut cursor, &mut buf).unwrap().is_none());
    }

    #[test]
    fn test_truncated_frame_is_an_error() {
        let mut frame = [0u8; COMMAND_MESSAGE_LEN];
        let bytes = encode_command(&CommandRequest::drive(1, 0.5), &mut frame)[..12].to_vec();
        let mut buf = [0u8; MAX_FRAME_LEN];
        let err = read_message(&mut Cursor::new(bytes), &mut buf).unwrap_err();
        assert!(matches!(err, RemoteError::Connection(_)));
    }

    #[test]
    fn test_bad_length_rejected() {
        let mut bytes = [0u8; HEADER_LEN];
        MessageHeader::new(pendule_protocol::MessageType::Command, 4, 0).encode(&mut bytes);
        let mut buf = [0u8; MAX_FRAME_LEN];
        let err = read_message(&mut Cursor::new(bytes.to_vec()), &mut buf).unwrap_err();
        assert!(matches!(err, RemoteError::Protocol(_)));
    }
}
