//! 统一消息枚举与解码入口

use crate::command::{CommandRequest, CommandResponse};
use crate::header::{HEADER_LEN, MessageHeader, MessageType};
use crate::state::StateMessage;
use crate::ProtocolError;

/// 协议消息枚举
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Subscribe { seq: u32 },
    Unsubscribe { seq: u32 },
    State(StateMessage),
    Command(CommandRequest),
    CommandResponse(CommandResponse),
}

impl Message {
    /// 消息类型
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Subscribe { .. } => MessageType::Subscribe,
            Message::Unsubscribe { .. } => MessageType::Unsubscribe,
            Message::State(_) => MessageType::State,
            Message::Command(_) => MessageType::Command,
            Message::CommandResponse(_) => MessageType::CommandResponse,
        }
    }
}

/// 编码 Subscribe 消息（只有消息头）
pub fn encode_subscribe(seq: u32, buf: &mut [u8; HEADER_LEN]) -> &[u8] {
    MessageHeader::new(MessageType::Subscribe, HEADER_LEN as u16, seq).encode(buf);
    &buf[..]
}

/// 编码 Unsubscribe 消息（只有消息头）
pub fn encode_unsubscribe(seq: u32, buf: &mut [u8; HEADER_LEN]) -> &[u8] {
    MessageHeader::new(MessageType::Unsubscribe, HEADER_LEN as u16, seq).encode(buf);
    &buf[..]
}

/// 解码一条完整消息
///
/// 缓冲区可以比消息长（多余字节被忽略），但不能比消息头声明的长度短。
pub fn decode_message(buf: &[u8]) -> Result<Message, ProtocolError> {
    let header = MessageHeader::decode(buf)?;
    let declared = header.length as usize;
    if declared < HEADER_LEN || declared > buf.len() {
        return Err(ProtocolError::LengthMismatch {
            declared,
            actual: buf.len(),
        });
    }
    let buf = &buf[..declared];

    match header.msg_type {
        MessageType::Subscribe => Ok(Message::Subscribe { seq: header.seq }),
        MessageType::Unsubscribe => Ok(Message::Unsubscribe { seq: header.seq }),
        MessageType::State => StateMessage::decode(&header, buf).map(Message::State),
        MessageType::Command => CommandRequest::decode(&header, buf).map(Message::Command),
        MessageType::CommandResponse => {
            CommandResponse::decode(&header, buf).map(Message::CommandResponse)
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribe_decode() {
        let mut buf = [0u8; HEADER_LEN];
        let bytes = encode_subscribe(9, &mut buf).to_vec();
        assert_eq!(decode_message(&bytes).unwrap(), Message::Subscribe { seq: 9 });
    }

    #[test]
    fn test_unsubscribe_decode() {
        let mut buf = [0u8; HEADER_LEN];
        let bytes = encode_unsubscribe(2, &mut buf).to_vec();
        let message = decode_message(&bytes).unwrap();
        assert_eq!(message.message_type(), MessageType::Unsubscribe);
    }

    #[test]
    fn test_declared_length_longer_than_buffer() {
        let mut buf = [0u8; HEADER_LEN];
        MessageHeader::new(MessageType::State, 49, 0).encode(&mut buf);
        assert_eq!(
            decode_message(&buf).unwrap_err(),
            ProtocolError::LengthMismatch {
                declared: 49,
                actual: 8
            }
        );
    }

    #[test]
    fn test_trailing_bytes_ignored() {
        let mut buf = [0u8; 16];
        MessageHeader::new(MessageType::Subscribe, HEADER_LEN as u16, 4).encode(&mut buf);
        assert_eq!(decode_message(&buf).unwrap(), Message::Subscribe { seq: 4 });
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(decode_message(&[]).is_err());
        assert!(decode_message(&[0xFF; 32]).is_err());
    }
}
