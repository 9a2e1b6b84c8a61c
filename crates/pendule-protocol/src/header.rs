//! 消息头定义
//!
//! 所有消息共享同一个 8 字节消息头。

use crate::ProtocolError;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// 消息头长度（字节）
pub const HEADER_LEN: usize = 8;

/// 标志位：客户端不需要响应（`wait = false`）
pub const FLAG_NO_REPLY: u8 = 0x01;

/// 消息类型枚举
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MessageType {
    // 客户端 → 服务端（状态端口，UDP）
    Subscribe = 0x01,   // 订阅状态广播（同时续约）
    Unsubscribe = 0x02, // 取消订阅

    // 服务端 → 客户端（状态端口，UDP）
    State = 0x10, // 状态快照

    // 命令端口（TCP）
    Command = 0x20,         // 命令请求
    CommandResponse = 0x21, // 命令响应
}

/// 消息头（8 字节）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub msg_type: MessageType,
    pub flags: u8,
    /// 整条消息长度（含消息头）
    pub length: u16,
    pub seq: u32,
}

impl MessageHeader {
    /// 创建新的消息头
    pub fn new(msg_type: MessageType, length: u16, seq: u32) -> Self {
        Self {
            msg_type,
            flags: 0,
            length,
            seq,
        }
    }

    /// 设置标志位
    pub fn with_flags(mut self, flags: u8) -> Self {
        self.flags = flags;
        self
    }

    /// 是否要求服务端不回复
    pub fn no_reply(&self) -> bool {
        self.flags & FLAG_NO_REPLY != 0
    }

    /// 编码消息头到缓冲区（8 字节）
    pub fn encode(&self, buf: &mut [u8]) {
        assert!(buf.len() >= HEADER_LEN);
        buf[0] = self.msg_type.into();
        buf[1] = self.flags;
        buf[2..4].copy_from_slice(&self.length.to_le_bytes());
        buf[4..8].copy_from_slice(&self.seq.to_le_bytes());
    }

    /// 从缓冲区解码消息头
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < HEADER_LEN {
            return Err(ProtocolError::TooShort {
                expected: HEADER_LEN,
                actual: buf.len(),
            });
        }

        let msg_type =
            MessageType::try_from(buf[0]).map_err(|_| ProtocolError::InvalidMessageType(buf[0]))?;
        let flags = buf[1];
        let length = u16::from_le_bytes([buf[2], buf[3]]);
        let seq = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);

        Ok(Self {
            msg_type,
            flags,
            length,
            seq,
        })
    }
}
