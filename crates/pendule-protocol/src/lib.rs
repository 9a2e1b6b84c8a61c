//! # Pendule Protocol
//!
//! 倒立摆远程接口的线上格式定义（无 I/O 依赖）
//!
//! ## 模块
//!
//! - `header`: 8 字节消息头、消息类型、标志位
//! - `state`: 状态广播消息（UDP）
//! - `command`: 命令请求/响应（TCP）与错误类型枚举
//! - `message`: 统一的消息枚举与解码入口
//!
//! ## 字节序
//!
//! 所有多字节字段均为小端（Little Endian），浮点数为 IEEE-754 `f64`。
//!
//! ```text
//! +---------+-------+-----------+-----------+------------------+
//! | type u8 | flags | length u16| seq u32   | payload ...      |
//! +---------+-------+-----------+-----------+------------------+
//! ```
//!
//! `length` 为整条消息（含消息头）的字节数。

pub mod command;
pub mod header;
pub mod message;
pub mod state;

pub use command::{
    COMMAND_MESSAGE_LEN, CommandOp, CommandRequest, CommandResponse, ErrorKind,
    MAX_RESPONSE_MESSAGE_LEN,
    encode_command, encode_command_response,
};
pub use header::{FLAG_NO_REPLY, HEADER_LEN, MessageHeader, MessageType};
pub use message::{Message, decode_message, encode_subscribe, encode_unsubscribe};
pub use state::{STATE_MESSAGE_LEN, StateMessage, encode_state};

use thiserror::Error;

/// 协议解析错误类型
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Message too short: expected at least {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },

    #[error("Invalid message type: 0x{0:02X}")]
    InvalidMessageType(u8),

    #[error("Length field mismatch: header says {declared}, buffer has {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("Invalid value for field {field}: {value}")]
    InvalidValue { field: &'static str, value: u8 },

    #[error("Message too large: {0} bytes")]
    TooLarge(usize),

    #[error("Invalid UTF-8 in response message")]
    InvalidUtf8,
}

/// 读取小端 f64
pub(crate) fn read_f64_le(buf: &[u8], offset: usize) -> f64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    f64::from_le_bytes(bytes)
}

/// 读取小端 u64
pub(crate) fn read_u64_le(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}
