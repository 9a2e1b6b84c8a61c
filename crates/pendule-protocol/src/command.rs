//! 命令请求与响应
//!
//! 命令通道为请求/响应模式：一条 `Command` 对应一条 `CommandResponse`
//! （除非请求带有 [`FLAG_NO_REPLY`](crate::FLAG_NO_REPLY)）。

use crate::header::{HEADER_LEN, MessageHeader, MessageType};
use crate::{ProtocolError, read_f64_le};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// 命令消息总长度：8 (header) + 1 (op) + 8 (power)
pub const COMMAND_MESSAGE_LEN: usize = HEADER_LEN + 1 + 8;

/// 响应中错误描述的最大字节数（超出部分被截断）
pub const MAX_RESPONSE_MESSAGE_LEN: usize = 240;

/// 响应消息固定部分长度：8 (header) + 1 (ok) + 1 (error_kind) + 2 (message_len)
const RESPONSE_FIXED_LEN: usize = HEADER_LEN + 4;

/// 命令类型
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CommandOp {
    Drive = 0x01,
    Calibrate = 0x02,
    EmergencyStop = 0x03,
    Reset = 0x04,
}

/// 失败原因（线上编码）
///
/// 与驱动层错误类型一一对应，客户端据此重建同类错误。
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ErrorKind {
    BackendUnavailable = 0x01,
    AlreadyActive = 0x02,
    InterruptsAreDisabled = 0x03,
    NotCalibrated = 0x04,
    CalibrationFailed = 0x05,
    EmergencyStop = 0x06,
    Busy = 0x07,
    InvalidCommand = 0x08,
    InvalidConfig = 0x09,
    Hardware = 0x0A,
}

/// 命令请求
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CommandRequest {
    pub seq: u32,
    pub op: CommandOp,
    /// 仅 `Drive` 使用，其余命令为 0.0
    pub power: f64,
    /// 客户端不等待响应
    pub no_reply: bool,
}

impl CommandRequest {
    pub fn drive(seq: u32, power: f64) -> Self {
        Self {
            seq,
            op: CommandOp::Drive,
            power,
            no_reply: false,
        }
    }

    pub fn simple(seq: u32, op: CommandOp) -> Self {
        Self {
            seq,
            op,
            power: 0.0,
            no_reply: false,
        }
    }

    /// 标记为无需响应
    pub fn without_reply(mut self) -> Self {
        self.no_reply = true;
        self
    }

    pub(crate) fn decode(header: &MessageHeader, buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < COMMAND_MESSAGE_LEN {
            return Err(ProtocolError::TooShort {
                expected: COMMAND_MESSAGE_LEN,
                actual: buf.len(),
            });
        }
        let op = CommandOp::try_from(buf[8]).map_err(|_| ProtocolError::InvalidValue {
            field: "op",
            value: buf[8],
        })?;
        Ok(Self {
            seq: header.seq,
            op,
            power: read_f64_le(buf, 9),
            no_reply: header.no_reply(),
        })
    }
}

/// 命令响应
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CommandResponse {
    /// 与请求相同的序号
    pub seq: u32,
    pub ok: bool,
    pub error_kind: Option<ErrorKind>,
    /// 错误描述（成功时为空）
    pub message: String,
}

impl CommandResponse {
    pub fn success(seq: u32) -> Self {
        Self {
            seq,
            ok: true,
            error_kind: None,
            message: String::new(),
        }
    }

    pub fn failure(seq: u32, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            seq,
            ok: false,
            error_kind: Some(kind),
            message: message.into(),
        }
    }

    pub(crate) fn decode(header: &MessageHeader, buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < RESPONSE_FIXED_LEN {
            return Err(ProtocolError::TooShort {
                expected: RESPONSE_FIXED_LEN,
                actual: buf.len(),
            });
        }
        let ok = match buf[8] {
            0 => false,
            1 => true,
            value => return Err(ProtocolError::InvalidValue { field: "ok", value }),
        };
        let error_kind = match buf[9] {
            0 => None,
            value => Some(
                ErrorKind::try_from(value)
                    .map_err(|_| ProtocolError::InvalidValue { field: "error_kind", value })?,
            ),
        };
        if !ok && error_kind.is_none() {
            return Err(ProtocolError::InvalidValue {
                field: "error_kind",
                value: 0,
            });
        }
        let message_len = u16::from_le_bytes([buf[10], buf[11]]) as usize;
        let end = RESPONSE_FIXED_LEN + message_len;
        if buf.len() < end {
            return Err(ProtocolError::TooShort {
                expected: end,
                actual: buf.len(),
            });
        }
        let message = std::str::from_utf8(&buf[RESPONSE_FIXED_LEN..end])
            .map_err(|_| ProtocolError::InvalidUtf8)?
            .to_string();

        Ok(Self {
            seq: header.seq,
            ok,
            error_kind,
            message,
        })
    }
}

/// 编码命令请求（零拷贝）
pub fn encode_command<'a>(
    request: &CommandRequest,
    buf: &'a mut [u8; COMMAND_MESSAGE_LEN],
) -> &'a [u8] {
    let flags = if request.no_reply {
        crate::FLAG_NO_REPLY
    } else {
        0
    };
    let header = MessageHeader::new(MessageType::Command, COMMAND_MESSAGE_LEN as u16, request.seq)
        .with_flags(flags);
    header.encode(&mut buf[..HEADER_LEN]);
    buf[8] = request.op.into();
    buf[9..17].copy_from_slice(&request.power.to_le_bytes());
    &buf[..COMMAND_MESSAGE_LEN]
}

/// 编码命令响应
///
/// 错误描述超过 [`MAX_RESPONSE_MESSAGE_LEN`] 时在字符边界处截断。
pub fn encode_command_response<'a>(
    response: &CommandResponse,
    buf: &'a mut [u8; 256],
) -> &'a [u8] {
    let mut cut = response.message.len().min(MAX_RESPONSE_MESSAGE_LEN);
    while !response.message.is_char_boundary(cut) {
        cut -= 1;
    }
    let message = &response.message.as_bytes()[..cut];
    let length = RESPONSE_FIXED_LEN + message.len();

    let header = MessageHeader::new(MessageType::CommandResponse, length as u16, response.seq);
    header.encode(&mut buf[..HEADER_LEN]);
    buf[8] = u8::from(response.ok);
    buf[9] = response.error_kind.map(u8::from).unwrap_or(0);
    buf[10..12].copy_from_slice(&(message.len() as u16).to_le_bytes());
    buf[RESPONSE_FIXED_LEN..length].copy_from_slice(message);
    &buf[..length]
}
