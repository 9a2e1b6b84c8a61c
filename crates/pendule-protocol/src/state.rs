//! 状态广播消息
//!
//! 服务端每个发布周期发送一条，客户端只保留最新的一条。

use crate::header::{HEADER_LEN, MessageHeader, MessageType};
use crate::{ProtocolError, read_f64_le, read_u64_le};

/// 状态消息总长度：8 (header) + 4 * 8 (f64) + 1 (status) + 8 (timestamp)
pub const STATE_MESSAGE_LEN: usize = HEADER_LEN + 32 + 1 + 8;

const STATUS_CALIBRATED: u8 = 0x01;
const STATUS_EMERGENCY_STOPPED: u8 = 0x02;

/// 状态快照
///
/// 未标定时 `position`/`angle`/速度字段为 NaN。
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StateMessage {
    /// 发布序号（单调递增）
    pub seq: u32,
    /// 小车位置（米，从左限位开始计）
    pub position: f64,
    /// 摆角（弧度）
    pub angle: f64,
    /// 小车速度（米/秒）
    pub linear_velocity: f64,
    /// 摆角速度（弧度/秒）
    pub angular_velocity: f64,
    /// 是否已标定
    pub calibrated: bool,
    /// 是否处于急停锁存状态
    pub emergency_stopped: bool,
    /// 服务端时间戳（微秒，自服务启动）
    pub timestamp_us: u64,
}

impl StateMessage {
    /// 未标定时的占位快照
    pub fn uncalibrated(seq: u32, emergency_stopped: bool, timestamp_us: u64) -> Self {
        Self {
            seq,
            position: f64::NAN,
            angle: f64::NAN,
            linear_velocity: f64::NAN,
            angular_velocity: f64::NAN,
            calibrated: false,
            emergency_stopped,
            timestamp_us,
        }
    }

    fn status_byte(&self) -> u8 {
        let mut status = 0;
        if self.calibrated {
            status |= STATUS_CALIBRATED;
        }
        if self.emergency_stopped {
            status |= STATUS_EMERGENCY_STOPPED;
        }
        status
    }

    /// 从完整消息缓冲区解码（含消息头）
    pub(crate) fn decode(header: &MessageHeader, buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < STATE_MESSAGE_LEN {
            return Err(ProtocolError::TooShort {
                expected: STATE_MESSAGE_LEN,
                actual: buf.len(),
            });
        }

        let status = buf[40];
        if status & !(STATUS_CALIBRATED | STATUS_EMERGENCY_STOPPED) != 0 {
            return Err(ProtocolError::InvalidValue {
                field: "status",
                value: status,
            });
        }

        Ok(Self {
            seq: header.seq,
            position: read_f64_le(buf, 8),
            angle: read_f64_le(buf, 16),
            linear_velocity: read_f64_le(buf, 24),
            angular_velocity: read_f64_le(buf, 32),
            calibrated: status & STATUS_CALIBRATED != 0,
            emergency_stopped: status & STATUS_EMERGENCY_STOPPED != 0,
            timestamp_us: read_u64_le(buf, 41),
        })
    }
}

/// 编码状态消息（零拷贝）
pub fn encode_state<'a>(state: &StateMessage, buf: &'a mut [u8; STATE_MESSAGE_LEN]) -> &'a [u8] {
    let header = MessageHeader::new(MessageType::State, STATE_MESSAGE_LEN as u16, state.seq);
    header.encode(&mut buf[..HEADER_LEN]);
    buf[8..16].copy_from_slice(&state.position.to_le_bytes());
    buf[16..24].copy_from_slice(&state.angle.to_le_bytes());
    buf[24..32].copy_from_slice(&state.linear_velocity.to_le_bytes());
    buf[32..40].copy_from_slice(&state.angular_velocity.to_le_bytes());
    buf[40] = state.status_byte();
    buf[41..49].copy_from_slice(&state.timestamp_us.to_le_bytes());
    &buf[..STATE_MESSAGE_LEN]
}
