//! 树莓派 GPIO 后端（基于 rppal）
//!
//! - 每个引脚一个槽位（独立锁），边沿回调线程读取其他引脚时不会与
//!   注销回调互相阻塞
//! - PWM 为 rppal 软件 PWM，固定频率 [`PWM_FREQUENCY_HZ`]

use crate::{Edge, EdgeCallback, EdgeEvent, GpioBackend, GpioError, Level, Pin, PinMode, Pull};
use parking_lot::Mutex;
use rppal::gpio::{self, Gpio, InputPin, OutputPin, Trigger};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// 软件 PWM 频率
pub const PWM_FREQUENCY_HZ: f64 = 800.0;

enum PinHandle {
    Unconfigured,
    Input(InputPin),
    Output(OutputPin),
}

struct PinSlot {
    handle: PinHandle,
    pull: Pull,
}

/// rppal 后端
pub struct RppalBackend {
    gpio: Mutex<Option<Gpio>>,
    slots: Mutex<HashMap<Pin, Arc<Mutex<PinSlot>>>>,
    epoch: Instant,
}

impl Default for RppalBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl RppalBackend {
    pub fn new() -> Self {
        Self {
            gpio: Mutex::new(None),
            slots: Mutex::new(HashMap::new()),
            epoch: Instant::now(),
        }
    }

    fn slot(&self, pin: Pin) -> Arc<Mutex<PinSlot>> {
        self.slots
            .lock()
            .entry(pin)
            .or_insert_with(|| {
                Arc::new(Mutex::new(PinSlot {
                    handle: PinHandle::Unconfigured,
                    pull: Pull::Off,
                }))
            })
            .clone()
    }

    fn gpio(&self) -> Result<Gpio, GpioError> {
        self.gpio
            .lock()
            .clone()
            .ok_or_else(|| GpioError::BackendUnavailable("backend not initialised".into()))
    }

    fn make_input(&self, pin: Pin, pull: Pull) -> Result<InputPin, GpioError> {
        let raw = self.gpio()?.get(pin).map_err(|e| map_err("get", pin, e))?;
        Ok(match pull {
            Pull::Off => raw.into_input(),
            Pull::Up => raw.into_input_pullup(),
            Pull::Down => raw.into_input_pulldown(),
        })
    }

    fn make_output(&self, pin: Pin) -> Result<OutputPin, GpioError> {
        let raw = self.gpio()?.get(pin).map_err(|e| map_err("get", pin, e))?;
        Ok(raw.into_output())
    }
}

fn map_err(op: &'static str, pin: Pin, e: gpio::Error) -> GpioError {
    match e {
        gpio::Error::PinNotAvailable(_) => GpioError::PinInUse(pin),
        other => GpioError::backend(op, pin, other.to_string()),
    }
}

fn to_level(level: gpio::Level) -> Level {
    match level {
        gpio::Level::Low => Level::Low,
        gpio::Level::High => Level::High,
    }
}

fn from_level(level: Level) -> gpio::Level {
    match level {
        Level::Low => gpio::Level::Low,
        Level::High => gpio::Level::High,
    }
}

impl GpioBackend for RppalBackend {
    fn name(&self) -> &str {
        "rppal"
    }

    fn initialise(&self) -> Result<(), GpioError> {
        let gpio = Gpio::new().map_err(|e| GpioError::BackendUnavailable(e.to_string()))?;
        *self.gpio.lock() = Some(gpio);
        debug!("rppal GPIO initialised");
        Ok(())
    }

    fn terminate(&self) {
        // 丢弃引脚对象，rppal 会恢复其原始模式
        let slots: Vec<_> = self.slots.lock().drain().map(|(_, slot)| slot).collect();
        for slot in slots {
            let mut slot = slot.lock();
            if let PinHandle::Input(input) = &mut slot.handle {
                if let Err(e) = input.clear_async_interrupt() {
                    warn!("Failed to clear interrupt during terminate: {}", e);
                }
            }
            slot.handle = PinHandle::Unconfigured;
        }
        *self.gpio.lock() = None;
    }

    fn set_mode(&self, pin: Pin, mode: PinMode) -> Result<(), GpioError> {
        let slot = self.slot(pin);
        let mut slot = slot.lock();
        match (mode, &slot.handle) {
            (PinMode::Input, PinHandle::Input(_)) | (PinMode::Output, PinHandle::Output(_)) => {
                return Ok(());
            },
            _ => {},
        }
        // 先释放旧对象，否则 rppal 认为引脚仍被占用
        slot.handle = PinHandle::Unconfigured;
        slot.handle = match mode {
            PinMode::Input => PinHandle::Input(self.make_input(pin, slot.pull)?),
            PinMode::Output => PinHandle::Output(self.make_output(pin)?),
        };
        Ok(())
    }

    fn set_pull(&self, pin: Pin, pull: Pull) -> Result<(), GpioError> {
        let slot = self.slot(pin);
        let mut slot = slot.lock();
        if slot.pull == pull {
            return Ok(());
        }
        slot.pull = pull;
        if let PinHandle::Input(_) = slot.handle {
            slot.handle = PinHandle::Unconfigured;
            slot.handle = PinHandle::Input(self.make_input(pin, pull)?);
        }
        Ok(())
    }

    fn read(&self, pin: Pin) -> Result<Level, GpioError> {
        let slot = self.slot(pin);
        let slot = slot.lock();
        match &slot.handle {
            PinHandle::Input(input) => Ok(to_level(input.read())),
            PinHandle::Output(output) => Ok(Level::from(output.is_set_high())),
            PinHandle::Unconfigured => Err(GpioError::backend("read", pin, "pin not configured")),
        }
    }

    fn write(&self, pin: Pin, level: Level) -> Result<(), GpioError> {
        let slot = self.slot(pin);
        let mut slot = slot.lock();
        match &mut slot.handle {
            PinHandle::Output(output) => {
                output.write(from_level(level));
                Ok(())
            },
            _ => Err(GpioError::backend("write", pin, "pin is not an output")),
        }
    }

    fn set_pwm(&self, pin: Pin, duty: u8) -> Result<(), GpioError> {
        let slot = self.slot(pin);
        let mut slot = slot.lock();
        match &mut slot.handle {
            PinHandle::Output(output) => {
                if duty == 0 {
                    output.clear_pwm().map_err(|e| map_err("clear_pwm", pin, e))?;
                    output.set_low();
                } else {
                    output
                        .set_pwm_frequency(PWM_FREQUENCY_HZ, duty as f64 / 255.0)
                        .map_err(|e| map_err("set_pwm", pin, e))?;
                }
                Ok(())
            },
            // 已回到输入模式的引脚不输出 PWM
            _ if duty == 0 => Ok(()),
            _ => Err(GpioError::backend("set_pwm", pin, "pin is not an output")),
        }
    }

    fn on_edge(&self, pin: Pin, edge: Edge, callback: EdgeCallback) -> Result<(), GpioError> {
        let trigger = match edge {
            Edge::Rising => Trigger::RisingEdge,
            Edge::Falling => Trigger::FallingEdge,
            Edge::Both => Trigger::Both,
        };
        let epoch = self.epoch;
        let slot = self.slot(pin);
        let mut slot = slot.lock();
        match &mut slot.handle {
            PinHandle::Input(input) => input
                .set_async_interrupt(trigger, move |level| {
                    callback(EdgeEvent {
                        pin,
                        level: to_level(level),
                        tick_us: epoch.elapsed().as_micros() as u64,
                    })
                })
                .map_err(|e| map_err("on_edge", pin, e)),
            _ => Err(GpioError::backend("on_edge", pin, "pin is not an input")),
        }
    }

    fn clear_edge(&self, pin: Pin) -> Result<(), GpioError> {
        let slot = self.slot(pin);
        let mut slot = slot.lock();
        match &mut slot.handle {
            PinHandle::Input(input) => input
                .clear_async_interrupt()
                .map_err(|e| map_err("clear_edge", pin, e)),
            _ => Ok(()),
        }
    }

    fn tick_us(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }
}
