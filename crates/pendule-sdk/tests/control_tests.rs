//! 同一段控制代码分别驱动本地与远程倒立摆

use pendule_sdk::driver::sim::{CartSimulator, SimParams};
use pendule_sdk::driver::{CalibrationConfig, LimitsConfig, PhysicsConfig};
use pendule_sdk::gpio::mock::MockGpio;
use pendule_sdk::prelude::*;
use serial_test::serial;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn config() -> PenduleConfig {
    PenduleConfig {
        physics: PhysicsConfig {
            track_length: 1.0,
            meters_per_step: 0.001,
            radians_per_step: 0.01,
            rest_angle: 0.0,
        },
        calibration: CalibrationConfig {
            power: 0.3,
            timeout_ms: 5000,
            poll_interval_ms: 1,
            angle_settle_ms: 20,
        },
        limits: LimitsConfig {
            max_power: 0.8,
            hard_margin: 0.05,
            soft_margin: 0.1,
        },
        ..Default::default()
    }
}

fn start() -> (MockGpio, CartSimulator, Arc<Pendule>) {
    pendule_sdk::init_logger();
    let config = config();
    let mock = MockGpio::new();
    let sim = CartSimulator::start(mock.clone(), config.pins, SimParams::for_config(&config));
    let conn = GpioConnection::acquire(mock.clone()).unwrap();
    let pendule = Arc::new(Pendule::new(conn, config).unwrap());
    (mock, sim, pendule)
}

/// 与位置无关的控制过程：标定，向右推一小段，再停下
fn nudge_right<P: PenduleControl>(pendule: &P, settle: impl Fn()) -> f64 {
    assert!(pendule.position().is_err());
    pendule.calibrate().unwrap();
    settle();
    assert!(pendule.is_calibrated());
    let start = pendule.position().unwrap();

    pendule.drive(0.1).unwrap();
    thread::sleep(Duration::from_millis(30));
    pendule.drive(0.0).unwrap();
    settle();
    pendule.position().unwrap() - start
}

fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(2));
    }
}

#[test]
#[serial]
fn test_local_control() {
    let (_mock, _sim, pendule) = start();
    let moved = nudge_right(pendule.as_ref(), || {});
    assert!(moved > 0.0, "moved {}", moved);

    let events: Vec<PenduleEvent> = pendule.events().try_iter().collect();
    assert!(events.iter().any(|e| matches!(e, PenduleEvent::Calibrated(_))));
}

#[test]
#[serial]
fn test_remote_control() {
    let (mock, _sim, pendule) = start();
    let pwm_pin = pendule.config().pins.motor_pwm;
    let server = PenduleServer::start(pendule, &ServerConfig::loopback()).unwrap();
    let remote = RemotePendule::connect(RemoteConfig::new("127.0.0.1").with_ports(
        server.state_addr().port(),
        server.command_addr().port(),
    ))
    .unwrap();

    // 等待下一条状态，使读数反映刚执行完的命令
    let states = remote.states();
    let settle = || {
        let published = server.publisher().published();
        wait_until(|| server.publisher().published() >= published + 2);
        let _ = states.recv_timeout(Duration::from_secs(1));
    };
    let moved = nudge_right(&remote, settle);
    assert!(moved > 0.0, "moved {}", moved);

    remote.emergency_stop().unwrap();
    assert_eq!(mock.pwm(pwm_pin), 0);
    wait_until(|| remote.is_emergency_stopped());
    // 急停不清除标定
    assert!(remote.is_calibrated());
    assert!(remote.position().is_ok());
    assert!(matches!(
        remote.drive(0.1),
        Err(RemoteError::Pendule(PenduleError::EmergencyStop(_)))
    ));
}
