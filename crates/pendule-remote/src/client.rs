//! 远程客户端
//!
//! [`RemotePendule`] 订阅服务端的状态广播（后台线程接收并续租），命令
//! 通过按需建立的 TCP 连接发送。急停使用独立的连接，不会排在正在
//! 执行的标定之后。连接出错后被丢弃，下一次调用时重新建立；失败的命令
//! 不会被自动重试。

use parking_lot::Mutex;
use pendule_driver::{PenduleControl, PenduleError};
use pendule_protocol::{
    COMMAND_MESSAGE_LEN, CommandOp, CommandRequest, HEADER_LEN, Message, StateMessage,
    decode_message, encode_command, encode_subscribe, encode_unsubscribe,
};
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

use crate::config::RemoteConfig;
use crate::mailbox::{Mailbox, StateSubscriber};
use crate::transport::{MAX_FRAME_LEN, is_timeout, read_message};
use crate::RemoteError;

/// 接收线程检查退出标志的间隔
const POLL_INTERVAL: Duration = Duration::from_millis(50);

fn resolve(host: &str, port: u16) -> Result<SocketAddr, RemoteError> {
    (host, port).to_socket_addrs()?.next().ok_or_else(|| {
        RemoteError::InvalidConfig(format!("cannot resolve {}:{}", host, port))
    })
}

/// 远程倒立摆
pub struct RemotePendule {
    config: RemoteConfig,
    state_addr: SocketAddr,
    command_addr: SocketAddr,
    socket: UdpSocket,
    mailbox: Arc<Mailbox>,
    running: Arc<AtomicBool>,
    receiver: Option<JoinHandle<()>>,
    command: Mutex<Option<TcpStream>>,
    /// 急停专用连接
    emergency: Mutex<Option<TcpStream>>,
    seq: AtomicU32,
}

impl RemotePendule {
    /// 连接服务端
    ///
    /// 订阅状态广播，并等待第一条状态（最长 `connect_timeout`）。
    pub fn connect(config: RemoteConfig) -> Result<Self, RemoteError> {
        let state_addr = resolve(&config.host, config.state_port)?;
        let command_addr = resolve(&config.host, config.command_port)?;

        let unspecified = match state_addr.ip() {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        let socket = UdpSocket::bind(SocketAddr::new(unspecified, 0))?;
        socket.set_read_timeout(Some(POLL_INTERVAL))?;
        let recv_socket = socket.try_clone()?;

        let mailbox = Mailbox::new();
        let running = Arc::new(AtomicBool::new(true));
        let receiver = {
            let mailbox = mailbox.clone();
            let running = running.clone();
            let renew = config.lease_renew();
            thread::Builder::new()
                .name("state-receiver".into())
                .spawn(move || receive_loop(recv_socket, state_addr, renew, mailbox, running))?
        };

        let remote = Self {
            config,
            state_addr,
            command_addr,
            socket,
            mailbox,
            running,
            receiver: Some(receiver),
            command: Mutex::new(None),
            emergency: Mutex::new(None),
            seq: AtomicU32::new(1),
        };

        let first = remote.states().recv_timeout(remote.config.connect_timeout());
        if first.is_none() {
            return Err(RemoteError::Timeout("the first state message"));
        }
        info!("Connected to pendule at {}", remote.state_addr);
        Ok(remote)
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    /// 最近一次收到的状态
    pub fn state(&self) -> Result<StateMessage, RemoteError> {
        self.mailbox.latest().ok_or(RemoteError::NoState)
    }

    /// 状态订阅（与 `state()` 共享同一个插槽）
    pub fn states(&self) -> StateSubscriber {
        StateSubscriber::new(self.mailbox.clone())
    }

    fn calibrated_state(&self) -> Result<StateMessage, RemoteError> {
        let state = self.state()?;
        if !state.calibrated {
            return Err(PenduleError::NotCalibrated.into());
        }
        Ok(state)
    }

    pub fn position(&self) -> Result<f64, RemoteError> {
        Ok(self.calibrated_state()?.position)
    }

    pub fn angle(&self) -> Result<f64, RemoteError> {
        Ok(self.calibrated_state()?.angle)
    }

    pub fn is_calibrated(&self) -> bool {
        self.mailbox.latest().map(|s| s.calibrated).unwrap_or(false)
    }

    pub fn is_emergency_stopped(&self) -> bool {
        self.mailbox.latest().map(|s| s.emergency_stopped).unwrap_or(false)
    }

    fn next_seq(&self) -> u32 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    pub fn drive(&self, power: f64) -> Result<(), RemoteError> {
        let request = CommandRequest::drive(self.next_seq(), power);
        self.send(if self.config.wait { request } else { request.without_reply() })
    }

    pub fn calibrate(&self) -> Result<(), RemoteError> {
        let request = CommandRequest::simple(self.next_seq(), CommandOp::Calibrate);
        self.send(if self.config.wait { request } else { request.without_reply() })
    }

    pub fn emergency_stop(&self) -> Result<(), RemoteError> {
        let request = CommandRequest::simple(self.next_seq(), CommandOp::EmergencyStop);
        self.send_on(&self.emergency, request)
    }

    pub fn reset(&self) -> Result<(), RemoteError> {
        self.send(CommandRequest::simple(self.next_seq(), CommandOp::Reset))
    }

    fn open_command(&self) -> Result<TcpStream, RemoteError> {
        let stream = TcpStream::connect_timeout(&self.command_addr, self.config.connect_timeout())?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(self.config.response_timeout()))?;
        debug!("Command connection to {} opened", self.command_addr);
        Ok(stream)
    }

    /// 发送命令；等待响应时按序号匹配
    fn send(&self, request: CommandRequest) -> Result<(), RemoteError> {
        self.send_on(&self.command, request)
    }

    fn send_on(
        &self,
        connection: &Mutex<Option<TcpStream>>,
        request: CommandRequest,
    ) -> Result<(), RemoteError> {
        let mut slot = connection.lock();
        let mut stream = match slot.take() {
            Some(stream) => stream,
            None => self.open_command()?,
        };

        let result = exchange(&mut stream, &request);
        match &result {
            Err(e) if !e.is_application() => {
                debug!("Dropping command connection after error: {}", e);
            },
            _ => *slot = Some(stream),
        }
        result
    }
}

fn exchange(stream: &mut TcpStream, request: &CommandRequest) -> Result<(), RemoteError> {
    let mut frame = [0u8; COMMAND_MESSAGE_LEN];
    stream.write_all(encode_command(request, &mut frame))?;
    if request.no_reply {
        return Ok(());
    }

    let mut buf = [0u8; MAX_FRAME_LEN];
    let response = match read_message(stream, &mut buf) {
        Ok(Some(Message::CommandResponse(response))) => response,
        Ok(Some(other)) => {
            return Err(RemoteError::Connection(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("expected a command response, got {:?}", other.message_type()),
            )));
        },
        Ok(None) => {
            return Err(RemoteError::Connection(std::io::ErrorKind::UnexpectedEof.into()));
        },
        Err(RemoteError::Connection(e)) if is_timeout(&e) => {
            return Err(RemoteError::Timeout("the command response"));
        },
        Err(e) => return Err(e),
    };

    if response.seq != request.seq {
        return Err(RemoteError::Connection(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("response seq {} does not match request {}", response.seq, request.seq),
        )));
    }
    if response.ok {
        return Ok(());
    }
    match response.error_kind {
        Some(kind) => Err(PenduleError::from_remote(kind, response.message).into()),
        None => Err(PenduleError::InvalidCommand(response.message).into()),
    }
}

impl Drop for RemotePendule {
    fn drop(&mut self) {
        let mut buf = [0u8; HEADER_LEN];
        let _ = self.socket.send_to(encode_unsubscribe(0, &mut buf), self.state_addr);
        self.running.store(false, Ordering::Release);
        if let Some(receiver) = self.receiver.take() {
            let _ = receiver.join();
        }
        self.mailbox.close();
        debug!("Disconnected from {}", self.state_addr);
    }
}

impl std::fmt::Debug for RemotePendule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemotePendule")
            .field("state_addr", &self.state_addr)
            .field("command_addr", &self.command_addr)
            .field("wait", &self.config.wait)
            .finish()
    }
}

fn receive_loop(
    socket: UdpSocket,
    server: SocketAddr,
    renew: Duration,
    mailbox: Arc<Mailbox>,
    running: Arc<AtomicBool>,
) {
    let mut subscribe = [0u8; HEADER_LEN];
    let mut buf = [0u8; MAX_FRAME_LEN];
    let mut seq = 0u32;
    let mut last_renew: Option<Instant> = None;

    while running.load(Ordering::Acquire) {
        if last_renew.is_none_or(|at| at.elapsed() >= renew) {
            seq = seq.wrapping_add(1);
            if let Err(e) = socket.send_to(encode_subscribe(seq, &mut subscribe), server) {
                warn!("Cannot subscribe to {}: {}", server, e);
            }
            last_renew = Some(Instant::now());
        }

        match socket.recv_from(&mut buf) {
            Ok((len, from)) if from == server => match decode_message(&buf[..len]) {
                Ok(Message::State(state)) => mailbox.post(state),
                Ok(other) => trace!("Ignoring {:?} from the server", other.message_type()),
                Err(e) => debug!("Malformed state datagram: {}", e),
            },
            Ok((_, from)) => trace!("Ignoring datagram from {}", from),
            Err(e) if is_timeout(&e) => {},
            Err(e) => {
                trace!("State receive error: {}", e);
                thread::sleep(POLL_INTERVAL);
            },
        }
    }
}

impl PenduleControl for RemotePendule {
    type Error = RemoteError;

    fn position(&self) -> Result<f64, RemoteError> {
        RemotePendule::position(self)
    }

    fn angle(&self) -> Result<f64, RemoteError> {
        RemotePendule::angle(self)
    }

    fn drive(&self, power: f64) -> Result<(), RemoteError> {
        RemotePendule::drive(self, power)
    }

    fn calibrate(&self) -> Result<(), RemoteError> {
        RemotePendule::calibrate(self)
    }

    fn emergency_stop(&self) -> Result<(), RemoteError> {
        RemotePendule::emergency_stop(self)
    }

    fn reset(&self) -> Result<(), RemoteError> {
        RemotePendule::reset(self)
    }

    fn is_calibrated(&self) -> bool {
        RemotePendule::is_calibrated(self)
    }
}
