//! 倒立摆服务端
//!
//! 线程模型：
//!
//! - `state-publisher`：GPIO 周期任务，发布状态
//! - `state-subscriptions`：接收 UDP 订阅/退订
//! - `command-accept`：接受 TCP 命令连接
//! - `command-<peer>`：每个命令连接一个线程，共享同一个 [`CommandHandler`]
//! - `command-watchdog`：GPIO 周期任务，驱动命令超时置零

use parking_lot::Mutex;
use pendule_driver::{Pendule, PenduleError};
use pendule_gpio::PeriodicHandle;
use pendule_protocol::{Message, encode_command_response};
use std::io::Write;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::command::CommandHandler;
use crate::config::ServerConfig;
use crate::mailbox::StateSubscriber;
use crate::publisher::StatePublisher;
use crate::transport::{MAX_FRAME_LEN, is_timeout, read_message};
use crate::RemoteError;

/// 接受循环检查退出标志的间隔
const ACCEPT_POLL: Duration = Duration::from_millis(20);

struct Connection {
    stream: TcpStream,
    thread: JoinHandle<()>,
}

/// 倒立摆服务端
///
/// Drop 时停止所有线程；`Pendule` 本身由调用方继续持有。
pub struct PenduleServer {
    handler: Arc<CommandHandler>,
    publisher: StatePublisher,
    watchdog: Option<Arc<PeriodicHandle>>,
    running: Arc<AtomicBool>,
    acceptor: Option<JoinHandle<()>>,
    connections: Arc<Mutex<Vec<Connection>>>,
    command_addr: SocketAddr,
}

impl PenduleServer {
    /// 绑定端口并启动所有服务线程
    pub fn start(pendule: Arc<Pendule>, config: &ServerConfig) -> Result<Self, RemoteError> {
        config.validate()?;
        let socket = UdpSocket::bind((config.host.as_str(), config.state_port))?;
        let listener = TcpListener::bind((config.host.as_str(), config.command_port))?;
        listener.set_nonblocking(true)?;
        let command_addr = listener.local_addr()?;

        let publisher = StatePublisher::start(&pendule, socket, config)?;
        let handler = Arc::new(CommandHandler::new(pendule.clone(), config.command_watchdog()));

        let watchdog = match config.command_watchdog() {
            Some(timeout) => {
                let weak = Arc::downgrade(&handler);
                let period = (timeout / 4).max(Duration::from_millis(10));
                let handle = pendule
                    .connection()
                    .register_periodic("command-watchdog", period, move || {
                        if let Some(handler) = weak.upgrade() {
                            handler.watchdog_tick(Instant::now());
                        }
                    })
                    .map_err(PenduleError::from)?;
                Some(handle)
            },
            None => None,
        };

        let running = Arc::new(AtomicBool::new(true));
        let connections = Arc::new(Mutex::new(Vec::new()));
        let acceptor = {
            let handler = handler.clone();
            let running = running.clone();
            let connections = connections.clone();
            thread::Builder::new()
                .name("command-accept".into())
                .spawn(move || accept_loop(listener, handler, running, connections))?
        };

        info!("Command server on tcp://{}", command_addr);
        Ok(Self {
            handler,
            publisher,
            watchdog,
            running,
            acceptor: Some(acceptor),
            connections,
            command_addr,
        })
    }

    pub fn state_addr(&self) -> SocketAddr {
        self.publisher.local_addr()
    }

    pub fn command_addr(&self) -> SocketAddr {
        self.command_addr
    }

    pub fn pendule(&self) -> &Arc<Pendule> {
        self.handler.pendule()
    }

    pub fn handler(&self) -> &Arc<CommandHandler> {
        &self.handler
    }

    pub fn publisher(&self) -> &StatePublisher {
        &self.publisher
    }

    /// 本地状态订阅
    pub fn subscribe(&self) -> StateSubscriber {
        self.publisher.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// 停止服务（幂等）
    ///
    /// 正在执行的命令（例如标定）会先执行完。
    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.cancel();
        }
        if let Some(acceptor) = self.acceptor.take() {
            let _ = acceptor.join();
        }
        let connections: Vec<Connection> = self.connections.lock().drain(..).collect();
        for connection in connections {
            let _ = connection.stream.shutdown(Shutdown::Both);
            let _ = connection.thread.join();
        }
        self.publisher.stop();
        info!("Server stopped");
    }
}

impl Drop for PenduleServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(
    listener: TcpListener,
    handler: Arc<CommandHandler>,
    running: Arc<AtomicBool>,
    connections: Arc<Mutex<Vec<Connection>>>,
) {
    while running.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(e) = spawn_connection(stream, peer, &handler, &connections) {
                    warn!("Cannot serve command client {}: {}", peer, e);
                }
            },
            Err(e) if is_timeout(&e) => thread::sleep(ACCEPT_POLL),
            Err(e) => {
                warn!("Command accept error: {}", e);
                thread::sleep(Duration::from_millis(100));
            },
        }
    }
    debug!("Accept loop exited");
}

fn spawn_connection(
    stream: TcpStream,
    peer: SocketAddr,
    handler: &Arc<CommandHandler>,
    connections: &Mutex<Vec<Connection>>,
) -> std::io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    let tracked = stream.try_clone()?;
    let handler = handler.clone();
    let thread = thread::Builder::new()
        .name(format!("command-{}", peer))
        .spawn(move || serve_connection(stream, peer, handler))?;

    let mut connections = connections.lock();
    connections.retain(|c| !c.thread.is_finished());
    connections.push(Connection {
        stream: tracked,
        thread,
    });
    Ok(())
}

fn serve_connection(mut stream: TcpStream, peer: SocketAddr, handler: Arc<CommandHandler>) {
    info!("Command client {} connected", peer);
    let mut buf = [0u8; MAX_FRAME_LEN];
    let mut out = [0u8; 256];
    loop {
        let request = match read_message(&mut stream, &mut buf) {
            Ok(Some(Message::Command(request))) => request,
            Ok(Some(other)) => {
                warn!(
                    "Unexpected {:?} message from {}; closing",
                    other.message_type(),
                    peer
                );
                break;
            },
            Ok(None) => break,
            Err(e) => {
                debug!("Command connection {} closed: {}", peer, e);
                break;
            },
        };

        let response = handler.execute(&request);
        if request.no_reply {
            continue;
        }
        if let Err(e) = stream.write_all(encode_command_response(&response, &mut out)) {
            debug!("Cannot reply to {}: {}", peer, e);
            break;
        }
    }
    info!("Command client {} disconnected", peer);
}
