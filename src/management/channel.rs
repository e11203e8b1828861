//! Control conversation with the engine over its management socket
//!
//! [`ManagementChannel`] owns the socket and the reader side: it parses
//! every line, answers credential and tunnel requests, and forwards state,
//! traffic and log reports to the session's [`StatusSink`]. Everything else
//! talks to the engine through a cloneable [`ManagementHandle`], whose
//! methods are synchronous and only queue lines for the writer task.
//!
//! [`StatusSink`]: crate::session::StatusSink

use super::command::{ManagementCommand, ProtocolError};
use super::transport::FdStream;
use crate::device::PauseControl;
use crate::profile::escape;
use crate::session::credentials::KIND_AUTH;
use crate::session::{PauseReason, SessionContext, StateUpdate, TunnelBuilder};
use std::collections::{HashSet, VecDeque};
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const BIND_TRIES: u32 = 8;
const BIND_BACKOFF: Duration = Duration::from_millis(300);
/// Releases closer together than this are deferred
const RELEASE_DEBOUNCE: Duration = Duration::from_secs(5);
const RELEASE_DEFER: Duration = Duration::from_secs(3);
/// Longest line accepted from the engine
const MAX_LINE_LEN: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum ManagementError {
    #[error("Failed to bind management socket {path}: {source}")]
    Bind {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("Management socket error: {0}")]
    Io(#[from] io::Error),
    #[error("Management channel is not listening")]
    NotListening,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelPhase {
    Listening,
    Connected,
    ShuttingDown,
    Closed,
}

/// A line queued for the engine, possibly carrying a descriptor
#[derive(Debug)]
pub(crate) enum Outbound {
    Line(String),
    WithFd(String, OwnedFd),
}

pub struct ChannelOptions {
    /// Server the engine connects to, used for proxy lookups and logs
    pub server: String,
    /// Seconds between `BYTECOUNT` reports
    pub bytecount_interval: u64,
    /// Whether the device monitor wants the session running
    pub should_run: Arc<AtomicBool>,
}

struct ChannelState {
    phase: ChannelPhase,
    writer: Option<mpsc::UnboundedSender<Outbound>>,
    waiting_for_release: bool,
    last_pause_reason: PauseReason,
    last_hold_release: Option<Instant>,
    hold_timer: Option<JoinHandle<()>>,
    /// Bumped whenever a hold timer is armed or cancelled
    timer_generation: u64,
}

/// What a hold timer does when it fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HoldTimer {
    /// The engine's requested wait is over
    WaitElapsed,
    /// A debounced release is due
    DeferredRelease,
}

struct Shared {
    state: Mutex<ChannelState>,
    context: SessionContext,
    should_run: Arc<AtomicBool>,
    bytecount_interval: u64,
}

/// Thread-safe entry points into a running channel
#[derive(Clone)]
pub struct ManagementHandle {
    shared: Arc<Shared>,
}

impl ManagementHandle {
    fn new(context: SessionContext, options: &ChannelOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(ChannelState {
                    phase: ChannelPhase::Listening,
                    writer: None,
                    waiting_for_release: false,
                    last_pause_reason: PauseReason::NoNetwork,
                    last_hold_release: None,
                    hold_timer: None,
                    timer_generation: 0,
                }),
                context,
                should_run: Arc::clone(&options.should_run),
                bytecount_interval: options.bytecount_interval,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn should_run(&self) -> bool {
        self.shared.should_run.load(Ordering::SeqCst)
    }

    pub fn phase(&self) -> ChannelPhase {
        self.lock().phase
    }

    pub fn is_waiting_for_release(&self) -> bool {
        self.lock().waiting_for_release
    }

    /// Queue one line for the engine. False when no engine is connected.
    pub fn command(&self, text: &str) -> bool {
        let state = self.lock();
        Self::send_locked(&state, Outbound::Line(with_newline(text)))
    }

    fn send_with_fd(&self, text: &str, fd: OwnedFd) -> bool {
        let state = self.lock();
        Self::send_locked(&state, Outbound::WithFd(with_newline(text), fd))
    }

    fn send_locked(state: &ChannelState, line: Outbound) -> bool {
        match &state.writer {
            Some(writer) => writer.send(line).is_ok(),
            None => {
                debug!("Management channel not connected, dropping command");
                false
            }
        }
    }

    /// Ask the engine to drop the connection and wait in hold
    pub fn pause(&self, reason: PauseReason) {
        let update = {
            let mut state = self.lock();
            state.last_pause_reason = reason;
            Self::signal_usr1(&mut state)
        };
        self.report(update);
    }

    pub fn resume(&self) {
        {
            let mut state = self.lock();
            self.release_hold(&mut state);
            state.last_pause_reason = PauseReason::NoNetwork;
        }
    }

    /// Drop the current connection and connect again straight away
    pub fn reconnect(&self) {
        let mut state = self.lock();
        if state.waiting_for_release {
            self.release_hold_now(&mut state);
        } else {
            Self::cancel_timer(&mut state);
            Self::send_locked(&state, Outbound::Line("signal SIGUSR1\n".to_string()));
        }
    }

    /// The host network changed. A held engine is released; a running one
    /// is told to re-check its connection.
    pub fn network_change(&self, same_network: bool) {
        let mut state = self.lock();
        if state.waiting_for_release {
            self.release_hold(&mut state);
        } else {
            if same_network {
                debug!("Network unchanged, asking engine to refresh its sockets");
            }
            Self::send_locked(&state, Outbound::Line("network-change\n".to_string()));
        }
    }

    /// Ask the engine to exit. True when the request was sent.
    pub fn stop(&self) -> bool {
        let mut state = self.lock();
        let sent = Self::send_locked(&state, Outbound::Line("signal SIGINT\n".to_string()));
        if sent {
            state.phase = ChannelPhase::ShuttingDown;
        }
        sent
    }

    fn is_shutting_down(&self) -> bool {
        matches!(
            self.lock().phase,
            ChannelPhase::ShuttingDown | ChannelPhase::Closed
        )
    }

    fn signal_usr1(state: &mut ChannelState) -> Option<StateUpdate> {
        Self::cancel_timer(state);
        if state.waiting_for_release {
            Some(StateUpdate::paused(state.last_pause_reason))
        } else {
            Self::send_locked(state, Outbound::Line("signal SIGUSR1\n".to_string()));
            None
        }
    }

    fn report(&self, update: Option<StateUpdate>) {
        if let Some(update) = update {
            self.shared.context.status.state(update);
        }
    }

    fn release_hold(&self, state: &mut ChannelState) {
        if state.waiting_for_release {
            self.release_hold_now(state);
        }
    }

    fn release_hold_now(&self, state: &mut ChannelState) {
        Self::cancel_timer(state);
        let recent = state
            .last_hold_release
            .is_some_and(|last| last.elapsed() < RELEASE_DEBOUNCE);
        if recent {
            debug!("Hold released recently, deferring release by {:?}", RELEASE_DEFER);
            if self.arm_timer(state, RELEASE_DEFER, HoldTimer::DeferredRelease) {
                return;
            }
        }
        self.finish_release(state);
    }

    fn finish_release(&self, state: &mut ChannelState) {
        state.waiting_for_release = false;
        state.last_hold_release = Some(Instant::now());
        Self::send_locked(state, Outbound::Line("hold release\n".to_string()));
        Self::send_locked(
            state,
            Outbound::Line(format!("bytecount {}\n", self.shared.bytecount_interval)),
        );
        Self::send_locked(state, Outbound::Line("state on\n".to_string()));
    }

    fn cancel_timer(state: &mut ChannelState) {
        state.timer_generation = state.timer_generation.wrapping_add(1);
        if let Some(timer) = state.hold_timer.take() {
            timer.abort();
        }
    }

    /// Schedule `timer` after `delay`, replacing any armed one. False
    /// outside a tokio runtime.
    fn arm_timer(&self, state: &mut ChannelState, delay: Duration, timer: HoldTimer) -> bool {
        Self::cancel_timer(state);
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                debug!("No runtime for delayed hold release, releasing now");
                return false;
            }
        };
        let generation = state.timer_generation;
        let handle = self.clone();
        state.hold_timer = Some(runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            handle.fire_timer(generation, timer);
        }));
        true
    }

    /// A timer from an older generation was superseded and does nothing
    fn fire_timer(&self, generation: u64, timer: HoldTimer) {
        let mut state = self.lock();
        if state.timer_generation != generation {
            debug!("Ignoring superseded {:?} timer", timer);
            return;
        }
        state.hold_timer = None;
        match timer {
            HoldTimer::WaitElapsed => {
                if self.should_run() {
                    self.release_hold_now(&mut state);
                }
            }
            HoldTimer::DeferredRelease => self.finish_release(&mut state),
        }
    }

    fn on_hold(&self, wait_seconds: u64) {
        let update = {
            let mut state = self.lock();
            state.waiting_for_release = true;
            if self.should_run() {
                if !self.arm_timer(&mut state, Duration::from_secs(wait_seconds), HoldTimer::WaitElapsed) {
                    self.release_hold_now(&mut state);
                }
                if wait_seconds > 5 {
                    info!("Waiting {} seconds before reconnecting", wait_seconds);
                } else {
                    debug!("Waiting {} seconds before reconnecting", wait_seconds);
                }
                (wait_seconds > 1)
                    .then(|| StateUpdate::from_engine("CONNECTRETRY", &wait_seconds.to_string()))
            } else {
                Some(StateUpdate::paused(state.last_pause_reason))
            }
        };
        self.report(update);
    }

    fn connect_writer(&self) -> mpsc::UnboundedReceiver<Outbound> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        state.writer = Some(tx);
        state.phase = ChannelPhase::Connected;
        rx
    }

    fn close(&self) {
        let mut state = self.lock();
        state.phase = ChannelPhase::Closed;
        state.writer = None;
        Self::cancel_timer(&mut state);
    }
}

impl PauseControl for ManagementHandle {
    fn pause(&self, reason: PauseReason) {
        ManagementHandle::pause(self, reason);
    }

    fn resume(&self) {
        ManagementHandle::resume(self);
    }

    fn reconnect(&self) {
        ManagementHandle::reconnect(self);
    }

    fn network_change(&self, same_network: bool) {
        ManagementHandle::network_change(self, same_network);
    }
}

fn oversized_line(len: usize) -> ProtocolError {
    ProtocolError::Malformed {
        command: "oversized",
        line: format!("{} bytes without a line break", len),
    }
}

fn with_newline(text: &str) -> String {
    let mut line = text.to_string();
    if !line.ends_with('\n') {
        line.push('\n');
    }
    line
}

/// Reader side of one engine's management socket
pub struct ManagementChannel {
    listener: Option<UnixListener>,
    path: PathBuf,
    handle: ManagementHandle,
    context: SessionContext,
    server: String,
    builder: TunnelBuilder,
    pending: Vec<u8>,
    /// Dropping input up to the next newline after an oversized line
    discarding: bool,
    received_fds: VecDeque<OwnedFd>,
    input_requested: HashSet<String>,
}

impl ManagementChannel {
    fn new(path: &Path, context: SessionContext, options: ChannelOptions) -> Self {
        Self {
            listener: None,
            path: path.to_path_buf(),
            handle: ManagementHandle::new(context.clone(), &options),
            builder: TunnelBuilder::new(&options.server),
            server: options.server,
            context,
            pending: Vec::new(),
            discarding: false,
            received_fds: VecDeque::new(),
            input_requested: HashSet::new(),
        }
    }

    /// Bind the listening socket the engine will connect to
    pub async fn open(
        path: &Path,
        context: SessionContext,
        options: ChannelOptions,
    ) -> Result<Self, ManagementError> {
        match std::fs::remove_file(path) {
            Ok(()) => debug!("Removed stale management socket {}", path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => debug!("Could not remove {}: {}", path.display(), e),
        }

        let mut tries = BIND_TRIES;
        let listener = loop {
            match UnixListener::bind(path) {
                Ok(listener) => break listener,
                Err(e) => {
                    tries -= 1;
                    if tries == 0 {
                        return Err(ManagementError::Bind {
                            path: path.display().to_string(),
                            source: e,
                        });
                    }
                    debug!("Bind of {} failed ({}), retrying", path.display(), e);
                    tokio::time::sleep(BIND_BACKOFF).await;
                }
            }
        };
        debug!("Management socket listening on {}", path.display());

        let mut channel = Self::new(path, context, options);
        channel.listener = Some(listener);
        Ok(channel)
    }

    pub fn handle(&self) -> ManagementHandle {
        self.handle.clone()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serve one engine connection until it closes
    pub async fn run(mut self) -> Result<(), ManagementError> {
        let listener = self.listener.take().ok_or(ManagementError::NotListening)?;
        let (stream, _) = listener.accept().await?;
        drop(listener);
        if let Err(e) = std::fs::remove_file(&self.path) {
            debug!("Could not remove {}: {}", self.path.display(), e);
        }
        info!("Engine connected to management interface");

        let stream = Arc::new(FdStream::new(stream));
        let writer = tokio::spawn(write_loop(Arc::clone(&stream), self.handle.connect_writer()));

        let result = self.read_loop(&stream).await;
        self.handle.close();
        if let Err(e) = writer.await {
            debug!("Management writer ended abnormally: {}", e);
        }
        match &result {
            Ok(()) => info!("Management connection closed"),
            Err(e) => error!("{}", e),
        }
        result
    }

    async fn read_loop(&mut self, stream: &FdStream) -> Result<(), ManagementError> {
        let mut buffer = [0u8; 2048];
        loop {
            let (n, fds) = match stream.recv(&mut buffer).await {
                Ok(received) => received,
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                    debug!("Engine reset the management connection");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };
            if n == 0 {
                return Ok(());
            }
            self.received_fds.extend(fds);
            self.feed(&buffer[..n]);
        }
    }

    /// Buffer raw input and process every complete line
    fn feed(&mut self, data: &[u8]) {
        self.pending.extend_from_slice(data);
        while let Some(end) = self.pending.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=end).collect();
            if std::mem::take(&mut self.discarding) {
                continue;
            }
            if end > MAX_LINE_LEN {
                warn!("{}", oversized_line(end));
                continue;
            }
            let text = String::from_utf8_lossy(&raw[..end]);
            let line = text.strip_suffix('\r').unwrap_or(&text);
            self.process_line(line);
        }
        if self.pending.len() > MAX_LINE_LEN {
            if !self.discarding {
                warn!("{}", oversized_line(self.pending.len()));
            }
            self.pending.clear();
            self.discarding = true;
        }
    }

    fn process_line(&mut self, line: &str) {
        let command = match ManagementCommand::parse(line) {
            Ok(command) => command,
            Err(e) => {
                warn!("{}", e);
                return;
            }
        };
        let status = &self.context.status;

        match command {
            ManagementCommand::Info(_) => {}
            ManagementCommand::PasswordRequest { kind } => self.answer_password(&kind),
            ManagementCommand::PasswordVerifyFailed { kind, detail } => {
                status.state(StateUpdate::from_engine(
                    "AUTH_FAILED",
                    &format!("{}{}", kind, detail),
                ));
            }
            ManagementCommand::Hold { wait_seconds } => self.handle.on_hold(wait_seconds),
            ManagementCommand::NeedOk { kind, arg } => self.answer_need_ok(&kind, &arg),
            ManagementCommand::ByteCount {
                bytes_in,
                bytes_out,
            } => status.byte_count(bytes_in, bytes_out),
            ManagementCommand::State { name, detail } => {
                if !self.handle.is_shutting_down() {
                    status.state(StateUpdate::from_engine(&name, &detail));
                }
            }
            ManagementCommand::ProxyQuery { proto_hint } => {
                self.answer_proxy(proto_hint.as_deref())
            }
            ManagementCommand::LogLine {
                level,
                verbosity,
                text,
            } => status.log(level, verbosity, &text),
            ManagementCommand::RsaSignRequest { data } => self.answer_sign(&data),
            ManagementCommand::Success(_) => {}
            ManagementCommand::Error(message) => warn!("Engine rejected command: {}", message),
            ManagementCommand::ProtectFd => self.protect_next_fd(),
            ManagementCommand::Unrecognized(line) => {
                warn!("Unrecognized line from management interface: {}", line)
            }
        }
    }

    fn answer_password(&mut self, kind: &str) {
        let credentials = &self.context.credentials;
        if kind == KIND_AUTH {
            let username = credentials.username().unwrap_or_default();
            self.handle
                .command(&format!("username '{}' {}", kind, escape(&username)));
        }
        match credentials.password(kind) {
            Some(password) => {
                self.handle
                    .command(&format!("password '{}' {}", kind, escape(&password)));
            }
            None => {
                if self.input_requested.insert(kind.to_string()) {
                    self.context.status.need_user_input(kind);
                }
                warn!(
                    "Engine requires authentication type '{}' but no password is available",
                    kind
                );
            }
        }
    }

    fn answer_need_ok(&mut self, kind: &str, arg: &str) {
        let mut status = "ok";
        match kind {
            "PROTECTFD" => self.protect_next_fd(),
            "DNSSERVER" | "DNS6SERVER" => self.builder.add_dns(arg),
            "DNSDOMAIN" => self.builder.set_domain(arg),
            "ROUTE" => {
                let parts: Vec<&str> = arg.split_whitespace().collect();
                let result = match parts.as_slice() {
                    [network, netmask, gateway, "dev", device, ..] => {
                        self.builder.add_route(network, netmask, gateway, Some(*device))
                    }
                    [network, netmask, gateway, ..] => {
                        self.builder.add_route(network, netmask, gateway, None)
                    }
                    _ => {
                        error!("Unrecognized ROUTE request: {}", arg);
                        Ok(())
                    }
                };
                if let Err(e) = result {
                    warn!("Skipping route: {}", e);
                }
            }
            "ROUTE6" => {
                let mut parts = arg.split_whitespace();
                let network = parts.next().unwrap_or_default();
                if let Err(e) = self.builder.add_route_v6(network, parts.next()) {
                    warn!("Skipping route: {}", e);
                }
            }
            "IFCONFIG" => {
                let parts: Vec<&str> = arg.split_whitespace().collect();
                match parts.as_slice() {
                    [local, netmask, mtu, mode, ..] => match mtu.parse::<u32>() {
                        Ok(mtu) => {
                            if let Err(e) = self.builder.set_local_ip(local, netmask, mtu, mode) {
                                error!("Invalid tunnel address: {}", e);
                            }
                        }
                        Err(_) => error!("Invalid MTU in IFCONFIG request: {}", arg),
                    },
                    _ => error!("Unrecognized IFCONFIG request: {}", arg),
                }
            }
            "IFCONFIG6" => {
                if let Err(e) = self.builder.set_local_ipv6(arg) {
                    error!("Invalid tunnel address: {}", e);
                }
            }
            "PERSIST_TUN_ACTION" => status = self.builder.reopen_status(),
            "OPENTUN" => {
                if self.send_tunnel(kind, arg) {
                    return;
                }
                status = "cancel";
            }
            _ => {
                error!("Unknown NEED-OK request: {}", kind);
                return;
            }
        }
        self.handle.command(&format!("needok '{}' {}", kind, status));
    }

    /// Open the tunnel and pass its descriptor with the `needok` reply
    fn send_tunnel(&mut self, kind: &str, device_type: &str) -> bool {
        if device_type != "tun" {
            error!(
                "Device type {} requested, but only tun is supported",
                device_type
            );
            return false;
        }
        let Some(config) = self.builder.establish() else {
            return false;
        };
        match self.context.platform.open_tunnel(&config) {
            Ok(fd) => {
                debug!("Passing tunnel descriptor {} to engine", fd.as_raw_fd());
                self.handle
                    .send_with_fd(&format!("needok '{}' ok", kind), fd)
            }
            Err(e) => {
                error!("{}", e);
                false
            }
        }
    }

    fn protect_next_fd(&mut self) {
        match self.received_fds.pop_front() {
            Some(fd) => {
                if !self.context.platform.protect(fd) {
                    warn!("Could not protect VPN socket");
                }
            }
            None => warn!("Engine asked to protect a socket but sent no descriptor"),
        }
    }

    fn answer_proxy(&mut self, proto_hint: Option<&str>) {
        let proxy = if proto_hint == Some("UDP") {
            None
        } else {
            self.context.proxy.resolve(&self.server)
        };
        match proxy {
            Some((host, port)) => {
                info!("Using proxy {} {}", host, port);
                self.handle.command(&format!("proxy HTTP {} {}", host, port));
            }
            None => {
                self.handle.command("proxy NONE");
            }
        }
    }

    fn answer_sign(&mut self, data: &str) {
        match self.context.credentials.sign(data) {
            Ok(signature) => {
                self.handle.command("rsa-sig");
                self.handle.command(&signature);
                self.handle.command("END");
            }
            Err(e) => {
                error!("Signing failed: {}", e);
                self.handle.command("rsa-sig");
                self.handle.command("");
                self.handle.command("END");
                self.handle.stop();
            }
        }
    }
}

/// Sole writer of the socket
async fn write_loop(stream: Arc<FdStream>, mut rx: mpsc::UnboundedReceiver<Outbound>) {
    while let Some(line) = rx.recv().await {
        let result = match &line {
            Outbound::Line(text) => stream.send(text.as_bytes(), &[]).await,
            Outbound::WithFd(text, fd) => stream.send(text.as_bytes(), &[fd.as_raw_fd()]).await,
        };
        if let Err(e) = result {
            debug!("Management write failed: {}", e);
            break;
        }
    }
}
