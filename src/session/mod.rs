//! Session orchestration
//!
//! A [`Session`] owns one profile, one engine process, one management
//! channel and one device monitor. Collaborators are handed in through a
//! [`SessionContext`] so each session (and each test) gets its own.

pub mod credentials;
pub mod engine;
pub mod proxy;
pub mod status;
pub mod tunnel;

pub use credentials::{CredentialProvider, KeyringStore, LayeredCredentials, MemoryCredentials};
pub use engine::Engine;
pub use proxy::{EnvProxy, NoProxy, ProxyResolver};
pub use status::{
    LogLevel, PauseReason, SessionState, StateUpdate, StatusSink, TracingStatus, state_from_engine,
    state_label,
};
pub use tunnel::{TunnelBuilder, TunnelConfig};

use crate::device::{DeviceEvent, DeviceStateMonitor, MonitorOptions};
use crate::management::{ChannelOptions, ManagementChannel, ManagementError};
use crate::platform::TunnelPlatform;
use crate::profile::{EngineOptions, Profile};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Notify, mpsc};
use tracing::{debug, info, warn};

/// How long the engine gets to exit after being asked to
const STOP_GRACE: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Failed to prepare runtime directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to start engine {binary}: {source}")]
    EngineStart {
        binary: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Management(#[from] ManagementError),
}

/// Everything a session reports to or asks of its host
#[derive(Clone)]
pub struct SessionContext {
    pub status: Arc<dyn StatusSink>,
    pub credentials: Arc<dyn CredentialProvider>,
    pub platform: Arc<dyn TunnelPlatform>,
    pub proxy: Arc<dyn ProxyResolver>,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub engine_binary: PathBuf,
    /// Holds the management socket and the rendered engine configuration
    pub runtime_dir: PathBuf,
    pub bytecount_interval: u64,
    pub verbosity: u8,
    pub query_proxy: bool,
    pub monitor: MonitorOptions,
}

/// Control surface for a running session
#[derive(Clone)]
pub struct SessionHandle {
    events: mpsc::UnboundedSender<DeviceEvent>,
    stop: Arc<Notify>,
    replace: Arc<AtomicBool>,
}

impl SessionHandle {
    /// Forward a host event to the device monitor
    pub fn device_event(&self, event: DeviceEvent) -> bool {
        self.events.send(event).is_ok()
    }

    pub fn set_user_pause(&self, pause: bool) -> bool {
        self.device_event(DeviceEvent::UserPause(pause))
    }

    /// Ask for a fresh connection. Ignored while the session is paused.
    pub fn reconnect(&self) -> bool {
        self.device_event(DeviceEvent::Reconnect)
    }

    /// End the session. With `replace_connection` no disconnect is
    /// reported, since another session takes over.
    pub fn stop(&self, replace_connection: bool) {
        self.replace.store(replace_connection, Ordering::SeqCst);
        self.stop.notify_one();
    }
}

pub struct Session {
    profile: Profile,
    context: SessionContext,
    options: SessionOptions,
    events_tx: mpsc::UnboundedSender<DeviceEvent>,
    events_rx: mpsc::UnboundedReceiver<DeviceEvent>,
    stop: Arc<Notify>,
    replace: Arc<AtomicBool>,
}

impl Session {
    pub fn new(profile: Profile, context: SessionContext, options: SessionOptions) -> (Session, SessionHandle) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let stop = Arc::new(Notify::new());
        let replace = Arc::new(AtomicBool::new(false));
        let handle = SessionHandle {
            events: events_tx.clone(),
            stop: Arc::clone(&stop),
            replace: Arc::clone(&replace),
        };
        let session = Session {
            profile,
            context,
            options,
            events_tx,
            events_rx,
            stop,
            replace,
        };
        (session, handle)
    }

    pub fn socket_path(&self) -> PathBuf {
        self.options.runtime_dir.join("management.sock")
    }

    pub fn config_path(&self) -> PathBuf {
        self.options.runtime_dir.join("engine.conf")
    }

    /// Run until the engine exits or the session is stopped
    pub async fn run(self) -> Result<(), SessionError> {
        std::fs::create_dir_all(&self.options.runtime_dir)?;
        let socket = self.socket_path();
        let config_path = self.config_path();
        let Session {
            profile,
            context,
            options,
            events_tx,
            events_rx,
            stop,
            replace,
        } = self;

        let should_run = Arc::new(AtomicBool::new(true));
        let channel_context = SessionContext {
            status: Arc::new(TrafficTap::new(Arc::clone(&context.status), events_tx)),
            ..context.clone()
        };
        let server = profile
            .primary_server()
            .map(str::to_string)
            .unwrap_or_else(|| profile.name.clone());
        let channel = ManagementChannel::open(
            &socket,
            channel_context,
            ChannelOptions {
                server,
                bytecount_interval: options.bytecount_interval,
                should_run: Arc::clone(&should_run),
            },
        )
        .await?;
        let management = channel.handle();
        let monitor = DeviceStateMonitor::with_gate(
            Arc::new(management.clone()),
            options.monitor.clone(),
            should_run,
        );

        let engine_config = profile.engine_config(&EngineOptions {
            management_socket: socket.clone(),
            query_proxy: options.query_proxy,
            verbosity: options.verbosity,
        });
        write_private(&config_path, &engine_config)?;

        let mut engine = Engine::spawn(&options.engine_binary, &config_path, Arc::clone(&context.status))
            .map_err(|source| {
                remove_runtime_files(&[config_path.as_path(), socket.as_path()]);
                SessionError::EngineStart {
                    binary: options.engine_binary.display().to_string(),
                    source,
                }
            })?;
        info!("Session '{}' started", profile.name);

        let mut channel_task = tokio::spawn(channel.run());
        let monitor_task = tokio::spawn(monitor.run(events_rx));

        let mut channel_result = None;
        tokio::select! {
            result = &mut channel_task => {
                channel_result = Some(result);
                if let Err(e) = engine.stop(STOP_GRACE).await {
                    warn!("Failed to stop engine: {}", e);
                }
            }
            status = engine.wait() => {
                match status {
                    Ok(status) => info!("Engine exited with {}", status),
                    Err(e) => warn!("Failed to wait for engine: {}", e),
                }
                channel_task.abort();
            }
            _ = stop.notified() => {
                info!("Stopping session '{}'", profile.name);
                if !management.stop() {
                    debug!("Engine not connected, nothing to signal");
                }
                match tokio::time::timeout(STOP_GRACE, &mut channel_task).await {
                    Ok(result) => channel_result = Some(result),
                    Err(_) => channel_task.abort(),
                }
                if let Err(e) = engine.stop(Duration::ZERO).await {
                    warn!("Failed to stop engine: {}", e);
                }
            }
        }
        monitor_task.abort();

        remove_runtime_files(&[config_path.as_path(), socket.as_path()]);

        if !replace.load(Ordering::SeqCst) {
            context.status.state(StateUpdate::from_engine("NOPROCESS", ""));
        }

        match channel_result {
            Some(Ok(result)) => result.map_err(SessionError::from),
            Some(Err(e)) => {
                warn!("Management task failed: {}", e);
                Ok(())
            }
            None => Ok(()),
        }
    }
}

/// The rendered configuration may carry inline keys
fn write_private(path: &Path, content: &str) -> std::io::Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(content.as_bytes())
}

fn remove_runtime_files(paths: &[&Path]) {
    for path in paths {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!("Could not remove {}: {}", path.display(), e);
            }
        }
    }
}

/// Passes reports through and feeds traffic deltas to the device monitor
struct TrafficTap {
    inner: Arc<dyn StatusSink>,
    events: mpsc::UnboundedSender<DeviceEvent>,
    last_totals: Mutex<(u64, u64)>,
}

impl TrafficTap {
    fn new(inner: Arc<dyn StatusSink>, events: mpsc::UnboundedSender<DeviceEvent>) -> Self {
        Self {
            inner,
            events,
            last_totals: Mutex::new((0, 0)),
        }
    }
}

impl StatusSink for TrafficTap {
    fn state(&self, update: StateUpdate) {
        self.inner.state(update);
    }

    fn byte_count(&self, total_in: u64, total_out: u64) {
        let (last_in, last_out) = std::mem::replace(
            &mut *self
                .last_totals
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
            (total_in, total_out),
        );
        // Monitor may already be gone during shutdown
        let _ = self.events.send(DeviceEvent::Traffic {
            delta_in: total_in.saturating_sub(last_in),
            delta_out: total_out.saturating_sub(last_out),
        });
        self.inner.byte_count(total_in, total_out);
    }

    fn log(&self, level: LogLevel, verbosity: u8, text: &str) {
        self.inner.log(level, verbosity, text);
    }

    fn need_user_input(&self, kind: &str) {
        self.inner.need_user_input(kind);
    }
}
