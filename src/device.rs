//! Host state tracking: network, screen and user pause
//!
//! [`DeviceStateMonitor`] folds host events into three sub-states and
//! decides when the tunnel should be paused or resumed. The decision goes
//! to a [`PauseControl`] (the management channel in practice) and is
//! published through a shared flag that the channel consults when the
//! engine asks for a hold release.

use crate::session::PauseReason;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    ShouldBeConnected,
    PendingDisconnect,
    Disconnected,
}

/// A host network as reported by the OS
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInfo {
    /// Interface type, e.g. `wifi` or `ethernet`
    pub kind: String,
    /// Network identity within the type, e.g. an SSID
    pub detail: Option<String>,
    pub connected: bool,
}

impl NetworkInfo {
    fn same_network(&self, other: &NetworkInfo) -> bool {
        self.kind == other.kind && self.detail == other.detail
    }

    fn describe(&self) -> String {
        format!(
            "{} to {} {}",
            if self.connected { "connected" } else { "connecting" },
            self.kind,
            self.detail.as_deref().unwrap_or("")
        )
        .trim_end()
        .to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// Connectivity changed; `None` means no network at all
    Network(Option<NetworkInfo>),
    ScreenOff,
    ScreenOn,
    UserPause(bool),
    /// The user asked for a fresh connection
    Reconnect,
    /// Bytes moved since the previous sample
    Traffic { delta_in: u64, delta_out: u64 },
}

/// Actions the monitor can request
pub trait PauseControl: Send + Sync {
    fn pause(&self, reason: PauseReason);
    fn resume(&self);
    fn reconnect(&self);
    fn network_change(&self, same_network: bool);
}

#[derive(Debug, Clone)]
pub struct MonitorOptions {
    pub pause_on_screen_off: bool,
    pub reconnect_on_network_change: bool,
    /// Debounce before a lost network pauses the tunnel
    pub disconnect_wait: Duration,
    pub traffic_window: Duration,
    /// Below this many bytes per window a dark screen pauses the tunnel
    pub traffic_limit: u64,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            pause_on_screen_off: false,
            reconnect_on_network_change: true,
            disconnect_wait: Duration::from_secs(20),
            traffic_window: Duration::from_secs(60),
            traffic_limit: 64 * 1024,
        }
    }
}

pub struct DeviceStateMonitor {
    control: Arc<dyn PauseControl>,
    options: MonitorOptions,
    network: LinkState,
    screen: LinkState,
    user_pause: LinkState,
    last_network: Option<NetworkInfo>,
    last_description: Option<String>,
    traffic: VecDeque<(Instant, u64)>,
    disconnect_deadline: Option<Instant>,
    should_run: Arc<AtomicBool>,
}

impl DeviceStateMonitor {
    pub fn new(control: Arc<dyn PauseControl>, options: MonitorOptions) -> Self {
        Self::with_gate(control, options, Arc::new(AtomicBool::new(true)))
    }

    /// Publish the aggregate decision through `should_run`
    pub fn with_gate(
        control: Arc<dyn PauseControl>,
        options: MonitorOptions,
        should_run: Arc<AtomicBool>,
    ) -> Self {
        let monitor = Self {
            control,
            options,
            network: LinkState::ShouldBeConnected,
            screen: LinkState::ShouldBeConnected,
            user_pause: LinkState::ShouldBeConnected,
            last_network: None,
            last_description: None,
            traffic: VecDeque::new(),
            disconnect_deadline: None,
            should_run,
        };
        monitor.publish();
        monitor
    }

    /// Shared "should be running" flag
    pub fn gate(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.should_run)
    }

    pub fn should_be_connected(&self) -> bool {
        self.network == LinkState::ShouldBeConnected
            && self.screen == LinkState::ShouldBeConnected
            && self.user_pause == LinkState::ShouldBeConnected
    }

    pub fn pause_reason(&self) -> PauseReason {
        if self.user_pause == LinkState::Disconnected {
            PauseReason::UserPause
        } else if self.screen == LinkState::Disconnected {
            PauseReason::ScreenOff
        } else if self.network == LinkState::Disconnected {
            PauseReason::NoNetwork
        } else {
            PauseReason::UserPause
        }
    }

    pub fn network_state(&self) -> LinkState {
        self.network
    }

    pub fn screen_state(&self) -> LinkState {
        self.screen
    }

    pub fn disconnect_deadline(&self) -> Option<Instant> {
        self.disconnect_deadline
    }

    fn publish(&self) {
        self.should_run
            .store(self.should_be_connected(), Ordering::SeqCst);
    }

    pub fn handle(&mut self, event: DeviceEvent, now: Instant) {
        match event {
            DeviceEvent::Network(info) => self.network_changed(info, now),
            DeviceEvent::ScreenOff => self.screen_off(now),
            DeviceEvent::ScreenOn => self.screen_on(),
            DeviceEvent::UserPause(pause) => self.user_pause(pause),
            DeviceEvent::Reconnect => {
                if self.should_be_connected() {
                    self.control.reconnect();
                } else {
                    info!("Not reconnecting while paused ({:?})", self.pause_reason());
                }
            }
            DeviceEvent::Traffic {
                delta_in,
                delta_out,
            } => self.traffic_sample(delta_in.saturating_add(delta_out), now),
        }
        self.publish();
    }

    fn user_pause(&mut self, pause: bool) {
        if pause {
            self.user_pause = LinkState::Disconnected;
            self.publish();
            self.control.pause(self.pause_reason());
        } else {
            let were_connected = self.should_be_connected();
            self.user_pause = LinkState::ShouldBeConnected;
            self.publish();
            if self.should_be_connected() && !were_connected {
                self.control.resume();
            } else if !self.should_be_connected() {
                // Still paused for another reason; keep the reason current
                self.control.pause(self.pause_reason());
            }
        }
    }

    fn screen_off(&mut self, now: Instant) {
        if !self.options.pause_on_screen_off {
            return;
        }
        self.screen = LinkState::PendingDisconnect;
        // Seed the window so the next sample alone cannot pause us
        self.traffic.push_back((now, self.options.traffic_limit));
        if self.network == LinkState::Disconnected || self.user_pause == LinkState::Disconnected {
            self.screen = LinkState::Disconnected;
        }
    }

    fn screen_on(&mut self) {
        let connected = self.should_be_connected();
        self.screen = LinkState::ShouldBeConnected;
        self.disconnect_deadline = None;
        self.publish();
        if self.should_be_connected() != connected {
            self.control.resume();
        } else if !self.should_be_connected() {
            self.control.pause(self.pause_reason());
        }
    }

    fn traffic_sample(&mut self, bytes: u64, now: Instant) {
        if self.screen != LinkState::PendingDisconnect {
            return;
        }
        self.traffic.push_back((now, bytes));
        if let Some(cutoff) = now.checked_sub(self.options.traffic_window) {
            while self.traffic.front().is_some_and(|(at, _)| *at <= cutoff) {
                self.traffic.pop_front();
            }
        }
        let window: u64 = self.traffic.iter().map(|(_, b)| *b).sum();
        if window < self.options.traffic_limit {
            self.screen = LinkState::Disconnected;
            info!(
                "Less than {} bytes in {} s with the screen off, pausing",
                self.options.traffic_limit,
                self.options.traffic_window.as_secs()
            );
            self.publish();
            self.control.pause(self.pause_reason());
        }
    }

    fn network_changed(&mut self, info: Option<NetworkInfo>, now: Instant) {
        let description = info
            .as_ref()
            .map(NetworkInfo::describe)
            .unwrap_or_else(|| "not connected".to_string());

        match info {
            Some(info) if info.connected => {
                let pending = self.network == LinkState::PendingDisconnect;
                self.network = LinkState::ShouldBeConnected;
                let same = self
                    .last_network
                    .as_ref()
                    .is_some_and(|last| last.same_network(&info));

                if pending && same {
                    self.disconnect_deadline = None;
                    self.publish();
                    // Same network came back, just re-protect the sockets
                    self.control.network_change(true);
                } else {
                    if self.screen == LinkState::PendingDisconnect {
                        self.screen = LinkState::Disconnected;
                    }
                    self.publish();
                    if self.should_be_connected() {
                        self.disconnect_deadline = None;
                        if pending || !same {
                            self.control.network_change(same);
                        } else {
                            self.control.resume();
                        }
                    }
                    self.last_network = Some(info);
                }
            }
            Some(_) => {}
            None => {
                if self.options.reconnect_on_network_change {
                    self.network = LinkState::PendingDisconnect;
                    self.disconnect_deadline = Some(now + self.options.disconnect_wait);
                }
            }
        }

        if self.last_description.as_deref() != Some(description.as_str()) {
            info!("Network status: {}", description);
        }
        debug!(
            "Device state: {}, pause: {:?}, should be connected: {}, network: {:?}",
            description,
            self.pause_reason(),
            self.should_be_connected(),
            self.network
        );
        self.last_description = Some(description);
    }

    /// The disconnect debounce elapsed
    pub fn on_disconnect_timer(&mut self) {
        self.disconnect_deadline = None;
        if self.network != LinkState::PendingDisconnect {
            return;
        }
        self.network = LinkState::Disconnected;
        if self.screen == LinkState::PendingDisconnect {
            self.screen = LinkState::Disconnected;
        }
        self.publish();
        self.control.pause(self.pause_reason());
    }

    /// Consume events until the sender is dropped
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<DeviceEvent>) {
        loop {
            let deadline = self.disconnect_deadline;
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle(event, Instant::now()),
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.on_disconnect_timer();
                }
            }
        }
        debug!("Device monitor stopped");
    }
}

/// Poll `read_network` every `period` and report each change through `send`.
/// The first reading is reported too. Returns once `send` fails.
pub async fn watch_network<P, S>(read_network: P, period: Duration, send: S)
where
    P: Fn() -> Option<NetworkInfo>,
    S: Fn(DeviceEvent) -> bool,
{
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last: Option<Option<NetworkInfo>> = None;
    loop {
        ticker.tick().await;
        let current = read_network();
        if last.as_ref() == Some(&current) {
            continue;
        }
        debug!("Host network now {:?}", current);
        if !send(DeviceEvent::Network(current.clone())) {
            break;
        }
        last = Some(current);
    }
    debug!("Network watcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Pause(PauseReason),
        Resume,
        Reconnect,
        NetworkChange(bool),
    }

    #[derive(Default)]
    struct RecordingControl {
        calls: Mutex<Vec<Call>>,
    }

    impl RecordingControl {
        fn take(&self) -> Vec<Call> {
            std::mem::take(&mut *self.calls.lock().unwrap())
        }
    }

    impl PauseControl for RecordingControl {
        fn pause(&self, reason: PauseReason) {
            self.calls.lock().unwrap().push(Call::Pause(reason));
        }

        fn resume(&self) {
            self.calls.lock().unwrap().push(Call::Resume);
        }

        fn reconnect(&self) {
            self.calls.lock().unwrap().push(Call::Reconnect);
        }

        fn network_change(&self, same_network: bool) {
            self.calls.lock().unwrap().push(Call::NetworkChange(same_network));
        }
    }

    fn monitor(options: MonitorOptions) -> (DeviceStateMonitor, Arc<RecordingControl>) {
        let control = Arc::new(RecordingControl::default());
        (DeviceStateMonitor::new(control.clone(), options), control)
    }

    fn wifi_info(ssid: &str) -> Option<NetworkInfo> {
        Some(NetworkInfo {
            kind: "wifi".to_string(),
            detail: Some(ssid.to_string()),
            connected: true,
        })
    }

    fn wifi(ssid: &str) -> DeviceEvent {
        DeviceEvent::Network(wifi_info(ssid))
    }

    fn screen_options() -> MonitorOptions {
        MonitorOptions {
            pause_on_screen_off: true,
            ..MonitorOptions::default()
        }
    }

    #[test]
    fn test_user_pause_toggle_resumes_once() {
        let (mut m, control) = monitor(MonitorOptions::default());
        let now = Instant::now();
        assert!(m.should_be_connected());
        assert!(m.gate().load(Ordering::SeqCst));

        m.handle(DeviceEvent::UserPause(true), now);
        assert!(!m.should_be_connected());
        assert!(!m.gate().load(Ordering::SeqCst));
        assert_eq!(control.take(), vec![Call::Pause(PauseReason::UserPause)]);

        m.handle(DeviceEvent::UserPause(false), now);
        assert!(m.should_be_connected());
        assert!(m.gate().load(Ordering::SeqCst));
        assert_eq!(control.take(), vec![Call::Resume]);
    }

    #[test]
    fn test_reconnect_only_when_running() {
        let (mut m, control) = monitor(MonitorOptions::default());
        let now = Instant::now();
        m.handle(DeviceEvent::Reconnect, now);
        assert_eq!(control.take(), vec![Call::Reconnect]);

        m.handle(DeviceEvent::UserPause(true), now);
        control.take();
        m.handle(DeviceEvent::Reconnect, now);
        assert!(control.take().is_empty());
    }

    #[tokio::test]
    async fn test_watch_network_reports_changes() {
        let readings = Mutex::new(VecDeque::from(vec![
            wifi_info("home"),
            wifi_info("home"),
            None,
            None,
            wifi_info("office"),
        ]));
        let read_network = || readings.lock().unwrap().pop_front().flatten();
        let seen = Mutex::new(Vec::new());
        let send = |event: DeviceEvent| {
            let mut seen = seen.lock().unwrap();
            seen.push(event);
            seen.len() < 3
        };

        watch_network(read_network, Duration::from_millis(5), send).await;
        assert_eq!(
            seen.into_inner().unwrap(),
            vec![
                DeviceEvent::Network(wifi_info("home")),
                DeviceEvent::Network(None),
                DeviceEvent::Network(wifi_info("office")),
            ]
        );
    }

    #[test]
    fn test_unpause_while_running_sends_nothing() {
        let (mut m, control) = monitor(MonitorOptions::default());
        m.handle(DeviceEvent::UserPause(false), Instant::now());
        assert!(control.take().is_empty());
    }

    #[test]
    fn test_unpause_while_other_reason_holds() {
        let (mut m, control) = monitor(MonitorOptions::default());
        let now = Instant::now();
        m.handle(DeviceEvent::Network(None), now);
        m.on_disconnect_timer();
        m.handle(DeviceEvent::UserPause(true), now);
        control.take();

        m.handle(DeviceEvent::UserPause(false), now);
        assert!(!m.should_be_connected());
        assert_eq!(control.take(), vec![Call::Pause(PauseReason::NoNetwork)]);
    }

    #[test]
    fn test_network_loss_is_debounced() {
        let (mut m, control) = monitor(MonitorOptions::default());
        let now = Instant::now();
        m.handle(wifi("home"), now);
        control.take();

        m.handle(DeviceEvent::Network(None), now);
        assert_eq!(m.network_state(), LinkState::PendingDisconnect);
        assert_eq!(m.disconnect_deadline(), Some(now + Duration::from_secs(20)));
        assert!(control.take().is_empty());

        m.on_disconnect_timer();
        assert_eq!(m.network_state(), LinkState::Disconnected);
        assert_eq!(control.take(), vec![Call::Pause(PauseReason::NoNetwork)]);
    }

    #[test]
    fn test_same_network_returns_before_timeout() {
        let (mut m, control) = monitor(MonitorOptions::default());
        let now = Instant::now();
        m.handle(wifi("home"), now);
        control.take();

        m.handle(DeviceEvent::Network(None), now);
        m.handle(wifi("home"), now);
        assert_eq!(m.disconnect_deadline(), None);
        assert_eq!(control.take(), vec![Call::NetworkChange(true)]);

        // The timer no longer applies
        m.on_disconnect_timer();
        assert!(control.take().is_empty());
        assert!(m.should_be_connected());
    }

    #[test]
    fn test_different_network_triggers_change() {
        let (mut m, control) = monitor(MonitorOptions::default());
        let now = Instant::now();
        m.handle(wifi("home"), now);
        assert_eq!(control.take(), vec![Call::NetworkChange(false)]);

        m.handle(wifi("office"), now);
        assert_eq!(control.take(), vec![Call::NetworkChange(false)]);

        m.handle(wifi("office"), now);
        assert_eq!(control.take(), vec![Call::Resume]);
    }

    #[test]
    fn test_network_back_after_pause_resumes_via_network_change() {
        let (mut m, control) = monitor(MonitorOptions::default());
        let now = Instant::now();
        m.handle(wifi("home"), now);
        m.handle(DeviceEvent::Network(None), now);
        m.on_disconnect_timer();
        control.take();

        m.handle(wifi("home"), now);
        assert!(m.should_be_connected());
        assert_eq!(control.take(), vec![Call::Resume]);
    }

    #[test]
    fn test_no_reconnect_option_ignores_loss() {
        let (mut m, control) = monitor(MonitorOptions {
            reconnect_on_network_change: false,
            ..MonitorOptions::default()
        });
        m.handle(DeviceEvent::Network(None), Instant::now());
        assert_eq!(m.network_state(), LinkState::ShouldBeConnected);
        assert_eq!(m.disconnect_deadline(), None);
        assert!(control.take().is_empty());
    }

    #[test]
    fn test_screen_off_ignored_without_option() {
        let (mut m, control) = monitor(MonitorOptions::default());
        m.handle(DeviceEvent::ScreenOff, Instant::now());
        assert_eq!(m.screen_state(), LinkState::ShouldBeConnected);
        assert!(control.take().is_empty());
    }

    #[test]
    fn test_screen_off_pauses_on_low_traffic() {
        let (mut m, control) = monitor(screen_options());
        let start = Instant::now();
        m.handle(DeviceEvent::ScreenOff, start);
        assert_eq!(m.screen_state(), LinkState::PendingDisconnect);
        assert!(!m.should_be_connected());

        // The seeded window keeps us up while it lasts
        m.handle(
            DeviceEvent::Traffic {
                delta_in: 10,
                delta_out: 10,
            },
            start + Duration::from_secs(30),
        );
        assert!(control.take().is_empty());

        m.handle(
            DeviceEvent::Traffic {
                delta_in: 10,
                delta_out: 10,
            },
            start + Duration::from_secs(61),
        );
        assert_eq!(m.screen_state(), LinkState::Disconnected);
        assert_eq!(control.take(), vec![Call::Pause(PauseReason::ScreenOff)]);

        m.handle(DeviceEvent::ScreenOn, start + Duration::from_secs(90));
        assert!(m.should_be_connected());
        assert_eq!(control.take(), vec![Call::Resume]);
    }

    #[test]
    fn test_screen_off_busy_traffic_stays_pending() {
        let (mut m, control) = monitor(screen_options());
        let start = Instant::now();
        m.handle(DeviceEvent::ScreenOff, start);
        m.handle(
            DeviceEvent::Traffic {
                delta_in: 100_000,
                delta_out: 0,
            },
            start + Duration::from_secs(61),
        );
        assert_eq!(m.screen_state(), LinkState::PendingDisconnect);
        assert!(control.take().is_empty());
    }

    #[test]
    fn test_screen_off_while_user_paused() {
        let (mut m, control) = monitor(screen_options());
        let now = Instant::now();
        m.handle(DeviceEvent::UserPause(true), now);
        m.handle(DeviceEvent::ScreenOff, now);
        assert_eq!(m.screen_state(), LinkState::Disconnected);
        assert_eq!(m.pause_reason(), PauseReason::UserPause);
        control.take();

        // Screen on does not override the user's pause
        m.handle(DeviceEvent::ScreenOn, now);
        assert_eq!(control.take(), vec![Call::Pause(PauseReason::UserPause)]);
    }

    #[test]
    fn test_network_change_finalizes_pending_screen() {
        let (mut m, control) = monitor(screen_options());
        let now = Instant::now();
        m.handle(DeviceEvent::ScreenOff, now);
        m.handle(wifi("cafe"), now);
        assert_eq!(m.screen_state(), LinkState::Disconnected);
        assert_eq!(m.pause_reason(), PauseReason::ScreenOff);
        assert!(control.take().is_empty());
    }

    #[test]
    fn test_pause_reason_priority() {
        let (mut m, _control) = monitor(screen_options());
        let now = Instant::now();
        assert_eq!(m.pause_reason(), PauseReason::UserPause);
        m.handle(DeviceEvent::Network(None), now);
        m.on_disconnect_timer();
        assert_eq!(m.pause_reason(), PauseReason::NoNetwork);
        m.handle(DeviceEvent::ScreenOff, now);
        assert_eq!(m.pause_reason(), PauseReason::ScreenOff);
        m.handle(DeviceEvent::UserPause(true), now);
        assert_eq!(m.pause_reason(), PauseReason::UserPause);
    }

    #[tokio::test]
    async fn test_run_consumes_events() {
        let control = Arc::new(RecordingControl::default());
        let monitor = DeviceStateMonitor::new(control.clone(), MonitorOptions::default());
        let gate = monitor.gate();
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(monitor.run(rx));

        tx.send(DeviceEvent::UserPause(true)).unwrap();
        tx.send(DeviceEvent::UserPause(false)).unwrap();
        drop(tx);
        task.await.unwrap();

        assert!(gate.load(Ordering::SeqCst));
        assert_eq!(
            control.take(),
            vec![Call::Pause(PauseReason::UserPause), Call::Resume]
        );
    }
}
