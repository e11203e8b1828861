//! Engine process management
//!
//! The engine runs with `--config <file>` and writes machine-readable log
//! lines (`<sec>.<usec> <hexflags> <message>`) to stdout, which are relayed
//! to the session's status sink.

use super::status::{LogLevel, StatusSink};
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const M_FATAL: u32 = 1 << 4;
const M_NONFATAL: u32 = 1 << 5;
const M_WARN: u32 = 1 << 6;
const M_DEBUG: u32 = 1 << 7;

/// One line of engine output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineLogLine {
    pub level: LogLevel,
    pub verbosity: u8,
    pub message: String,
}

/// Parse `<sec>.<usec> <hexflags> <message>`. `None` for anything else.
pub fn parse_log_line(line: &str) -> Option<EngineLogLine> {
    let (timestamp, rest) = line.split_once(' ')?;
    let (sec, usec) = timestamp.split_once('.')?;
    if sec.is_empty()
        || usec.is_empty()
        || !sec.bytes().all(|b| b.is_ascii_digit())
        || !usec.bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }
    let (flags, message) = rest.split_once(' ')?;
    let flags = u32::from_str_radix(flags, 16).ok()?;

    let level = if flags & M_FATAL != 0 {
        LogLevel::Error
    } else if flags & (M_NONFATAL | M_WARN) != 0 {
        LogLevel::Warning
    } else if flags & M_DEBUG != 0 {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    let mut verbosity = (flags & 0x0F) as u8;
    if message.starts_with("MANAGEMENT: CMD") {
        verbosity = verbosity.max(4);
    }
    Some(EngineLogLine {
        level,
        verbosity,
        message: message.to_string(),
    })
}

/// A running engine process
pub struct Engine {
    child: Child,
    relays: Vec<JoinHandle<()>>,
}

impl Engine {
    /// Start `binary --config <config>` and relay its output
    pub fn spawn(
        binary: &Path,
        config: &Path,
        status: Arc<dyn StatusSink>,
    ) -> std::io::Result<Engine> {
        let mut child = Command::new(binary)
            .arg("--config")
            .arg(config)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        info!(
            "Started {} (pid {})",
            binary.display(),
            child.id().unwrap_or_default()
        );

        let mut relays = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            relays.push(tokio::spawn(relay_output(stdout, Arc::clone(&status))));
        }
        if let Some(stderr) = child.stderr.take() {
            relays.push(tokio::spawn(relay_output(stderr, status)));
        }
        Ok(Engine { child, relays })
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        let status = self.child.wait().await?;
        for relay in self.relays.drain(..) {
            if let Err(e) = relay.await {
                debug!("Output relay ended abnormally: {}", e);
            }
        }
        Ok(status)
    }

    /// Wait up to `grace` for a clean exit, then kill
    pub async fn stop(&mut self, grace: Duration) -> std::io::Result<ExitStatus> {
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                warn!("Engine did not exit within {:?}, killing it", grace);
                self.child.kill().await?;
                self.child.wait().await
            }
        }
    }
}

async fn relay_output<R: AsyncRead + Unpin>(output: R, status: Arc<dyn StatusSink>) {
    let mut lines = BufReader::new(output).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match parse_log_line(&line) {
                Some(entry) => status.log(entry.level, entry.verbosity, &entry.message),
                None => status.log(LogLevel::Info, 0, &format!("P:{}", line)),
            },
            Ok(None) => break,
            Err(e) => {
                debug!("Failed to read engine output: {}", e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::status::testing::{Event, RecordingStatus};
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn test_parse_log_line() {
        assert_eq!(
            parse_log_line("1700000000.123456 3 Initialization Sequence Completed"),
            Some(EngineLogLine {
                level: LogLevel::Info,
                verbosity: 3,
                message: "Initialization Sequence Completed".to_string()
            })
        );
        assert_eq!(
            parse_log_line("1.2 41 TLS warning").map(|l| (l.level, l.verbosity)),
            Some((LogLevel::Warning, 1))
        );
        assert_eq!(
            parse_log_line("1.2 11 Exiting due to fatal error").map(|l| l.level),
            Some(LogLevel::Error)
        );
        assert_eq!(
            parse_log_line("1.2 82 MANAGEMENT: CMD 'hold release'").map(|l| (l.level, l.verbosity)),
            Some((LogLevel::Debug, 4))
        );
        assert_eq!(parse_log_line("Options error: bad"), None);
        assert_eq!(parse_log_line("1.2 zz message"), None);
    }

    #[tokio::test]
    async fn test_spawn_relays_output() {
        let dir = tempfile::TempDir::new().unwrap();
        let script = dir.path().join("engine.sh");
        std::fs::write(
            &script,
            "#!/bin/sh\necho \"1700000000.1 3 config $2\"\necho plain\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let status = Arc::new(RecordingStatus::default());
        let mut engine = Engine::spawn(&script, Path::new("/tmp/x.conf"), status.clone()).unwrap();
        let exit = engine.wait().await.unwrap();
        assert!(exit.success());

        let events = status.events();
        assert!(events.contains(&Event::Log(LogLevel::Info, 3, "config /tmp/x.conf".to_string())));
        assert!(events.contains(&Event::Log(LogLevel::Info, 0, "P:plain".to_string())));
    }

    #[tokio::test]
    async fn test_stop_kills_hung_engine() {
        let dir = tempfile::TempDir::new().unwrap();
        let script = dir.path().join("engine.sh");
        std::fs::write(&script, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let status = Arc::new(RecordingStatus::default());
        let mut engine = Engine::spawn(&script, Path::new("/tmp/x.conf"), status).unwrap();
        let exit = engine.stop(Duration::from_millis(100)).await.unwrap();
        assert!(!exit.success());
    }
}
