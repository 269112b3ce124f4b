//! Line-oriented operator commands and the status table.

use std::fmt::Write as _;
use std::str::FromStr;
use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use porthop_crypto::unix_now;

use crate::analysis::{Analyzer, TunnelMetadata};
use crate::rotation::PortRotationScheduler;
use crate::tunnel::TunnelRecord;

pub const HELP: &str = "\
commands:
  t, toggle-auto-rotation   turn periodic rotation on or off
  r, force-rotate [KEY]     rotate KEY now (every tunnel when KEY is omitted)
  a, analyze KEY            advisory for KEY
  s, status                 list tunnels
  h, help                   this text
  q, quit                   stop the daemon";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    ToggleAutoRotation,
    ForceRotate(Option<String>),
    Analyze(String),
    Status,
    Help,
    Quit,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("empty command")]
    Empty,

    #[error("unknown command '{0}', try 'help'")]
    Unknown(String),

    #[error("'{0}' needs an application key")]
    MissingKey(&'static str),
}

impl FromStr for Command {
    type Err = CommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let verb = words.next().ok_or(CommandError::Empty)?;
        let key = words.next().map(str::to_string);
        match verb.to_ascii_lowercase().as_str() {
            "t" | "toggle" | "toggle-auto-rotation" => Ok(Self::ToggleAutoRotation),
            "r" | "rotate" | "force-rotate" => Ok(Self::ForceRotate(key)),
            "a" | "analyze" => key
                .map(Self::Analyze)
                .ok_or(CommandError::MissingKey("analyze")),
            "s" | "status" => Ok(Self::Status),
            "h" | "?" | "help" => Ok(Self::Help),
            "q" | "quit" | "exit" => Ok(Self::Quit),
            other => Err(CommandError::Unknown(other.to_string())),
        }
    }
}

/// Result of one command: text for the operator and whether to stop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub text: String,
    pub quit: bool,
}

impl Reply {
    fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            quit: false,
        }
    }
}

/// Why [`Controller::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlExit {
    Quit,
    /// Input closed, e.g. stdin is not a terminal.
    EndOfInput,
}

pub struct Controller {
    scheduler: Arc<PortRotationScheduler>,
    analyzer: Box<dyn Analyzer>,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

impl Controller {
    pub fn new(scheduler: Arc<PortRotationScheduler>, analyzer: Box<dyn Analyzer>) -> Self {
        Self {
            scheduler,
            analyzer,
        }
    }

    pub async fn execute(&self, command: Command) -> Reply {
        let manager = self.scheduler.manager();
        match command {
            Command::ToggleAutoRotation => {
                let enabled = self.scheduler.toggle_auto_rotation();
                Reply::text(format!(
                    "auto rotation {}",
                    if enabled { "enabled" } else { "disabled" }
                ))
            }
            Command::ForceRotate(Some(key)) => Reply::text(self.rotate_one(&key).await),
            Command::ForceRotate(None) => {
                let records = manager.records().await;
                if records.is_empty() {
                    return Reply::text("no tunnels");
                }
                let mut lines = Vec::with_capacity(records.len());
                for record in records {
                    lines.push(self.rotate_one(&record.application_key).await);
                }
                Reply::text(lines.join("\n"))
            }
            Command::Analyze(key) => {
                let Some(record) = manager.record(&key).await else {
                    return Reply::text(format!("{key}: no such tunnel"));
                };
                let certificate = manager.certificate(&key).await;
                let metadata = TunnelMetadata::from_record(
                    &record,
                    certificate.as_ref(),
                    unix_now(),
                    self.scheduler.interval(),
                    self.scheduler.auto_rotation_enabled(),
                );
                let advisory = self.analyzer.analyze(&metadata);
                let mut text = format!("{key}: risk {}", advisory.risk_level);
                for concern in &advisory.concerns {
                    let _ = write!(text, "\n  concern: {concern}");
                }
                for recommendation in &advisory.recommendations {
                    let _ = write!(text, "\n  recommend: {recommendation}");
                }
                let _ = write!(
                    text,
                    "\n  policy: {} ({})",
                    if advisory.tunnel_policy.should_tunnel {
                        "tunnel"
                    } else {
                        "do not tunnel"
                    },
                    advisory.tunnel_policy.reason
                );
                Reply::text(text)
            }
            Command::Status => Reply::text(render_status(
                &manager.records().await,
                self.scheduler.auto_rotation_enabled(),
                unix_now(),
            )),
            Command::Help => Reply::text(HELP),
            Command::Quit => Reply {
                text: "shutting down".into(),
                quit: true,
            },
        }
    }

    async fn rotate_one(&self, key: &str) -> String {
        let before = self.scheduler.manager().record(key).await;
        match self.scheduler.force_rotate(key).await {
            Ok(after) => format!(
                "{key}: port {} -> {}",
                before.map_or(0, |r| r.public_port),
                after.public_port
            ),
            Err(e) => format!("{key}: rotation failed: {e}"),
        }
    }

    /// Read commands line by line from `input` and answer on `output`
    /// until `quit` or end of input.
    pub async fn run<R, W>(&self, input: R, mut output: W) -> std::io::Result<ControlExit>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = input.lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let reply = match line.parse::<Command>() {
                Ok(command) => {
                    debug!(?command, "Control command");
                    self.execute(command).await
                }
                Err(e) => {
                    warn!(input = %line.trim(), error = %e, "Bad control command");
                    Reply::text(e.to_string())
                }
            };
            output.write_all(reply.text.as_bytes()).await?;
            output.write_all(b"\n").await?;
            output.flush().await?;
            if reply.quit {
                return Ok(ControlExit::Quit);
            }
        }
        Ok(ControlExit::EndOfInput)
    }
}

/// Plain-text table of tunnel records.
pub fn render_status(records: &[TunnelRecord], auto_rotation: bool, now: i64) -> String {
    let mut out = format!(
        "auto rotation: {}   tunnels: {}\n",
        if auto_rotation { "on" } else { "off" },
        records.len()
    );
    let _ = writeln!(
        out,
        "{:<20} {:>7} {:<21} {:>6} {:<9} {:>7} {:>9}  {}",
        "APPLICATION", "PID", "BACKEND", "PORT", "STATE", "AGE", "ROTATIONS", "CERTIFICATE"
    );
    for r in records {
        let pid = r.pid.map_or_else(|| "-".to_string(), |p| p.to_string());
        let port = match r.previous_port {
            Some(previous) => format!("{previous}>{}", r.public_port),
            None => r.public_port.to_string(),
        };
        let fingerprint: String = r.certificate_fingerprint.chars().take(11).collect();
        let _ = writeln!(
            out,
            "{:<20} {:>7} {:<21} {:>6} {:<9} {:>6}s {:>9}  {}",
            truncate(&r.application_key, 20),
            pid,
            r.backend_address.to_string(),
            port,
            r.state.as_str(),
            r.age(now),
            r.rotation_count,
            fingerprint
        );
    }
    if records.is_empty() {
        out.push_str("(no tunnels)\n");
    }
    out
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let mut cut: String = s.chars().take(max.saturating_sub(1)).collect();
        cut.push('~');
        cut
    }
}
