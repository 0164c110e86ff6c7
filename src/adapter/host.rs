use std::process::Stdio;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, Mutex};

use super::{AdapterControls, AdapterError, AdapterEvent, AdapterSession, BotAdapter, Platform};
use crate::shared::models::BotSettings;

/// Bridges the controller to an external platform host process (browser
/// automation or native SDK host) over newline-delimited JSON: events arrive
/// on the host's stdout, commands go down its stdin. The adapter layer is the
/// only component allowed to spawn subprocesses besides the encoder.
pub struct HostProcessAdapter {
    platform: Platform,
    meeting_url: String,
    bot_name: String,
    settings: BotSettings,
    credentials: serde_json::Value,
}

#[derive(Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
enum HostCommand {
    StartRecording,
    PauseRecording,
    ResumeRecording,
    Leave,
}

impl HostProcessAdapter {
    pub fn new(
        platform: Platform,
        meeting_url: String,
        bot_name: String,
        settings: BotSettings,
        credentials: serde_json::Value,
    ) -> Self {
        Self {
            platform,
            meeting_url,
            bot_name,
            settings,
            credentials,
        }
    }

    fn host_binary(&self) -> String {
        let var = match self.platform {
            Platform::ZoomNative => "ZOOM_NATIVE_HOST_BIN",
            Platform::ZoomWeb => "ZOOM_WEB_HOST_BIN",
            Platform::GoogleMeet => "GOOGLE_MEET_HOST_BIN",
            Platform::Teams => "TEAMS_HOST_BIN",
            Platform::ZoomRtms => "ZOOM_RTMS_HOST_BIN",
        };
        std::env::var(var).unwrap_or_else(|_| format!("meetserver-host-{}", self.platform.as_str()))
    }
}

#[async_trait]
impl BotAdapter for HostProcessAdapter {
    async fn open(&mut self) -> Result<AdapterSession, AdapterError> {
        let mut child = Command::new(self.host_binary())
            .env("MEETING_URL", &self.meeting_url)
            .env("BOT_NAME", &self.bot_name)
            .env(
                "BOT_SETTINGS",
                serde_json::to_string(&self.settings).unwrap_or_default(),
            )
            .env("PLATFORM_CREDENTIALS", self.credentials.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child.stdin.take().ok_or(AdapterError::ControlChannelClosed)?;
        let stdout = child.stdout.take().ok_or(AdapterError::ControlChannelClosed)?;
        info!(
            "Started {} host for {}",
            self.platform.as_str(),
            self.meeting_url
        );

        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(pump_events(self.platform, child, stdout, tx));

        Ok(AdapterSession {
            events: rx,
            controls: Box::new(HostControls {
                stdin: Mutex::new(stdin),
            }),
        })
    }
}

/// Reads stdout lines into adapter events until the host exits. Host death
/// without a terminal event is surfaced as `FatalError` so the controller
/// never hangs on a vanished subprocess.
async fn pump_events(
    platform: Platform,
    mut child: Child,
    stdout: tokio::process::ChildStdout,
    tx: mpsc::Sender<AdapterEvent>,
) {
    let mut lines = BufReader::new(stdout).lines();
    let mut saw_terminal = false;
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<AdapterEvent>(line) {
                    Ok(event) => {
                        saw_terminal = saw_terminal || event.is_terminal();
                        if tx.send(event).await.is_err() {
                            debug!("Controller dropped the event channel; stopping pump");
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(
                            "Unparseable event line from {} host: {} ({})",
                            platform.as_str(),
                            &line[..line.len().min(200)],
                            e
                        );
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                error!("Read error from {} host: {}", platform.as_str(), e);
                break;
            }
        }
    }

    let status = child.wait().await;
    if !saw_terminal {
        let message = match status {
            Ok(status) => format!("adapter host exited without terminal event: {}", status),
            Err(e) => format!("adapter host wait failed: {}", e),
        };
        let _ = tx.send(AdapterEvent::FatalError { message }).await;
    }
}

struct HostControls {
    stdin: Mutex<ChildStdin>,
}

impl HostControls {
    async fn send(&self, command: HostCommand) -> Result<(), AdapterError> {
        let mut line = serde_json::to_string(&command).unwrap_or_default();
        line.push('\n');
        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|_| AdapterError::ControlChannelClosed)?;
        stdin
            .flush()
            .await
            .map_err(|_| AdapterError::ControlChannelClosed)
    }
}

#[async_trait]
impl AdapterControls for HostControls {
    async fn start_recording(&self) -> Result<(), AdapterError> {
        self.send(HostCommand::StartRecording).await
    }

    async fn pause_recording(&self) -> Result<(), AdapterError> {
        self.send(HostCommand::PauseRecording).await
    }

    async fn resume_recording(&self) -> Result<(), AdapterError> {
        self.send(HostCommand::ResumeRecording).await
    }

    async fn leave(&self) -> Result<(), AdapterError> {
        self.send(HostCommand::Leave).await
    }
}
