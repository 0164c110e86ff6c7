use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::shared::models::{Bot, BotSettings};

pub mod host;

/// Closed set of supported meeting platforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    ZoomNative,
    ZoomWeb,
    GoogleMeet,
    Teams,
    ZoomRtms,
}

impl Platform {
    /// Meeting URL to platform, as a pure function of the URL alone.
    pub fn from_meeting_url(meeting_url: &str) -> Platform {
        if meeting_url.starts_with("zoom-rtms://") {
            return Platform::ZoomRtms;
        }
        let host = url::Url::parse(meeting_url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_default();
        if host.ends_with("zoom.us") {
            Platform::ZoomNative
        } else if host == "meet.google.com" {
            Platform::GoogleMeet
        } else if host.ends_with("teams.microsoft.com") || host.ends_with("teams.live.com") {
            Platform::Teams
        } else {
            // Unknown hosts get the browser bot, which can at least render
            // the page and report a join failure with a screenshot.
            Platform::ZoomWeb
        }
    }

    /// Platform for a bot, honoring the per-bot web adapter override.
    pub fn for_bot(bot: &Bot) -> Platform {
        let platform = Self::from_meeting_url(&bot.meeting_url);
        if platform == Platform::ZoomNative && bot.bot_settings().use_web_adapter {
            Platform::ZoomWeb
        } else {
            platform
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ZoomNative => "zoom_native",
            Self::ZoomWeb => "zoom_web",
            Self::GoogleMeet => "google_meet",
            Self::Teams => "teams",
            Self::ZoomRtms => "zoom_rtms",
        }
    }

    /// Native SDK bots need more CPU than browser ones.
    pub fn cpu_request(&self) -> &'static str {
        match self {
            Self::ZoomNative => "4",
            Self::ZoomRtms => "1",
            _ => "2",
        }
    }

    pub fn memory_request(&self) -> &'static str {
        match self {
            Self::ZoomNative => "4Gi",
            Self::ZoomRtms => "1Gi",
            _ => "3Gi",
        }
    }

    /// RTMS sessions have no admission handshake and no leave control.
    pub fn is_push_stream(&self) -> bool {
        matches!(self, Self::ZoomRtms)
    }
}

/// Events a platform adapter yields to the controller. Frame timestamps are
/// meeting-relative milliseconds and monotonic per participant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AdapterEvent {
    Admitted,
    Rejected {
        reason: String,
    },
    ParticipantJoined {
        uuid: String,
        full_name: Option<String>,
        user_uuid: Option<String>,
        #[serde(default)]
        is_host: bool,
        timestamp_ms: i64,
    },
    ParticipantLeft {
        uuid: String,
        timestamp_ms: i64,
    },
    SpeechStart {
        uuid: String,
        timestamp_ms: i64,
    },
    SpeechStop {
        uuid: String,
        timestamp_ms: i64,
    },
    ScreenshareStart {
        uuid: String,
        timestamp_ms: i64,
    },
    ScreenshareStop {
        uuid: String,
        timestamp_ms: i64,
    },
    /// 48 kHz mono s16le PCM.
    AudioFrame {
        uuid: String,
        #[serde(with = "base64_bytes")]
        pcm: Bytes,
        timestamp_ms: i64,
    },
    /// Decoded RGB24, row-major.
    VideoFrame {
        uuid: String,
        width: u32,
        height: u32,
        #[serde(with = "base64_bytes")]
        data: Bytes,
        timestamp_ms: i64,
    },
    ChatMessage {
        uuid: String,
        message_id: Option<String>,
        text: String,
        timestamp_ms: i64,
    },
    /// Platform-provided caption, for meetings where raw audio is not
    /// available or captions are explicitly requested.
    ClosedCaption {
        uuid: String,
        text: String,
        timestamp_ms: i64,
        duration_ms: i64,
    },
    DebugScreenshot {
        #[serde(with = "base64_bytes")]
        png: Bytes,
    },
    MeetingEnded,
    Kicked,
    FatalError {
        message: String,
    },
}

impl AdapterEvent {
    /// Events after which the adapter will emit nothing further.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::MeetingEnded | Self::Kicked | Self::FatalError { .. } | Self::Rejected { .. }
        )
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Bytes, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD
            .decode(s)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("unsupported platform for url {0}")]
    UnsupportedPlatform(String),
    #[error("missing credential: {0}")]
    MissingCredential(String),
    #[error("adapter host spawn failed: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("adapter host closed the control channel")]
    ControlChannelClosed,
}

/// Control surface the adapter exposes back to the controller. All commands
/// are fire-and-forget; outcomes come back on the event stream.
#[async_trait]
pub trait AdapterControls: Send + Sync {
    async fn start_recording(&self) -> Result<(), AdapterError>;
    async fn pause_recording(&self) -> Result<(), AdapterError>;
    async fn resume_recording(&self) -> Result<(), AdapterError>;
    /// The adapter must answer with a terminal event within 60 seconds.
    async fn leave(&self) -> Result<(), AdapterError>;
}

pub struct AdapterSession {
    pub events: mpsc::Receiver<AdapterEvent>,
    pub controls: Box<dyn AdapterControls>,
}

/// Platform-specific I/O behind a fixed interface. Implementations own the
/// admission handshake, credential refresh, and translation of platform
/// errors into the event stream.
#[async_trait]
pub trait BotAdapter: Send {
    async fn open(&mut self) -> Result<AdapterSession, AdapterError>;
}

/// Default factory: every platform is bridged through its host binary.
pub fn build_adapter(
    bot: &Bot,
    settings: &BotSettings,
    credentials_json: serde_json::Value,
) -> Result<Box<dyn BotAdapter>, AdapterError> {
    let platform = Platform::for_bot(bot);
    Ok(Box::new(host::HostProcessAdapter::new(
        platform,
        bot.meeting_url.clone(),
        bot.name.clone(),
        settings.clone(),
        credentials_json,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_scheme_maps_to_platform() {
        assert_eq!(
            Platform::from_meeting_url("https://us02web.zoom.us/j/123?pwd=abc"),
            Platform::ZoomNative
        );
        assert_eq!(
            Platform::from_meeting_url("https://meet.google.com/abc-defg-hij"),
            Platform::GoogleMeet
        );
        assert_eq!(
            Platform::from_meeting_url("https://teams.microsoft.com/l/meetup-join/xyz"),
            Platform::Teams
        );
        assert_eq!(
            Platform::from_meeting_url("https://teams.live.com/meet/9991"),
            Platform::Teams
        );
        assert_eq!(
            Platform::from_meeting_url("zoom-rtms://stream/abc"),
            Platform::ZoomRtms
        );
    }

    #[test]
    fn rtms_is_a_push_stream() {
        assert!(Platform::ZoomRtms.is_push_stream());
        assert!(!Platform::ZoomNative.is_push_stream());
    }

    #[test]
    fn audio_frame_round_trips_as_json_line() {
        let event = AdapterEvent::AudioFrame {
            uuid: "p1".into(),
            pcm: Bytes::from_static(&[0x01, 0x02, 0x03, 0x04]),
            timestamp_ms: 1200,
        };
        let line = serde_json::to_string(&event).unwrap();
        match serde_json::from_str::<AdapterEvent>(&line).unwrap() {
            AdapterEvent::AudioFrame { uuid, pcm, timestamp_ms } => {
                assert_eq!(uuid, "p1");
                assert_eq!(&pcm[..], &[0x01, 0x02, 0x03, 0x04]);
                assert_eq!(timestamp_ms, 1200);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
