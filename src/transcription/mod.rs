use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::shared::models::{TranscriptionFailureReason, TranscriptionProviderKind};

pub mod deepgram;
pub mod provider;

use provider::{ProviderEvent, ProviderWord, Session, SessionSink, TranscriptionProvider};

/// Close a participant's streaming session after this much silence.
pub const IDLE_CLOSE_MS: i64 = 10_000;
/// Normalized RMS below which a chunk counts as silence.
pub const SILENCE_RMS_THRESHOLD: f64 = 0.0025;
/// Bound on the per-session audio queue; overflow drops audio rather than
/// stalling ingest.
const SESSION_QUEUE_FRAMES: usize = 256;

/// What the coordinator hands back to the controller for persistence.
#[derive(Debug, Clone)]
pub enum TranscriptEvent {
    Utterance {
        participant_uuid: String,
        transcript: String,
        /// Word timings in meeting-relative milliseconds.
        words: Vec<ProviderWord>,
        relative_timestamp_ms: i64,
        duration_ms: i64,
    },
    Partial {
        participant_uuid: String,
        transcript: String,
    },
    Failure {
        participant_uuid: String,
        reason: TranscriptionFailureReason,
        detail: String,
    },
}

enum FeedMsg {
    Audio(Bytes),
    Close,
}

struct ParticipantSession {
    feed_tx: mpsc::Sender<FeedMsg>,
    closed: Arc<AtomicBool>,
    retryable: Arc<AtomicBool>,
    task: JoinHandle<()>,
    overflow_reported: bool,
}

/// Maintains one streaming ASR session per active speaker: opens on first
/// non-silent audio, closes after idle silence, reopens after retryable
/// provider failures. Every session has its own task and a bounded queue,
/// so a slow provider can never block the media pipeline.
pub struct TranscriptionCoordinator {
    provider: Option<Arc<dyn TranscriptionProvider>>,
    language: String,
    sample_rate: u32,
    out_tx: mpsc::Sender<TranscriptEvent>,
    sessions: HashMap<String, ParticipantSession>,
    /// Participants whose sessions died non-retryably; never reopened.
    blocked: HashSet<String>,
    last_nonsilent_ms: HashMap<String, i64>,
    /// High-water mark of the meeting-relative clock, advanced by feeds.
    latest_relative_ms: i64,
}

impl TranscriptionCoordinator {
    pub fn new(
        kind: TranscriptionProviderKind,
        api_key: Option<String>,
        language: String,
        sample_rate: u32,
        out_tx: mpsc::Sender<TranscriptEvent>,
    ) -> Self {
        let provider: Option<Arc<dyn TranscriptionProvider>> = match kind {
            TranscriptionProviderKind::Deepgram => {
                api_key.map(|key| {
                    Arc::new(deepgram::DeepgramProvider::new(key)) as Arc<dyn TranscriptionProvider>
                })
            }
            TranscriptionProviderKind::None => None,
        };
        Self {
            provider,
            language,
            sample_rate,
            out_tx,
            sessions: HashMap::new(),
            blocked: HashSet::new(),
            last_nonsilent_ms: HashMap::new(),
            latest_relative_ms: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.provider.is_some()
    }

    /// Route one PCM chunk. Opens a session on speech, drops audio (with a
    /// failure record) when a session queue overflows.
    pub fn feed(&mut self, participant_uuid: &str, pcm_s16le: Bytes, relative_ms: i64) {
        let Some(provider) = self.provider.clone() else {
            return;
        };
        if self.blocked.contains(participant_uuid) {
            return;
        }

        self.latest_relative_ms = self.latest_relative_ms.max(relative_ms);
        let silent = normalized_rms(&pcm_s16le) < SILENCE_RMS_THRESHOLD;
        if !silent {
            self.last_nonsilent_ms
                .insert(participant_uuid.to_string(), relative_ms);
        }

        // Prune a session whose tasks have ended; decide whether the
        // participant may get a new one.
        let stale = self
            .sessions
            .get(participant_uuid)
            .map(|s| (s.closed.load(Ordering::SeqCst), s.retryable.load(Ordering::SeqCst)));
        if let Some((true, retryable)) = stale {
            self.sessions.remove(participant_uuid);
            if !retryable {
                info!(
                    "Transcription permanently disabled for participant {}",
                    participant_uuid
                );
                self.blocked.insert(participant_uuid.to_string());
                return;
            }
        }

        if !self.sessions.contains_key(participant_uuid) {
            if silent {
                return;
            }
            self.open_session(provider, participant_uuid, relative_ms);
        }

        let session = self
            .sessions
            .get_mut(participant_uuid)
            .expect("session just ensured");
        match session.feed_tx.try_send(FeedMsg::Audio(pcm_s16le)) {
            Ok(()) => session.overflow_reported = false,
            Err(mpsc::error::TrySendError::Full(_)) => {
                if !session.overflow_reported {
                    session.overflow_reported = true;
                    let _ = self.out_tx.try_send(TranscriptEvent::Failure {
                        participant_uuid: participant_uuid.to_string(),
                        reason: TranscriptionFailureReason::DroppedAudio,
                        detail: "session queue overflow; audio dropped".to_string(),
                    });
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                session.closed.store(true, Ordering::SeqCst);
            }
        }
    }

    fn open_session(
        &mut self,
        provider: Arc<dyn TranscriptionProvider>,
        participant_uuid: &str,
        started_rel_ms: i64,
    ) {
        debug!(
            "Opening transcription session for {} at {} ms",
            participant_uuid, started_rel_ms
        );
        let (feed_tx, feed_rx) = mpsc::channel(SESSION_QUEUE_FRAMES);
        let closed = Arc::new(AtomicBool::new(false));
        let retryable = Arc::new(AtomicBool::new(true));
        let task = tokio::spawn(run_session(
            provider,
            self.language.clone(),
            self.sample_rate,
            participant_uuid.to_string(),
            started_rel_ms,
            feed_rx,
            self.out_tx.clone(),
            Arc::clone(&closed),
            Arc::clone(&retryable),
        ));
        self.sessions.insert(
            participant_uuid.to_string(),
            ParticipantSession {
                feed_tx,
                closed,
                retryable,
                task,
                overflow_reported: false,
            },
        );
    }

    /// Close sessions that have heard nothing but silence for `IDLE_CLOSE_MS`,
    /// measured on the meeting-relative clock the feeds advance.
    pub fn close_idle_sessions(&mut self) {
        let now_relative_ms = self.latest_relative_ms;
        let idle: Vec<String> = self
            .sessions
            .keys()
            .filter(|uuid| {
                let last = self.last_nonsilent_ms.get(*uuid).copied().unwrap_or(0);
                now_relative_ms - last > IDLE_CLOSE_MS
            })
            .cloned()
            .collect();
        for uuid in idle {
            debug!("Closing idle transcription session for {}", uuid);
            if let Some(session) = self.sessions.remove(&uuid) {
                let _ = session.feed_tx.try_send(FeedMsg::Close);
            }
        }
    }

    /// Ask every session to flush and close. Outstanding finals keep flowing
    /// on the event channel until the session tasks finish; the caller bounds
    /// the wait with its own deadline.
    pub async fn flush(mut self) {
        let sessions: Vec<ParticipantSession> = self.sessions.drain().map(|(_, s)| s).collect();
        for session in &sessions {
            let _ = session.feed_tx.send(FeedMsg::Close).await;
        }
        for session in sessions {
            if let Err(e) = session.task.await {
                warn!("Transcription session task failed during flush: {}", e);
            }
        }
    }
}

/// One session's lifetime: open the provider stream, forward queued audio,
/// and translate provider events into meeting-relative transcript events.
#[allow(clippy::too_many_arguments)]
async fn run_session(
    provider: Arc<dyn TranscriptionProvider>,
    language: String,
    sample_rate: u32,
    participant_uuid: String,
    started_rel_ms: i64,
    mut feed_rx: mpsc::Receiver<FeedMsg>,
    out_tx: mpsc::Sender<TranscriptEvent>,
    closed: Arc<AtomicBool>,
    retryable: Arc<AtomicBool>,
) {
    let session = match provider.open(&language, sample_rate).await {
        Ok(session) => session,
        Err(e) => {
            closed.store(true, Ordering::SeqCst);
            let _ = out_tx
                .send(TranscriptEvent::Failure {
                    participant_uuid,
                    reason: TranscriptionFailureReason::TranscriptionRequestFailed,
                    detail: e.to_string(),
                })
                .await;
            return;
        }
    };
    let Session { mut sink, events } = session;
    let reader = tokio::spawn(read_session(
        events,
        participant_uuid.clone(),
        started_rel_ms,
        out_tx,
        Arc::clone(&closed),
        retryable,
    ));

    while let Some(msg) = feed_rx.recv().await {
        match msg {
            FeedMsg::Audio(pcm) => {
                if sink.send(pcm).await.is_err() {
                    break;
                }
            }
            FeedMsg::Close => break,
        }
    }
    let _ = sink.close().await;
    let _ = reader.await;
    closed.store(true, Ordering::SeqCst);
}

async fn read_session(
    mut events: mpsc::Receiver<ProviderEvent>,
    participant_uuid: String,
    started_rel_ms: i64,
    out_tx: mpsc::Sender<TranscriptEvent>,
    closed: Arc<AtomicBool>,
    retryable: Arc<AtomicBool>,
) {
    while let Some(event) = events.recv().await {
        match event {
            ProviderEvent::Partial { transcript } => {
                let _ = out_tx
                    .send(TranscriptEvent::Partial {
                        participant_uuid: participant_uuid.clone(),
                        transcript,
                    })
                    .await;
            }
            ProviderEvent::Final {
                transcript,
                words,
                start_ms,
                duration_ms,
            } => {
                let words = words
                    .into_iter()
                    .map(|w| ProviderWord {
                        start_ms: started_rel_ms + w.start_ms,
                        end_ms: started_rel_ms + w.end_ms,
                        ..w
                    })
                    .collect();
                let _ = out_tx
                    .send(TranscriptEvent::Utterance {
                        participant_uuid: participant_uuid.clone(),
                        transcript,
                        words,
                        relative_timestamp_ms: started_rel_ms + start_ms,
                        duration_ms,
                    })
                    .await;
            }
            ProviderEvent::Error { reason, detail } => {
                retryable.store(reason.is_retryable(), Ordering::SeqCst);
                closed.store(true, Ordering::SeqCst);
                let _ = out_tx
                    .send(TranscriptEvent::Failure {
                        participant_uuid: participant_uuid.clone(),
                        reason,
                        detail,
                    })
                    .await;
                return;
            }
            ProviderEvent::Closed => break,
        }
    }
    closed.store(true, Ordering::SeqCst);
}

/// RMS of an s16le chunk, normalized to full scale.
pub fn normalized_rms(pcm_s16le: &[u8]) -> f64 {
    if pcm_s16le.len() < 2 {
        return 0.0;
    }
    let mut energy = 0.0f64;
    let mut count = 0usize;
    for chunk in pcm_s16le.chunks_exact(2) {
        let sample = i16::from_le_bytes([chunk[0], chunk[1]]) as f64;
        energy += sample * sample;
        count += 1;
    }
    (energy / count as f64).sqrt() / 32768.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm_of(level: i16, samples: usize) -> Bytes {
        let mut out = Vec::with_capacity(samples * 2);
        for _ in 0..samples {
            out.extend_from_slice(&level.to_le_bytes());
        }
        Bytes::from(out)
    }

    #[test]
    fn rms_separates_speech_from_silence() {
        assert!(normalized_rms(&pcm_of(0, 480)) < SILENCE_RMS_THRESHOLD);
        assert!(normalized_rms(&pcm_of(50, 480)) < SILENCE_RMS_THRESHOLD);
        assert!(normalized_rms(&pcm_of(2000, 480)) > SILENCE_RMS_THRESHOLD);
    }

    #[tokio::test]
    async fn disabled_coordinator_ignores_audio() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut coordinator = TranscriptionCoordinator::new(
            TranscriptionProviderKind::None,
            None,
            "en".into(),
            48_000,
            tx,
        );
        assert!(!coordinator.is_enabled());
        coordinator.feed("p1", pcm_of(8000, 480), 0);
        assert!(coordinator.sessions.is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn silence_does_not_open_sessions() {
        let (tx, _rx) = mpsc::channel(8);
        let mut coordinator = TranscriptionCoordinator::new(
            TranscriptionProviderKind::Deepgram,
            Some("key".into()),
            "en".into(),
            48_000,
            tx,
        );
        coordinator.feed("p1", pcm_of(0, 480), 0);
        assert!(coordinator.sessions.is_empty());
    }

    #[test]
    fn word_offsets_shift_by_session_start() {
        let word = ProviderWord {
            word: "hi".into(),
            start_ms: 100,
            end_ms: 400,
            confidence: 0.9,
        };
        let shifted = ProviderWord {
            start_ms: 5_000 + word.start_ms,
            end_ms: 5_000 + word.end_ms,
            ..word
        };
        assert_eq!(shifted.start_ms, 5_100);
        assert_eq!(shifted.end_ms, 5_400);
    }
}
