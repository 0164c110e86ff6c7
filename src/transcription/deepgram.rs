use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, warn};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::provider::{
    ProviderEvent, ProviderWord, Session, SessionSink, TranscriptionError, TranscriptionProvider,
};
use crate::shared::models::TranscriptionFailureReason;

const DEEPGRAM_URL: &str = "wss://api.deepgram.com/v1/listen";

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

#[derive(Debug, Deserialize)]
struct DgWord {
    word: String,
    start: f64,
    end: f64,
    confidence: f64,
    #[serde(default)]
    punctuated_word: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DgAlternative {
    transcript: String,
    #[serde(default)]
    words: Vec<DgWord>,
}

#[derive(Debug, Deserialize)]
struct DgChannel {
    alternatives: Vec<DgAlternative>,
}

#[derive(Debug, Deserialize)]
struct DgResult {
    #[serde(rename = "type")]
    msg_type: Option<String>,
    channel: Option<DgChannel>,
    is_final: Option<bool>,
    #[serde(default)]
    duration: f64,
    #[serde(default)]
    start: f64,
    #[serde(default)]
    description: Option<String>,
}

/// Deepgram real-time speech-to-text over the listen WebSocket. Linear16
/// audio goes up as binary messages; results come back as JSON with per-word
/// timing.
pub struct DeepgramProvider {
    api_key: String,
    model: String,
}

impl DeepgramProvider {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            model: "nova-2".to_string(),
        }
    }
}

#[async_trait]
impl TranscriptionProvider for DeepgramProvider {
    async fn open(&self, language: &str, sample_rate: u32) -> Result<Session, TranscriptionError> {
        let url = format!(
            "{}?encoding=linear16&sample_rate={}&channels=1&language={}&model={}&punctuate=true&interim_results=true&smart_format=true",
            DEEPGRAM_URL, sample_rate, language, self.model
        );
        let mut request = url
            .into_client_request()
            .map_err(|e| TranscriptionError::Connect(e.to_string()))?;
        let auth = HeaderValue::from_str(&format!("Token {}", self.api_key))
            .map_err(|e| TranscriptionError::Connect(e.to_string()))?;
        request.headers_mut().insert("Authorization", auth);

        let (ws, _) = connect_async(request)
            .await
            .map_err(|e| TranscriptionError::Connect(e.to_string()))?;
        let (ws_sink, ws_stream) = ws.split();

        let (event_tx, event_rx) = mpsc::channel(64);
        tokio::spawn(read_results(ws_stream, event_tx));

        Ok(Session {
            sink: Box::new(DeepgramSink { ws: ws_sink }),
            events: event_rx,
        })
    }
}

async fn read_results(mut stream: WsStream, tx: mpsc::Sender<ProviderEvent>) {
    while let Some(message) = stream.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                let _ = tx
                    .send(ProviderEvent::Error {
                        reason: TranscriptionFailureReason::TranscriptionRequestFailed,
                        detail: e.to_string(),
                    })
                    .await;
                return;
            }
        };
        let result: DgResult = match serde_json::from_str(&text) {
            Ok(result) => result,
            Err(e) => {
                debug!("Unparseable Deepgram message: {}", e);
                continue;
            }
        };
        match result.msg_type.as_deref() {
            Some("Results") => {
                if let Some(event) = to_event(&result) {
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
            Some("Error") => {
                let _ = tx
                    .send(ProviderEvent::Error {
                        reason: TranscriptionFailureReason::TranscriptionRequestFailed,
                        detail: result.description.unwrap_or_else(|| "unknown".into()),
                    })
                    .await;
                return;
            }
            Some("Metadata") | Some("SpeechStarted") | Some("UtteranceEnd") => {}
            other => debug!("Ignoring Deepgram message type {:?}", other),
        }
    }
    let _ = tx.send(ProviderEvent::Closed).await;
}

fn to_event(result: &DgResult) -> Option<ProviderEvent> {
    let alternative = result.channel.as_ref()?.alternatives.first()?;
    if alternative.transcript.is_empty() {
        return None;
    }
    if result.is_final.unwrap_or(false) {
        let words = alternative
            .words
            .iter()
            .map(|w| ProviderWord {
                word: w
                    .punctuated_word
                    .clone()
                    .unwrap_or_else(|| w.word.clone()),
                start_ms: (w.start * 1000.0) as i64,
                end_ms: (w.end * 1000.0) as i64,
                confidence: w.confidence,
            })
            .collect();
        Some(ProviderEvent::Final {
            transcript: alternative.transcript.clone(),
            words,
            start_ms: (result.start * 1000.0) as i64,
            duration_ms: (result.duration * 1000.0) as i64,
        })
    } else {
        Some(ProviderEvent::Partial {
            transcript: alternative.transcript.clone(),
        })
    }
}

struct DeepgramSink {
    ws: WsSink,
}

#[async_trait]
impl SessionSink for DeepgramSink {
    async fn send(&mut self, pcm_s16le: Bytes) -> Result<(), TranscriptionError> {
        self.ws
            .send(Message::Binary(pcm_s16le.to_vec()))
            .await
            .map_err(|_| TranscriptionError::StreamClosed)
    }

    async fn close(&mut self) -> Result<(), TranscriptionError> {
        // CloseStream asks Deepgram to flush pending finals before closing.
        if self
            .ws
            .send(Message::Text("{\"type\":\"CloseStream\"}".to_string()))
            .await
            .is_err()
        {
            warn!("Deepgram close message failed; dropping connection");
        }
        self.ws
            .close()
            .await
            .map_err(|_| TranscriptionError::StreamClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn final_results_carry_word_timings() {
        let raw = r#"{
            "type": "Results",
            "is_final": true,
            "start": 1.5,
            "duration": 2.0,
            "channel": {"alternatives": [{
                "transcript": "hello world",
                "words": [
                    {"word": "hello", "start": 1.5, "end": 2.1, "confidence": 0.98},
                    {"word": "world", "start": 2.2, "end": 2.9, "confidence": 0.95, "punctuated_word": "world."}
                ]
            }]}
        }"#;
        let result: DgResult = serde_json::from_str(raw).unwrap();
        match to_event(&result).unwrap() {
            ProviderEvent::Final {
                transcript,
                words,
                start_ms,
                duration_ms,
            } => {
                assert_eq!(transcript, "hello world");
                assert_eq!(start_ms, 1500);
                assert_eq!(duration_ms, 2000);
                assert_eq!(words.len(), 2);
                assert_eq!(words[0].start_ms, 1500);
                assert_eq!(words[1].word, "world.");
            }
            other => panic!("expected final, got {other:?}"),
        }
    }

    #[test]
    fn interim_results_become_partials() {
        let raw = r#"{
            "type": "Results",
            "is_final": false,
            "channel": {"alternatives": [{"transcript": "hel", "words": []}]}
        }"#;
        let result: DgResult = serde_json::from_str(raw).unwrap();
        assert!(matches!(
            to_event(&result),
            Some(ProviderEvent::Partial { .. })
        ));
    }

    #[test]
    fn empty_transcripts_are_suppressed() {
        let raw = r#"{
            "type": "Results",
            "is_final": true,
            "channel": {"alternatives": [{"transcript": "", "words": []}]}
        }"#;
        let result: DgResult = serde_json::from_str(raw).unwrap();
        assert!(to_event(&result).is_none());
    }
}
