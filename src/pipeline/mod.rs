use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use log::{info, warn};
use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::shared::models::{BotSettings, RecordingFormat, RecordingType, ViewLayout};

pub mod clock;
pub mod compositor;
pub mod encoder;
pub mod mixer;

use clock::MeetingClock;
use compositor::{TileInfo, TileSource, VideoCompositor, SPEAKER_RMS_WINDOW_MS};
use encoder::{AudioSink, Encoder, EncoderConfig, EncoderError, VideoSink};
use mixer::{frame_to_bytes, AudioMixer, FRAME_MS, SAMPLES_PER_FRAME};

/// How much encoded-video backlog we tolerate before dropping oldest frames.
const VIDEO_BACKLOG_MS: u64 = 500;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub recording_type: RecordingType,
    pub format: RecordingFormat,
    pub view_layout: ViewLayout,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub work_dir: PathBuf,
    pub per_participant_audio: bool,
}

impl PipelineConfig {
    pub fn from_settings(settings: &BotSettings, work_dir: PathBuf) -> Self {
        Self {
            recording_type: settings.recording_type,
            format: settings.recording_format,
            view_layout: settings.view_layout,
            width: 1280,
            height: 720,
            fps: 25,
            work_dir,
            per_participant_audio: settings.per_participant_audio,
        }
    }
}

#[derive(Debug)]
pub struct PipelineStats {
    pub output_path: Option<PathBuf>,
    pub duration_ms: i64,
    pub frames_dropped: i64,
    pub captured_frames: bool,
    /// Per-participant MP3 sidecars, by platform uuid.
    pub participant_audio: Vec<(String, PathBuf)>,
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Encoder(#[from] EncoderError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Bounded video frame queue between the compositor and the encoder writer
/// task. When the encoder falls behind, the oldest frames are discarded and
/// counted; audio is never dropped.
struct VideoQueue {
    frames: std::sync::Mutex<VecDeque<Bytes>>,
    notify: Notify,
    capacity: usize,
    dropped: Arc<AtomicI64>,
    closed: AtomicBool,
}

impl VideoQueue {
    fn new(capacity: usize, dropped: Arc<AtomicI64>) -> Arc<Self> {
        Arc::new(Self {
            frames: std::sync::Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
            dropped,
            closed: AtomicBool::new(false),
        })
    }

    fn push(&self, frame: Bytes) {
        {
            let mut frames = self.frames.lock().expect("video queue poisoned");
            while frames.len() >= self.capacity {
                frames.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            frames.push_back(frame);
        }
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<Bytes> {
        self.frames.lock().expect("video queue poisoned").pop_front()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn notified(&self) {
        self.notify.notified().await;
    }
}

async fn run_video_writer(queue: Arc<VideoQueue>, mut sink: VideoSink) {
    loop {
        while let Some(frame) = queue.pop() {
            if let Err(e) = sink.write(&frame).await {
                warn!("Video writer stopping: {}", e);
                return;
            }
        }
        if queue.is_closed() {
            return;
        }
        queue.notified().await;
    }
}

/// Per-bot media pipeline: meeting clock, per-participant audio rings, the
/// mixer, the compositor and the ffmpeg muxer. Driven by the controller with
/// one `tick` per 10 ms slot.
pub struct Pipeline {
    config: PipelineConfig,
    clock: MeetingClock,
    mixer: AudioMixer,
    compositor: VideoCompositor,
    encoder: Option<Encoder>,
    audio_sink: Option<AudioSink>,
    video_queue: Option<Arc<VideoQueue>>,
    video_task: Option<JoinHandle<()>>,
    frames_dropped: Arc<AtomicI64>,
    participants: Vec<TileInfo>,
    paused: bool,
    recording: bool,
    captured_frames: bool,
    tick_count: u64,
    pcm_taps: HashMap<String, (PathBuf, tokio::fs::File)>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        let compositor = VideoCompositor::new(config.view_layout, config.width, config.height);
        Self {
            config,
            clock: MeetingClock::new(),
            mixer: AudioMixer::new(),
            compositor,
            encoder: None,
            audio_sink: None,
            video_queue: None,
            video_task: None,
            frames_dropped: Arc::new(AtomicI64::new(0)),
            participants: Vec::new(),
            paused: false,
            recording: false,
            captured_frames: false,
            tick_count: 0,
            pcm_taps: HashMap::new(),
        }
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn output_extension(&self) -> &'static str {
        self.config.format.extension()
    }

    pub async fn start_recording(&mut self) -> Result<(), PipelineError> {
        if self.recording {
            return Ok(());
        }
        if self.config.recording_type == RecordingType::NoRecording {
            self.recording = true;
            return Ok(());
        }
        tokio::fs::create_dir_all(&self.config.work_dir).await?;
        let output_path = self
            .config
            .work_dir
            .join(format!("recording.{}", self.config.format.extension()));
        let mut encoder = Encoder::start(&EncoderConfig {
            recording_type: self.config.recording_type,
            format: self.config.format,
            width: self.config.width,
            height: self.config.height,
            fps: self.config.fps,
            output_path,
        })
        .await?;

        let (audio_sink, video_sink) = encoder.split_sinks();
        self.audio_sink = audio_sink;
        if let Some(sink) = video_sink {
            let capacity =
                (VIDEO_BACKLOG_MS as usize / (1000 / self.config.fps as usize)).max(1);
            let queue = VideoQueue::new(capacity, Arc::clone(&self.frames_dropped));
            self.video_task = Some(tokio::spawn(run_video_writer(Arc::clone(&queue), sink)));
            self.video_queue = Some(queue);
        }
        self.encoder = Some(encoder);
        self.recording = true;
        info!("Pipeline recording started ({:?})", self.config.format);
        Ok(())
    }

    /// Pause produces silence and a frozen frame in the output; the file is
    /// never cut.
    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    pub fn participant_joined(&mut self, uuid: &str, display_name: &str) {
        if self.participants.iter().any(|p| p.uuid == uuid) {
            return;
        }
        self.participants.push(TileInfo {
            uuid: uuid.to_string(),
            display_name: display_name.to_string(),
        });
    }

    pub fn participant_left(&mut self, uuid: &str) {
        self.participants.retain(|p| p.uuid != uuid);
        self.mixer.remove_participant(uuid);
        self.compositor.remove_participant(uuid);
    }

    /// Route one PCM frame into the mixer and the per-participant tap.
    /// Returns the meeting-relative timestamp for downstream consumers.
    pub async fn ingest_audio(
        &mut self,
        uuid: &str,
        pcm_s16le: &[u8],
        adapter_ts_ms: i64,
    ) -> Result<i64, PipelineError> {
        let relative_ms = self.clock.relative_ms(adapter_ts_ms);
        if self.paused {
            return Ok(relative_ms);
        }
        self.mixer.push_bytes(uuid, pcm_s16le);
        if self.recording {
            self.captured_frames = true;
            if self.config.per_participant_audio {
                self.tap_participant_audio(uuid, pcm_s16le).await?;
            }
        }
        Ok(relative_ms)
    }

    pub fn ingest_video(
        &mut self,
        uuid: &str,
        width: u32,
        height: u32,
        data: Bytes,
        adapter_ts_ms: i64,
    ) -> i64 {
        let relative_ms = self.clock.relative_ms(adapter_ts_ms);
        if !self.paused {
            self.compositor.ingest(uuid, TileSource { width, height, data });
            if self.recording {
                self.captured_frames = true;
            }
        }
        relative_ms
    }

    async fn tap_participant_audio(
        &mut self,
        uuid: &str,
        pcm: &[u8],
    ) -> Result<(), PipelineError> {
        if !self.pcm_taps.contains_key(uuid) {
            let path = self.config.work_dir.join(format!("{}.pcm", uuid));
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;
            self.pcm_taps.insert(uuid.to_string(), (path, file));
        }
        let (_, file) = self.pcm_taps.get_mut(uuid).expect("tap just inserted");
        file.write_all(pcm).await?;
        Ok(())
    }

    /// One 10 ms pipeline step: mix an audio frame (silence while paused),
    /// refresh the active speaker, and at the video cadence enqueue a
    /// composed (or frozen) frame.
    pub async fn tick(&mut self) -> Result<(), PipelineError> {
        self.tick_count += 1;
        if !self.recording {
            return Ok(());
        }
        let now_ms = (self.tick_count * FRAME_MS as u64) as i64;

        let audio_frame = if self.paused {
            [0i16; SAMPLES_PER_FRAME]
        } else {
            self.mixer.mix_frame()
        };
        if let Some(sink) = self.audio_sink.as_mut() {
            sink.write(&frame_to_bytes(&audio_frame)).await?;
        }

        if !self.paused {
            self.compositor
                .update_active_speaker(&self.mixer.rms_by_participant(SPEAKER_RMS_WINDOW_MS), now_ms);
        }

        if let Some(queue) = &self.video_queue {
            let ticks_per_frame = (1000 / self.config.fps as u64 / FRAME_MS as u64).max(1);
            if self.tick_count % ticks_per_frame == 0 {
                let frame = if self.paused {
                    match self.compositor.last_output() {
                        Some(frozen) => frozen,
                        None => self.compositor.compose(&self.participants),
                    }
                } else {
                    self.compositor.compose(&self.participants)
                };
                queue.push(frame);
            }
        }
        Ok(())
    }

    pub fn frames_dropped(&self) -> i64 {
        self.frames_dropped.load(Ordering::Relaxed)
    }

    /// Drain and close everything; transcode per-participant taps; return
    /// what the uploader needs.
    pub async fn finalize(mut self) -> Result<PipelineStats, PipelineError> {
        if let Some(sink) = self.audio_sink.take() {
            sink.close().await;
        }
        if let Some(queue) = self.video_queue.take() {
            queue.close();
        }
        if let Some(task) = self.video_task.take() {
            let _ = task.await;
        }

        let (output_path, duration_ms) = match self.encoder.take() {
            Some(encoder) => {
                let stats = encoder.finalize().await?;
                (Some(stats.output_path), stats.duration_ms)
            }
            None => (None, 0),
        };

        let mut participant_audio = Vec::new();
        for (uuid, (pcm_path, file)) in self.pcm_taps.drain() {
            drop(file);
            let mp3_path = pcm_path.with_extension("mp3");
            match encoder::encode_participant_audio(&pcm_path, &mp3_path).await {
                Ok(()) => participant_audio.push((uuid, mp3_path)),
                Err(e) => warn!("Per-participant encode failed for {}: {}", uuid, e),
            }
            let _ = tokio::fs::remove_file(&pcm_path).await;
        }

        Ok(PipelineStats {
            output_path,
            duration_ms,
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            captured_frames: self.captured_frames,
            participant_audio,
        })
    }

    /// Teardown without finalization, for the fatal-error path.
    pub async fn abort(mut self) {
        if let Some(sink) = self.audio_sink.take() {
            sink.close().await;
        }
        if let Some(queue) = self.video_queue.take() {
            queue.close();
        }
        if let Some(task) = self.video_task.take() {
            task.abort();
        }
        if let Some(encoder) = self.encoder.take() {
            encoder.abort().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> PipelineConfig {
        PipelineConfig {
            recording_type: RecordingType::NoRecording,
            format: RecordingFormat::Mp4,
            view_layout: ViewLayout::GalleryView,
            width: 64,
            height: 36,
            fps: 25,
            work_dir: std::env::temp_dir().join("meetserver-pipeline-test"),
            per_participant_audio: false,
        }
    }

    #[tokio::test]
    async fn no_recording_mode_runs_without_an_encoder() {
        let mut pipeline = Pipeline::new(config());
        pipeline.start_recording().await.unwrap();
        pipeline.participant_joined("p1", "Ada");
        pipeline.ingest_audio("p1", &[0u8; 960], 1_000).await.unwrap();
        pipeline.tick().await.unwrap();
        let stats = pipeline.finalize().await.unwrap();
        assert!(stats.output_path.is_none());
        assert_eq!(stats.frames_dropped, 0);
    }

    #[tokio::test]
    async fn relative_timestamps_are_clock_seeded() {
        let mut pipeline = Pipeline::new(config());
        let first = pipeline.ingest_audio("p1", &[0u8; 4], 10_000).await.unwrap();
        let later = pipeline.ingest_audio("p1", &[0u8; 4], 10_750).await.unwrap();
        assert_eq!(first, 0);
        assert_eq!(later, 750);
    }

    #[tokio::test]
    async fn paused_pipeline_does_not_count_frames() {
        let mut pipeline = Pipeline::new(config());
        pipeline.start_recording().await.unwrap();
        pipeline.pause();
        pipeline.ingest_audio("p1", &[1u8; 960], 0).await.unwrap();
        assert!(!pipeline.captured_frames);
        pipeline.resume();
        pipeline.ingest_audio("p1", &[1u8; 960], 100).await.unwrap();
        assert!(pipeline.captured_frames);
    }

    #[test]
    fn video_queue_drops_oldest_on_backlog() {
        let dropped = Arc::new(AtomicI64::new(0));
        let queue = VideoQueue::new(2, Arc::clone(&dropped));
        queue.push(Bytes::from_static(b"one"));
        queue.push(Bytes::from_static(b"two"));
        queue.push(Bytes::from_static(b"three"));
        assert_eq!(dropped.load(Ordering::Relaxed), 1);
        assert_eq!(queue.pop().unwrap(), Bytes::from_static(b"two"));
    }
}
