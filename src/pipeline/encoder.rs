use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{info, warn};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};

use crate::shared::models::{RecordingFormat, RecordingType};

use super::mixer::SAMPLE_RATE;

#[derive(Debug, Clone)]
pub struct EncoderConfig {
    pub recording_type: RecordingType,
    pub format: RecordingFormat,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub output_path: PathBuf,
}

#[derive(Debug)]
pub struct EncoderStats {
    pub output_path: PathBuf,
    pub duration_ms: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum EncoderError {
    #[error("ffmpeg spawn failed: {0}")]
    Spawn(std::io::Error),
    #[error("ffmpeg exited with {0}")]
    Failed(std::process::ExitStatus),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Muxes the mixed audio stream and composed video frames into the output
/// file by piping raw media into an ffmpeg child: s16le audio on stdin and
/// rgb24 video over a named pipe. Pause intervals are carried by the caller
/// continuing to feed silence and frozen frames, so the output stays one
/// continuous file.
pub struct Encoder {
    child: Child,
    audio_in: Option<ChildStdin>,
    video_in: Option<tokio::fs::File>,
    fifo_path: Option<PathBuf>,
    output_path: PathBuf,
    audio_bytes_written: Arc<AtomicU64>,
}

/// Write half of the audio pipe. Dropping it closes ffmpeg's stdin.
pub struct AudioSink {
    stdin: ChildStdin,
    bytes_written: Arc<AtomicU64>,
}

impl AudioSink {
    pub async fn write(&mut self, pcm_s16le: &[u8]) -> Result<(), EncoderError> {
        self.stdin.write_all(pcm_s16le).await?;
        self.bytes_written
            .fetch_add(pcm_s16le.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    pub async fn close(mut self) {
        let _ = self.stdin.shutdown().await;
    }
}

/// Write half of the video fifo.
pub struct VideoSink {
    pipe: tokio::fs::File,
}

impl VideoSink {
    pub async fn write(&mut self, rgb24: &[u8]) -> Result<(), EncoderError> {
        self.pipe.write_all(rgb24).await?;
        Ok(())
    }
}

impl Encoder {
    pub async fn start(config: &EncoderConfig) -> Result<Self, EncoderError> {
        let with_video = config.recording_type == RecordingType::AudioAndVideo
            && config.format != RecordingFormat::Mp3;

        let fifo_path = if with_video {
            let path = config.output_path.with_extension("video.fifo");
            let _ = tokio::fs::remove_file(&path).await;
            let status = Command::new("mkfifo")
                .arg(&path)
                .status()
                .await
                .map_err(EncoderError::Spawn)?;
            if !status.success() {
                return Err(EncoderError::Spawn(std::io::Error::other(
                    "mkfifo failed for video pipe",
                )));
            }
            Some(path)
        } else {
            None
        };

        let mut cmd = Command::new("ffmpeg");
        cmd.arg("-hide_banner")
            .args(["-loglevel", "error"])
            .arg("-y")
            // Mixed mono PCM from the audio mixer.
            .args(["-f", "s16le"])
            .args(["-ar", &SAMPLE_RATE.to_string()])
            .args(["-ac", "1"])
            .args(["-i", "pipe:0"]);

        if let Some(fifo) = &fifo_path {
            cmd.args(["-f", "rawvideo"])
                .args(["-pix_fmt", "rgb24"])
                .args(["-s", &format!("{}x{}", config.width, config.height)])
                .args(["-r", &config.fps.to_string()])
                .arg("-i")
                .arg(fifo);
        }

        match config.format {
            RecordingFormat::Mp4 => {
                cmd.args(["-c:a", "aac"]);
                if with_video {
                    cmd.args(["-c:v", "libx264"])
                        .args(["-preset", "veryfast"])
                        .args(["-pix_fmt", "yuv420p"]);
                }
                cmd.args(["-movflags", "+faststart"]);
            }
            RecordingFormat::Webm => {
                cmd.args(["-c:a", "libopus"]);
                if with_video {
                    cmd.args(["-c:v", "libvpx-vp9"]).args(["-deadline", "realtime"]);
                }
            }
            RecordingFormat::Mp3 => {
                cmd.args(["-c:a", "libmp3lame"]).args(["-b:a", "128k"]);
            }
        }
        cmd.arg(&config.output_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(EncoderError::Spawn)?;
        let audio_in = child.stdin.take();

        // The fifo write end unblocks once ffmpeg opens its read end.
        let video_in = match &fifo_path {
            Some(path) => Some(
                tokio::fs::OpenOptions::new()
                    .write(true)
                    .open(path)
                    .await?,
            ),
            None => None,
        };

        info!(
            "Encoder started: {:?} -> {}",
            config.format,
            config.output_path.display()
        );
        Ok(Self {
            child,
            audio_in,
            video_in,
            fifo_path,
            output_path: config.output_path.clone(),
            audio_bytes_written: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Detach the write halves so audio and video can be fed from separate
    /// tasks. Both sinks must be dropped before `finalize`, or ffmpeg will
    /// wait forever for more input.
    pub fn split_sinks(&mut self) -> (Option<AudioSink>, Option<VideoSink>) {
        let audio = self.audio_in.take().map(|stdin| AudioSink {
            stdin,
            bytes_written: Arc::clone(&self.audio_bytes_written),
        });
        let video = self.video_in.take().map(|pipe| VideoSink { pipe });
        (audio, video)
    }

    /// Audio timeline length written so far.
    pub fn duration_ms(&self) -> i64 {
        (self.audio_bytes_written.load(Ordering::Relaxed) / 2) as i64 * 1000 / SAMPLE_RATE as i64
    }

    /// Wait for ffmpeg to finalize container atoms, then fsync the result to
    /// disk. The input sinks must already be closed.
    pub async fn finalize(mut self) -> Result<EncoderStats, EncoderError> {
        let duration_ms = self.duration_ms();
        if let Some(mut stdin) = self.audio_in.take() {
            let _ = stdin.shutdown().await;
        }
        if let Some(video) = self.video_in.take() {
            drop(video);
        }
        let status = self.child.wait().await?;
        if let Some(fifo) = &self.fifo_path {
            let _ = tokio::fs::remove_file(fifo).await;
        }
        if !status.success() {
            return Err(EncoderError::Failed(status));
        }
        fsync(&self.output_path).await?;
        info!(
            "Encoder finalized {} ({} ms of audio)",
            self.output_path.display(),
            duration_ms
        );
        Ok(EncoderStats {
            output_path: self.output_path,
            duration_ms,
        })
    }

    /// Best-effort teardown for the fatal-error path: no file finalization.
    pub async fn abort(mut self) {
        if let Err(e) = self.child.kill().await {
            warn!("Failed to kill encoder: {}", e);
        }
        if let Some(fifo) = &self.fifo_path {
            let _ = tokio::fs::remove_file(fifo).await;
        }
    }
}

async fn fsync(path: &Path) -> std::io::Result<()> {
    let file = tokio::fs::File::open(path).await?;
    file.sync_all().await
}

/// Transcode a raw per-participant PCM capture into an MP3 sidecar artifact.
pub async fn encode_participant_audio(
    pcm_path: &Path,
    output_path: &Path,
) -> Result<(), EncoderError> {
    let status = Command::new("ffmpeg")
        .arg("-hide_banner")
        .args(["-loglevel", "error"])
        .arg("-y")
        .args(["-f", "s16le"])
        .args(["-ar", &SAMPLE_RATE.to_string()])
        .args(["-ac", "1"])
        .arg("-i")
        .arg(pcm_path)
        .args(["-c:a", "libmp3lame"])
        .args(["-b:a", "128k"])
        .arg(output_path)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::inherit())
        .status()
        .await
        .map_err(EncoderError::Spawn)?;
    if !status.success() {
        return Err(EncoderError::Failed(status));
    }
    fsync(output_path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_duration_tracks_bytes_written() {
        // One second of 48 kHz mono s16le is 96,000 bytes.
        let bytes: u64 = 96_000;
        let duration_ms = (bytes / 2) as i64 * 1000 / SAMPLE_RATE as i64;
        assert_eq!(duration_ms, 1_000);
    }
}
