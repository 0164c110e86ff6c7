use std::sync::Arc;

use bytes::Bytes;
use diesel::prelude::*;
use log::{info, warn};
use serde_json::json;
use uuid::Uuid;

use crate::pipeline::PipelineStats;
use crate::shared::models::{
    Bot, NewDebugScreenshot, NewRecording, RecordingFormat, RecordingState, TranscriptionState,
};
use crate::shared::schema::{debug_screenshots, recordings};
use crate::shared::utils::{generate_object_id, with_conn, DbPool};
use crate::storage::{debug_screenshot_key, recording_key, BlobStorage};

fn content_type_for(format: RecordingFormat) -> &'static str {
    match format {
        RecordingFormat::Mp4 => "video/mp4",
        RecordingFormat::Mp3 => "audio/mpeg",
        RecordingFormat::Webm => "video/webm",
    }
}

/// Moves finished artifacts into blob storage and settles recording rows.
/// A recording only reaches COMPLETE when frames were captured and the
/// upload succeeded; everything else lands in FAILED.
pub struct ArtifactUploader {
    storage: Arc<dyn BlobStorage>,
    pool: DbPool,
}

impl ArtifactUploader {
    pub fn new(storage: Arc<dyn BlobStorage>, pool: DbPool) -> Self {
        Self { storage, pool }
    }

    pub async fn upload_recording(
        &self,
        bot: &Bot,
        stats: &PipelineStats,
    ) -> anyhow::Result<()> {
        let settings = bot.bot_settings();
        let bot_id = bot.id;

        let recording = with_conn(self.pool.clone(), move |conn| {
            crate::bots::primary_recording(conn, bot_id).map_err(Into::into)
        })
        .await?;
        let Some(recording) = recording else {
            warn!("No primary recording row for bot {}", bot.object_id);
            return Ok(());
        };
        if recording.recording_type == "no_recording" {
            return Ok(());
        }

        let output = match (&stats.output_path, stats.captured_frames) {
            (Some(path), true) => Some(path.clone()),
            _ => None,
        };

        match output {
            Some(path) => {
                let key = recording_key(
                    &bot.object_id,
                    None,
                    settings.recording_format.extension(),
                    settings.file_name.as_deref(),
                );
                match self
                    .storage
                    .put_file(&key, &path, content_type_for(settings.recording_format))
                    .await
                {
                    Ok((etag, bytes)) => {
                        info!(
                            "Uploaded recording for bot {} to {} ({} bytes, etag {})",
                            bot.object_id, key, bytes, etag
                        );
                        let recording_id = recording.id;
                        let duration_ms = stats.duration_ms;
                        let dropped = stats.frames_dropped;
                        with_conn(self.pool.clone(), move |conn| {
                            crate::bots::finalize_recording(
                                conn,
                                recording_id,
                                RecordingState::Complete,
                                Some(&key),
                                Some(bytes),
                                Some(duration_ms),
                            )?;
                            if dropped > 0 {
                                crate::bots::add_dropped_frames(conn, recording_id, dropped)?;
                            }
                            Ok(())
                        })
                        .await?;
                    }
                    Err(e) => {
                        warn!("Upload failed for bot {}: {}", bot.object_id, e);
                        self.fail_recording(recording.id, stats.duration_ms).await?;
                    }
                }
            }
            None => {
                // No frames ever made it into the encoder; the artifact
                // cannot be COMPLETE.
                self.fail_recording(recording.id, stats.duration_ms).await?;
            }
        }

        for (participant_uuid, path) in &stats.participant_audio {
            if let Err(e) = self
                .upload_participant_audio(bot, participant_uuid, path)
                .await
            {
                warn!(
                    "Per-participant upload failed for bot {} / {}: {}",
                    bot.object_id, participant_uuid, e
                );
            }
        }
        Ok(())
    }

    async fn fail_recording(&self, recording_id: Uuid, duration_ms: i64) -> anyhow::Result<()> {
        with_conn(self.pool.clone(), move |conn| {
            crate::bots::finalize_recording(
                conn,
                recording_id,
                RecordingState::Failed,
                None,
                None,
                Some(duration_ms),
            )?;
            Ok(())
        })
        .await
    }

    async fn upload_participant_audio(
        &self,
        bot: &Bot,
        participant_uuid: &str,
        path: &std::path::Path,
    ) -> anyhow::Result<()> {
        let key = recording_key(&bot.object_id, Some(participant_uuid), "mp3", None);
        let (_, bytes) = self.storage.put_file(&key, path, "audio/mpeg").await?;

        let bot_id = bot.id;
        let participant_uuid = participant_uuid.to_string();
        with_conn(self.pool.clone(), move |conn| {
            let row = NewRecording {
                id: Uuid::new_v4(),
                object_id: generate_object_id("rec"),
                bot_id,
                state: RecordingState::Complete.as_str().to_string(),
                transcription_state: TranscriptionState::NotStarted.as_str().to_string(),
                recording_type: "audio_only".to_string(),
                participant_uuid: Some(participant_uuid),
            };
            let inserted: crate::shared::models::Recording =
                diesel::insert_into(recordings::table).values(&row).get_result(conn)?;
            crate::bots::finalize_recording(
                conn,
                inserted.id,
                RecordingState::Complete,
                Some(&key),
                Some(bytes),
                None,
            )?;
            Ok(())
        })
        .await
    }

    /// Debug screenshots from the adapter land under the bot's debug prefix.
    pub async fn upload_debug_screenshot(&self, bot: &Bot, png: Bytes) -> anyhow::Result<()> {
        let object_id = generate_object_id("shot");
        let key = debug_screenshot_key(&bot.object_id, &object_id);
        self.storage.put(&key, png, "image/png").await?;

        let bot_id = bot.id;
        with_conn(self.pool.clone(), move |conn| {
            diesel::insert_into(debug_screenshots::table)
                .values(&NewDebugScreenshot {
                    id: Uuid::new_v4(),
                    object_id,
                    bot_id,
                    storage_key: Some(key),
                    metadata: json!({}),
                })
                .execute(conn)?;
            Ok(())
        })
        .await
    }
}
