use std::collections::HashMap;

use bytes::Bytes;

use crate::shared::models::ViewLayout;

/// Minimum sustained lead time before the active speaker switches, to avoid
/// flicker when two people alternate quickly.
const SPEAKER_HYSTERESIS_MS: i64 = 1_000;
/// RMS window used to pick the loudest participant.
pub const SPEAKER_RMS_WINDOW_MS: usize = 500;

#[derive(Debug, Clone)]
pub struct TileSource {
    pub width: u32,
    pub height: u32,
    pub data: Bytes,
}

#[derive(Debug, Clone)]
pub struct TileInfo {
    pub uuid: String,
    pub display_name: String,
}

/// Composites per-participant RGB frames into one output frame: either the
/// active speaker full-frame or a gallery grid sized to the participant
/// count. Tiles without video get a name placeholder.
pub struct VideoCompositor {
    layout: ViewLayout,
    width: u32,
    height: u32,
    frames: HashMap<String, TileSource>,
    active_speaker: Option<String>,
    last_switch_ms: i64,
    last_output: Option<Bytes>,
}

impl VideoCompositor {
    pub fn new(layout: ViewLayout, width: u32, height: u32) -> Self {
        Self {
            layout,
            width,
            height,
            frames: HashMap::new(),
            active_speaker: None,
            last_switch_ms: i64::MIN / 2,
            last_output: None,
        }
    }

    pub fn ingest(&mut self, participant_uuid: &str, frame: TileSource) {
        self.frames.insert(participant_uuid.to_string(), frame);
    }

    pub fn remove_participant(&mut self, participant_uuid: &str) {
        self.frames.remove(participant_uuid);
        if self.active_speaker.as_deref() == Some(participant_uuid) {
            self.active_speaker = None;
        }
    }

    pub fn active_speaker(&self) -> Option<&str> {
        self.active_speaker.as_deref()
    }

    /// Track the loudest participant with hysteresis: the crown only moves
    /// after it has been held for `SPEAKER_HYSTERESIS_MS`.
    pub fn update_active_speaker(&mut self, rms_by_participant: &[(String, f32)], now_ms: i64) {
        let loudest = rms_by_participant
            .iter()
            .filter(|(_, rms)| *rms > 0.0)
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(uuid, _)| uuid.clone());
        let Some(loudest) = loudest else { return };

        match &self.active_speaker {
            None => {
                self.active_speaker = Some(loudest);
                self.last_switch_ms = now_ms;
            }
            Some(current) if *current != loudest => {
                if now_ms - self.last_switch_ms >= SPEAKER_HYSTERESIS_MS {
                    self.active_speaker = Some(loudest);
                    self.last_switch_ms = now_ms;
                }
            }
            _ => {}
        }
    }

    /// Produce one output frame. When paused upstream, callers re-send
    /// `last_output` instead of composing.
    pub fn compose(&mut self, participants: &[TileInfo]) -> Bytes {
        let mut canvas = vec![0u8; (self.width * self.height * 3) as usize];
        match self.layout {
            ViewLayout::SpeakerView => self.compose_speaker(&mut canvas, participants),
            ViewLayout::GalleryView => self.compose_gallery(&mut canvas, participants),
        }
        let out = Bytes::from(canvas);
        self.last_output = Some(out.clone());
        out
    }

    pub fn last_output(&self) -> Option<Bytes> {
        self.last_output.clone()
    }

    fn compose_speaker(&self, canvas: &mut [u8], participants: &[TileInfo]) {
        let subject = self
            .active_speaker
            .as_ref()
            .and_then(|uuid| participants.iter().find(|p| &p.uuid == uuid))
            .or_else(|| participants.first());
        let Some(subject) = subject else { return };
        self.draw_tile(canvas, subject, 0, 0, self.width, self.height);
    }

    fn compose_gallery(&self, canvas: &mut [u8], participants: &[TileInfo]) {
        if participants.is_empty() {
            return;
        }
        let (cols, rows) = grid_dimensions(participants.len());
        let tile_w = self.width / cols;
        let tile_h = self.height / rows;
        for (i, participant) in participants.iter().take((cols * rows) as usize).enumerate() {
            let col = i as u32 % cols;
            let row = i as u32 / cols;
            self.draw_tile(canvas, participant, col * tile_w, row * tile_h, tile_w, tile_h);
        }
    }

    fn draw_tile(&self, canvas: &mut [u8], participant: &TileInfo, x: u32, y: u32, w: u32, h: u32) {
        match self.frames.get(&participant.uuid) {
            Some(source) => self.blit_scaled(canvas, source, x, y, w, h),
            None => self.draw_placeholder(canvas, &participant.display_name, x, y, w, h),
        }
    }

    /// Nearest-neighbor scale of the source frame into the tile rectangle.
    fn blit_scaled(&self, canvas: &mut [u8], source: &TileSource, x: u32, y: u32, w: u32, h: u32) {
        if source.width == 0 || source.height == 0 {
            return;
        }
        for ty in 0..h {
            let sy = (ty as u64 * source.height as u64 / h as u64) as u32;
            for tx in 0..w {
                let sx = (tx as u64 * source.width as u64 / w as u64) as u32;
                let src_idx = ((sy * source.width + sx) * 3) as usize;
                let dst_idx = (((y + ty) * self.width + (x + tx)) * 3) as usize;
                if src_idx + 3 <= source.data.len() && dst_idx + 3 <= canvas.len() {
                    canvas[dst_idx..dst_idx + 3].copy_from_slice(&source.data[src_idx..src_idx + 3]);
                }
            }
        }
    }

    /// Solid tile tinted from the name hash, with the participant's initials
    /// rendered centered in a scaled block font.
    fn draw_placeholder(&self, canvas: &mut [u8], name: &str, x: u32, y: u32, w: u32, h: u32) {
        let color = placeholder_color(name);
        for ty in 0..h {
            for tx in 0..w {
                let idx = (((y + ty) * self.width + (x + tx)) * 3) as usize;
                if idx + 3 <= canvas.len() {
                    canvas[idx..idx + 3].copy_from_slice(&color);
                }
            }
        }
        let initials = initials(name);
        if initials.is_empty() {
            return;
        }
        let scale = (h / 16).max(2);
        let glyph_w = 6 * scale;
        let total_w = glyph_w * initials.len() as u32;
        let start_x = x + w.saturating_sub(total_w) / 2;
        let start_y = y + h.saturating_sub(7 * scale) / 2;
        for (i, ch) in initials.chars().enumerate() {
            self.draw_glyph(canvas, ch, start_x + glyph_w * i as u32, start_y, scale);
        }
    }

    fn draw_glyph(&self, canvas: &mut [u8], ch: char, x: u32, y: u32, scale: u32) {
        let Some(rows) = glyph_rows(ch) else { return };
        for (ry, row) in rows.iter().enumerate() {
            for rx in 0..5u32 {
                if row & (0b10000 >> rx) == 0 {
                    continue;
                }
                for sy in 0..scale {
                    for sx in 0..scale {
                        let px = x + rx * scale + sx;
                        let py = y + ry as u32 * scale + sy;
                        let idx = ((py * self.width + px) * 3) as usize;
                        if px < self.width && idx + 3 <= canvas.len() {
                            canvas[idx..idx + 3].copy_from_slice(&[0xF5, 0xF5, 0xF5]);
                        }
                    }
                }
            }
        }
    }
}

/// Grid sized to the participant count: 1, 2, 4, 9 or 16 tiles.
pub fn grid_dimensions(count: usize) -> (u32, u32) {
    match count {
        0 | 1 => (1, 1),
        2 => (2, 1),
        3 | 4 => (2, 2),
        5..=9 => (3, 3),
        _ => (4, 4),
    }
}

fn initials(name: &str) -> String {
    name.split_whitespace()
        .filter_map(|word| word.chars().next())
        .filter(|c| c.is_ascii_alphabetic())
        .map(|c| c.to_ascii_uppercase())
        .take(2)
        .collect()
}

fn placeholder_color(name: &str) -> [u8; 3] {
    let mut hash: u32 = 2166136261;
    for b in name.bytes() {
        hash ^= b as u32;
        hash = hash.wrapping_mul(16777619);
    }
    // Muted palette: keep each channel in the 0x30..0x90 band.
    [
        0x30 + (hash & 0x5F) as u8,
        0x30 + ((hash >> 8) & 0x5F) as u8,
        0x30 + ((hash >> 16) & 0x5F) as u8,
    ]
}

/// 5x7 block font, A-Z.
fn glyph_rows(ch: char) -> Option<[u8; 7]> {
    let rows = match ch {
        'A' => [0x0E, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
        'B' => [0x1E, 0x11, 0x11, 0x1E, 0x11, 0x11, 0x1E],
        'C' => [0x0E, 0x11, 0x10, 0x10, 0x10, 0x11, 0x0E],
        'D' => [0x1E, 0x11, 0x11, 0x11, 0x11, 0x11, 0x1E],
        'E' => [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x1F],
        'F' => [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x10],
        'G' => [0x0E, 0x11, 0x10, 0x17, 0x11, 0x11, 0x0F],
        'H' => [0x11, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
        'I' => [0x0E, 0x04, 0x04, 0x04, 0x04, 0x04, 0x0E],
        'J' => [0x07, 0x02, 0x02, 0x02, 0x02, 0x12, 0x0C],
        'K' => [0x11, 0x12, 0x14, 0x18, 0x14, 0x12, 0x11],
        'L' => [0x10, 0x10, 0x10, 0x10, 0x10, 0x10, 0x1F],
        'M' => [0x11, 0x1B, 0x15, 0x15, 0x11, 0x11, 0x11],
        'N' => [0x11, 0x19, 0x15, 0x13, 0x11, 0x11, 0x11],
        'O' => [0x0E, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        'P' => [0x1E, 0x11, 0x11, 0x1E, 0x10, 0x10, 0x10],
        'Q' => [0x0E, 0x11, 0x11, 0x11, 0x15, 0x12, 0x0D],
        'R' => [0x1E, 0x11, 0x11, 0x1E, 0x14, 0x12, 0x11],
        'S' => [0x0F, 0x10, 0x10, 0x0E, 0x01, 0x01, 0x1E],
        'T' => [0x1F, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04],
        'U' => [0x11, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        'V' => [0x11, 0x11, 0x11, 0x11, 0x11, 0x0A, 0x04],
        'W' => [0x11, 0x11, 0x11, 0x15, 0x15, 0x1B, 0x11],
        'X' => [0x11, 0x0A, 0x04, 0x04, 0x04, 0x0A, 0x11],
        'Y' => [0x11, 0x11, 0x0A, 0x04, 0x04, 0x04, 0x04],
        'Z' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x10, 0x1F],
        _ => return None,
    };
    Some(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tile(uuid: &str, name: &str) -> TileInfo {
        TileInfo {
            uuid: uuid.to_string(),
            display_name: name.to_string(),
        }
    }

    #[test]
    fn grid_sizes_follow_participant_count() {
        assert_eq!(grid_dimensions(1), (1, 1));
        assert_eq!(grid_dimensions(2), (2, 1));
        assert_eq!(grid_dimensions(4), (2, 2));
        assert_eq!(grid_dimensions(7), (3, 3));
        assert_eq!(grid_dimensions(16), (4, 4));
        assert_eq!(grid_dimensions(40), (4, 4));
    }

    #[test]
    fn speaker_switch_respects_hysteresis() {
        let mut compositor = VideoCompositor::new(ViewLayout::SpeakerView, 64, 36);
        compositor.update_active_speaker(&[("a".into(), 0.5), ("b".into(), 0.1)], 0);
        assert_eq!(compositor.active_speaker(), Some("a"));

        // b gets louder immediately, but the switch waits out the hysteresis.
        compositor.update_active_speaker(&[("a".into(), 0.1), ("b".into(), 0.5)], 500);
        assert_eq!(compositor.active_speaker(), Some("a"));
        compositor.update_active_speaker(&[("a".into(), 0.1), ("b".into(), 0.5)], 1_200);
        assert_eq!(compositor.active_speaker(), Some("b"));
    }

    #[test]
    fn silent_rooms_keep_the_current_speaker() {
        let mut compositor = VideoCompositor::new(ViewLayout::SpeakerView, 64, 36);
        compositor.update_active_speaker(&[("a".into(), 0.5)], 0);
        compositor.update_active_speaker(&[("a".into(), 0.0)], 5_000);
        assert_eq!(compositor.active_speaker(), Some("a"));
    }

    #[test]
    fn compose_produces_full_rgb_frame() {
        let mut compositor = VideoCompositor::new(ViewLayout::GalleryView, 64, 36);
        let frame = compositor.compose(&[tile("a", "Ada Lovelace"), tile("b", "Bob")]);
        assert_eq!(frame.len(), 64 * 36 * 3);
        assert!(compositor.last_output().is_some());
    }

    #[test]
    fn video_tiles_are_scaled_into_place() {
        let mut compositor = VideoCompositor::new(ViewLayout::SpeakerView, 8, 8);
        compositor.ingest(
            "a",
            TileSource {
                width: 2,
                height: 2,
                data: Bytes::from(vec![200u8; 2 * 2 * 3]),
            },
        );
        compositor.update_active_speaker(&[("a".into(), 0.4)], 0);
        let frame = compositor.compose(&[tile("a", "Ada")]);
        assert!(frame.iter().all(|&b| b == 200));
    }

    #[test]
    fn placeholder_fills_tile_for_video_less_participants() {
        let mut compositor = VideoCompositor::new(ViewLayout::SpeakerView, 32, 32);
        let frame = compositor.compose(&[tile("ghost", "Grace Hopper")]);
        // Not black: the placeholder tint and initials were drawn.
        assert!(frame.iter().any(|&b| b != 0));
    }

    #[test]
    fn initials_come_from_first_two_words() {
        assert_eq!(initials("Grace Hopper"), "GH");
        assert_eq!(initials("plato"), "P");
        assert_eq!(initials("Jean-Luc Picard Senior"), "JP");
        assert_eq!(initials(""), "");
    }
}
