/// Meeting-relative clock. Seeded by the first admitted frame; all timestamps
/// are quantized to 10 ms slots after that.
#[derive(Debug, Default)]
pub struct MeetingClock {
    origin_ms: Option<i64>,
}

pub const SLOT_MS: i64 = 10;

impl MeetingClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_seeded(&self) -> bool {
        self.origin_ms.is_some()
    }

    /// Meeting-relative time for an adapter timestamp, seeding the clock on
    /// first use. Frames that predate the origin clamp to zero.
    pub fn relative_ms(&mut self, adapter_ts_ms: i64) -> i64 {
        let origin = *self.origin_ms.get_or_insert(adapter_ts_ms);
        (adapter_ts_ms - origin).max(0)
    }

    pub fn quantize(&mut self, adapter_ts_ms: i64) -> i64 {
        let rel = self.relative_ms(adapter_ts_ms);
        (rel / SLOT_MS) * SLOT_MS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_frame_seeds_the_origin() {
        let mut clock = MeetingClock::new();
        assert!(!clock.is_seeded());
        assert_eq!(clock.relative_ms(5_000), 0);
        assert!(clock.is_seeded());
        assert_eq!(clock.relative_ms(5_250), 250);
    }

    #[test]
    fn timestamps_quantize_to_ten_ms_slots() {
        let mut clock = MeetingClock::new();
        clock.relative_ms(1_000);
        assert_eq!(clock.quantize(1_004), 0);
        assert_eq!(clock.quantize(1_017), 10);
        assert_eq!(clock.quantize(1_999), 990);
    }

    #[test]
    fn frames_before_origin_clamp_to_zero() {
        let mut clock = MeetingClock::new();
        clock.relative_ms(1_000);
        assert_eq!(clock.relative_ms(900), 0);
    }
}
