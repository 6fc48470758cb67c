//! Tick ↔ seconds ↔ beats conversion over a piecewise tempo map.

use serde::{Deserialize, Serialize};

/// 120 BPM, the MIDI default until the first explicit tempo event.
pub const DEFAULT_TEMPO_USEC: u32 = 500_000;

/// A `set_tempo` change at an absolute tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TempoEvent {
    pub tick: u64,
    pub microseconds_per_beat: u32,
}

impl TempoEvent {
    pub fn new(tick: u64, microseconds_per_beat: u32) -> Self {
        Self {
            tick,
            microseconds_per_beat,
        }
    }

    pub fn bpm(&self) -> f64 {
        60_000_000.0 / self.microseconds_per_beat as f64
    }
}

/// Ordered tempo changes plus the file's resolution.
///
/// Segment `i` runs from `events[i].tick` up to the next change. Before the
/// first change the default tempo applies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TempoMap {
    ticks_per_beat: u16,
    events: Vec<TempoEvent>,
}

impl TempoMap {
    /// Build a tempo map. Events are sorted by tick; several changes at the
    /// same tick collapse to the last one given.
    pub fn new(ticks_per_beat: u16, mut events: Vec<TempoEvent>) -> crate::Result<Self> {
        if ticks_per_beat == 0 {
            return Err(crate::Error::InvalidTiming(
                "ticks per beat must be positive".to_string(),
            ));
        }
        if let Some(bad) = events.iter().find(|e| e.microseconds_per_beat == 0) {
            return Err(crate::Error::InvalidTiming(format!(
                "zero tempo at tick {}",
                bad.tick
            )));
        }

        events.sort_by_key(|e| e.tick);
        // dedup_by keeps the first of a run; reverse so the last given wins
        events.reverse();
        events.dedup_by_key(|e| e.tick);
        events.reverse();

        Ok(Self {
            ticks_per_beat,
            events,
        })
    }

    /// Constant-tempo map.
    pub fn constant(ticks_per_beat: u16, microseconds_per_beat: u32) -> crate::Result<Self> {
        Self::new(
            ticks_per_beat,
            vec![TempoEvent::new(0, microseconds_per_beat)],
        )
    }

    pub fn ticks_per_beat(&self) -> u16 {
        self.ticks_per_beat
    }

    pub fn events(&self) -> &[TempoEvent] {
        &self.events
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Tempo in effect at `tick`.
    pub fn tempo_at(&self, tick: u64) -> u32 {
        self.events
            .iter()
            .rev()
            .find(|e| e.tick <= tick)
            .map(|e| e.microseconds_per_beat)
            .unwrap_or(DEFAULT_TEMPO_USEC)
    }

    pub fn bpm_at(&self, tick: u64) -> f64 {
        60_000_000.0 / self.tempo_at(tick) as f64
    }

    pub fn beats_at(&self, tick: u64) -> f64 {
        tick as f64 / self.ticks_per_beat as f64
    }

    /// Nearest tick to a beat position.
    pub fn tick_at_beats(&self, beats: f64) -> u64 {
        (beats.max(0.0) * self.ticks_per_beat as f64).round() as u64
    }

    fn segment_seconds(&self, ticks: u64, usec: u32) -> f64 {
        ticks as f64 * (usec as f64 / 1e6) / self.ticks_per_beat as f64
    }

    /// Iterate `(start_tick, tempo)` segments including the implicit default
    /// segment before the first change.
    fn segments(&self) -> impl Iterator<Item = (u64, u32)> + '_ {
        let leading = match self.events.first() {
            Some(first) if first.tick == 0 => None,
            _ => Some((0, DEFAULT_TEMPO_USEC)),
        };
        leading
            .into_iter()
            .chain(self.events.iter().map(|e| (e.tick, e.microseconds_per_beat)))
    }

    /// Absolute seconds at `tick`, integrating every tempo segment before it.
    pub fn seconds_at(&self, tick: u64) -> f64 {
        let mut seconds = 0.0;
        let mut segments = self.segments().peekable();

        while let Some((start, usec)) = segments.next() {
            if start >= tick {
                break;
            }
            let end = segments
                .peek()
                .map(|&(next, _)| next.min(tick))
                .unwrap_or(tick);
            seconds += self.segment_seconds(end - start, usec);
        }

        seconds
    }

    /// Seconds covered by `duration` ticks starting at `onset`.
    ///
    /// Integrates across any tempo change inside the span rather than using
    /// the onset tempo throughout.
    pub fn duration_seconds(&self, onset: u64, duration: u64) -> f64 {
        self.seconds_at(onset + duration) - self.seconds_at(onset)
    }

    /// Nearest tick to an absolute time in seconds. Negative input clamps to 0.
    pub fn tick_at_seconds(&self, seconds: f64) -> u64 {
        if seconds <= 0.0 || !seconds.is_finite() {
            return 0;
        }

        let mut elapsed = 0.0;
        let mut segments = self.segments().peekable();

        while let Some((start, usec)) = segments.next() {
            let seconds_per_tick = usec as f64 / 1e6 / self.ticks_per_beat as f64;
            match segments.peek() {
                Some(&(next, _)) => {
                    let span = self.segment_seconds(next - start, usec);
                    if elapsed + span >= seconds {
                        let ticks = (seconds - elapsed) / seconds_per_tick;
                        return start + ticks.round() as u64;
                    }
                    elapsed += span;
                }
                None => {
                    let ticks = (seconds - elapsed) / seconds_per_tick;
                    return start + ticks.round() as u64;
                }
            }
        }

        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: f64, b: f64) {
        assert!((a - b).abs() < 1e-9, "{a} != {b}");
    }

    #[test]
    fn default_tempo_without_events() {
        let map = TempoMap::new(480, vec![]).unwrap();
        assert_eq!(map.tempo_at(0), DEFAULT_TEMPO_USEC);
        assert_close(map.seconds_at(480), 0.5);
        assert_close(map.seconds_at(960), 1.0);
    }

    #[test]
    fn piecewise_integration_across_change() {
        // 120 BPM for one beat, then 60 BPM
        let map = TempoMap::new(
            480,
            vec![TempoEvent::new(0, 500_000), TempoEvent::new(480, 1_000_000)],
        )
        .unwrap();

        assert_close(map.seconds_at(480), 0.5);
        assert_close(map.seconds_at(960), 1.5);
        assert_close(map.seconds_at(720), 1.0);
        // A note spanning the change integrates both tempos
        assert_close(map.duration_seconds(240, 480), 0.25 + 0.5);
    }

    #[test]
    fn default_applies_before_first_change() {
        let map = TempoMap::new(480, vec![TempoEvent::new(960, 1_000_000)]).unwrap();
        assert_close(map.seconds_at(960), 1.0);
        assert_close(map.seconds_at(1440), 2.0);
        assert_eq!(map.tempo_at(959), DEFAULT_TEMPO_USEC);
        assert_eq!(map.tempo_at(960), 1_000_000);
    }

    #[test]
    fn same_tick_changes_keep_last() {
        let map = TempoMap::new(
            96,
            vec![TempoEvent::new(0, 400_000), TempoEvent::new(0, 600_000)],
        )
        .unwrap();
        assert_eq!(map.events().len(), 1);
        assert_eq!(map.tempo_at(0), 600_000);
    }

    #[test]
    fn tick_at_seconds_rounds_to_nearest() {
        let map = TempoMap::constant(480, 500_000).unwrap();
        // One tick is 1/960 s; 0.4 tick rounds down, 0.6 rounds up
        assert_eq!(map.tick_at_seconds(0.4 / 960.0), 0);
        assert_eq!(map.tick_at_seconds(0.6 / 960.0), 1);
        assert_eq!(map.tick_at_seconds(0.5), 480);
        assert_eq!(map.tick_at_seconds(-1.0), 0);
    }

    #[test]
    fn tick_at_seconds_inverts_piecewise_map() {
        let map = TempoMap::new(
            480,
            vec![TempoEvent::new(0, 500_000), TempoEvent::new(480, 1_000_000)],
        )
        .unwrap();
        for tick in [0u64, 100, 480, 481, 700, 960, 5000] {
            assert_eq!(map.tick_at_seconds(map.seconds_at(tick)), tick);
        }
    }

    #[test]
    fn beats_conversion() {
        let map = TempoMap::new(480, vec![]).unwrap();
        assert_close(map.beats_at(720), 1.5);
        assert_eq!(map.tick_at_beats(1.5), 720);
        assert_eq!(map.tick_at_beats(0.0011), 1);
    }

    #[test]
    fn rejects_zero_resolution_and_zero_tempo() {
        assert!(TempoMap::new(0, vec![]).is_err());
        assert!(TempoMap::new(480, vec![TempoEvent::new(0, 0)]).is_err());
    }

    #[test]
    fn bpm_of_event() {
        let ev = TempoEvent::new(0, 500_000);
        assert_close(ev.bpm(), 120.0);
    }
}
