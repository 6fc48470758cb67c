use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::matrix::Note;
use crate::reader::{EventKind, TimedEvent};

/// Anomaly counters collected while pairing note events.
///
/// None of these abort a parse. They are reported in aggregate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchStats {
    /// Note-starts still open at end of track, dropped.
    pub unterminated: usize,
    /// Note-starts overwritten by a later start on the same key (last-start-wins).
    pub collisions: usize,
    /// Note-ends with no open start on their key.
    pub orphan_note_offs: usize,
    /// Start and end on the same tick; no duration, dropped.
    pub zero_length: usize,
}

impl MatchStats {
    pub fn total(&self) -> usize {
        self.unterminated + self.collisions + self.orphan_note_offs + self.zero_length
    }

    pub fn merge(&mut self, other: &MatchStats) {
        self.unterminated += other.unterminated;
        self.collisions += other.collisions;
        self.orphan_note_offs += other.orphan_note_offs;
        self.zero_length += other.zero_length;
    }
}

/// Pairs note-starts with note-ends for a single track.
///
/// Keyed by `(channel, pitch)`. A second start on an open key replaces the
/// pending one and the earlier start is dropped.
#[derive(Debug)]
pub struct NoteMatcher {
    track: usize,
    open: HashMap<(u8, u8), (u64, u8)>,
    notes: Vec<Note>,
    stats: MatchStats,
}

impl NoteMatcher {
    pub fn new(track: usize) -> Self {
        Self {
            track,
            open: HashMap::new(),
            notes: Vec::new(),
            stats: MatchStats::default(),
        }
    }

    /// Feed the next event in track order.
    pub fn push(&mut self, event: &TimedEvent) {
        let Some(key) = event.kind.note_key() else {
            return;
        };

        if let EventKind::NoteOn { velocity, .. } = event.kind {
            if velocity > 0 {
                if let Some((prior, _)) = self.open.insert(key, (event.tick, velocity)) {
                    self.stats.collisions += 1;
                    debug!(
                        track = self.track,
                        channel = key.0,
                        pitch = key.1,
                        dropped_onset = prior,
                        onset = event.tick,
                        "note-on collision, keeping later start"
                    );
                }
                return;
            }
        }

        match self.open.remove(&key) {
            Some((onset, _)) if event.tick == onset => {
                self.stats.zero_length += 1;
            }
            Some((onset, velocity)) => {
                self.notes.push(Note::new(
                    key.0,
                    key.1,
                    velocity,
                    onset,
                    event.tick - onset,
                    self.track,
                ));
            }
            None => {
                self.stats.orphan_note_offs += 1;
            }
        }
    }

    /// Close the track. Notes still open are discarded, never given a
    /// default duration.
    pub fn finish(mut self) -> (Vec<Note>, MatchStats) {
        self.stats.unterminated += self.open.len();
        if !self.open.is_empty() {
            debug!(
                track = self.track,
                count = self.open.len(),
                "dropping unterminated notes"
            );
        }
        (self.notes, self.stats)
    }

    /// Match a whole track.
    pub fn match_track(track: usize, events: &[TimedEvent]) -> (Vec<Note>, MatchStats) {
        let mut matcher = Self::new(track);
        for event in events {
            matcher.push(event);
        }
        matcher.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::read_tracks;

    fn on(pitch: u8, velocity: u8) -> EventKind {
        EventKind::NoteOn {
            channel: 0,
            pitch,
            velocity,
        }
    }

    fn off(pitch: u8) -> EventKind {
        EventKind::NoteOff { channel: 0, pitch }
    }

    fn run(events: Vec<(i64, EventKind)>) -> (Vec<Note>, MatchStats) {
        let tracks = read_tracks(vec![events]).unwrap();
        NoteMatcher::match_track(0, &tracks[0])
    }

    #[test]
    fn pairs_on_and_off() {
        let (notes, stats) = run(vec![(0, on(64, 80)), (480, off(64))]);
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].onset_tick, 0);
        assert_eq!(notes[0].duration_ticks, 480);
        assert_eq!(notes[0].velocity, 80);
        assert_eq!(stats, MatchStats::default());
    }

    #[test]
    fn zero_velocity_on_closes_like_off() {
        let (a, _) = run(vec![(0, on(64, 80)), (480, off(64))]);
        let (b, _) = run(vec![(0, on(64, 80)), (480, on(64, 0))]);
        assert_eq!(a, b);
    }

    #[test]
    fn unterminated_note_dropped_and_counted_once() {
        let (notes, stats) = run(vec![
            (0, on(60, 100)),
            (0, on(72, 100)),
            (240, off(72)),
            (240, EventKind::EndOfTrack),
        ]);
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].pitch, 72);
        assert!(notes.iter().all(|n| n.pitch != 60));
        assert_eq!(stats.unterminated, 1);
    }

    #[test]
    fn collision_keeps_last_start() {
        let (notes, stats) = run(vec![
            (0, on(60, 90)),
            (100, on(60, 50)),
            (100, off(60)),
        ]);
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].onset_tick, 100);
        assert_eq!(notes[0].duration_ticks, 100);
        assert_eq!(notes[0].velocity, 50);
        assert_eq!(stats.collisions, 1);
        assert_eq!(stats.unterminated, 0);
    }

    #[test]
    fn orphan_and_zero_length_counted() {
        let (notes, stats) = run(vec![(0, off(60)), (10, on(61, 20)), (0, off(61))]);
        assert!(notes.is_empty());
        assert_eq!(stats.orphan_note_offs, 1);
        assert_eq!(stats.zero_length, 1);
        assert_eq!(stats.total(), 2);
    }

    #[test]
    fn keys_are_per_channel() {
        let tracks = read_tracks(vec![vec![
            (
                0,
                EventKind::NoteOn {
                    channel: 0,
                    pitch: 60,
                    velocity: 10,
                },
            ),
            (
                0,
                EventKind::NoteOn {
                    channel: 1,
                    pitch: 60,
                    velocity: 20,
                },
            ),
            (10, EventKind::NoteOff { channel: 1, pitch: 60 }),
            (10, EventKind::NoteOff { channel: 0, pitch: 60 }),
        ]])
        .unwrap();
        let (notes, stats) = NoteMatcher::match_track(3, &tracks[0]);
        assert_eq!(stats.collisions, 0);
        assert_eq!(notes.len(), 2);
        assert_eq!((notes[0].channel, notes[0].duration_ticks), (1, 10));
        assert_eq!((notes[1].channel, notes[1].duration_ticks), (0, 20));
        assert!(notes.iter().all(|n| n.track == 3));
    }

    #[test]
    fn deterministic_for_same_input() {
        let events = vec![
            (0, on(60, 90)),
            (0, on(64, 90)),
            (10, on(60, 80)),
            (10, off(64)),
            (10, off(60)),
        ];
        assert_eq!(run(events.clone()), run(events));
    }
}
