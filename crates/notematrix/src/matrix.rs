use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::matcher::{MatchStats, NoteMatcher};
use crate::orchestration::Assignment;
use crate::reader::{read_smf, ControlPayload, EventKind, MetaPayload, RawSmf, TimedEvent};
use crate::tempo::{TempoEvent, TempoMap};
use crate::{Error, Result};

/// A closed interval of sounding pitch with absolute tick timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    /// Source MIDI channel (0-15).
    pub channel: u8,
    pub pitch: u8,
    /// Note-on velocity (1-127).
    pub velocity: u8,
    pub onset_tick: u64,
    /// Always positive.
    pub duration_ticks: u64,
    /// Index of the source track.
    pub track: usize,
    /// Set by the orchestrator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignment: Option<Assignment>,
}

impl Note {
    pub fn new(
        channel: u8,
        pitch: u8,
        velocity: u8,
        onset_tick: u64,
        duration_ticks: u64,
        track: usize,
    ) -> Self {
        Self {
            channel,
            pitch,
            velocity,
            onset_tick,
            duration_ticks,
            track,
            assignment: None,
        }
    }

    pub fn end_tick(&self) -> u64 {
        self.onset_tick + self.duration_ticks
    }

    /// Channel the writer puts this note on (0-15).
    pub fn output_channel(&self) -> u8 {
        match &self.assignment {
            Some(a) => a.new_channel.saturating_sub(1),
            None => self.channel,
        }
    }
}

/// Derived timing of a note under a tempo map.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NoteTiming {
    pub onset_beats: f64,
    pub duration_beats: f64,
    pub onset_seconds: f64,
    pub duration_seconds: f64,
}

/// A meta, sysex or escape event preserved verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaEvent {
    pub tick: u64,
    /// Source track; the writer puts the event back there.
    pub track: usize,
    pub payload: MetaPayload,
}

/// A program change at its source position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramEvent {
    pub tick: u64,
    pub track: usize,
    pub channel: u8,
    pub program: u8,
}

/// A controller, bend or aftertouch message at its source position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlEvent {
    pub tick: u64,
    pub track: usize,
    pub payload: ControlPayload,
}

/// Which pipeline state a matrix is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Parsed,
    Orchestrated,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Parsed => f.write_str("parsed"),
            Stage::Orchestrated => f.write_str("orchestrated"),
        }
    }
}

/// A note given in seconds, as produced by external score parsers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimedNoteRecord {
    pub pitch: u8,
    pub start: f64,
    pub end: f64,
    pub velocity: u8,
    #[serde(default)]
    pub channel: u8,
}

/// Records dropped by [`NoteMatrix::from_timed_notes`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimedNoteStats {
    /// Duration rounded to zero ticks.
    pub too_short: usize,
    /// Pitch above 127 or channel above 15.
    pub out_of_range: usize,
}

/// Summary of one parse, including recovered anomalies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseReport {
    pub tracks: usize,
    pub events: usize,
    pub notes: usize,
    pub tempo_changes: usize,
    pub meta_events: usize,
    pub matching: MatchStats,
    pub program_changes: usize,
    /// Controllers, pitch bends and aftertouch.
    pub control_events: usize,
}

impl ParseReport {
    pub fn has_anomalies(&self) -> bool {
        self.matching.total() > 0
    }
}

impl fmt::Display for ParseReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} notes from {} tracks ({} events), {} tempo changes, {} meta events",
            self.notes, self.tracks, self.events, self.tempo_changes, self.meta_events
        )?;
        if self.has_anomalies() {
            write!(
                f,
                "; recovered: {} unterminated, {} collisions, {} orphan note-offs, {} zero-length",
                self.matching.unterminated,
                self.matching.collisions,
                self.matching.orphan_note_offs,
                self.matching.zero_length
            )?;
        }
        if self.control_events > 0 {
            write!(
                f,
                ", {} controller/bend/aftertouch events",
                self.control_events
            )?;
        }
        Ok(())
    }
}

/// The canonical intermediate representation of a MIDI file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteMatrix {
    /// SMF format: 0, 1 or 2.
    pub format: u8,
    pub tempo: TempoMap,
    /// Sorted by onset, then pitch, then channel.
    pub notes: Vec<Note>,
    /// Sorted by tick; ties keep source order.
    pub meta: Vec<MetaEvent>,
    /// Sorted by tick; ties keep source order.
    pub program_changes: Vec<ProgramEvent>,
    /// Sorted by tick; ties keep source order.
    pub controls: Vec<ControlEvent>,
    /// Number of source tracks, including ones that hold no notes.
    #[serde(default = "NoteMatrix::default_track_count")]
    pub track_count: usize,
}

impl NoteMatrix {
    /// An empty matrix with no tempo changes.
    pub fn new(format: u8, ticks_per_beat: u16) -> Result<Self> {
        Ok(Self {
            format,
            tempo: TempoMap::new(ticks_per_beat, Vec::new())?,
            notes: Vec::new(),
            meta: Vec::new(),
            program_changes: Vec::new(),
            controls: Vec::new(),
            track_count: 1,
        })
    }

    fn default_track_count() -> usize {
        1
    }

    pub fn ticks_per_beat(&self) -> u16 {
        self.tempo.ticks_per_beat()
    }

    /// Parse SMF bytes into a matrix.
    pub fn from_bytes(bytes: &[u8]) -> Result<(Self, ParseReport)> {
        Self::from_raw(read_smf(bytes)?)
    }

    /// Read and parse a file from disk.
    pub fn read_file(path: &Path) -> Result<(Self, ParseReport)> {
        let bytes = std::fs::read(path).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let (matrix, report) = Self::from_bytes(&bytes)?;

        debug!(path = %path.display(), "{report}");
        if report.has_anomalies() {
            warn!(
                path = %path.display(),
                unterminated = report.matching.unterminated,
                collisions = report.matching.collisions,
                orphan_note_offs = report.matching.orphan_note_offs,
                zero_length = report.matching.zero_length,
                "recovered note anomalies"
            );
        }

        Ok((matrix, report))
    }

    /// Build a matrix from already-classified tracks.
    pub fn from_raw(raw: RawSmf) -> Result<(Self, ParseReport)> {
        let mut report = ParseReport {
            tracks: raw.tracks.len(),
            ..Default::default()
        };
        let mut notes = Vec::new();
        let mut tempo_events = Vec::new();
        let mut meta = Vec::new();
        let mut program_changes = Vec::new();
        let mut controls = Vec::new();

        for (track, events) in raw.tracks.iter().enumerate() {
            report.events += events.len();
            collect_track(
                track,
                events,
                &mut tempo_events,
                &mut meta,
                &mut program_changes,
                &mut controls,
            );

            let (track_notes, stats) = NoteMatcher::match_track(track, events);
            notes.extend(track_notes);
            report.matching.merge(&stats);
        }

        // Format 1 files may repeat the tempo map in several tracks
        tempo_events.sort_by_key(|t: &TempoEvent| t.tick);
        tempo_events.dedup();
        meta.sort_by_key(|m: &MetaEvent| m.tick);
        program_changes.sort_by_key(|p: &ProgramEvent| p.tick);
        controls.sort_by_key(|c: &ControlEvent| c.tick);

        let mut matrix = Self {
            format: raw.format,
            tempo: TempoMap::new(raw.ticks_per_beat, tempo_events)?,
            notes,
            meta,
            program_changes,
            controls,
            track_count: raw.tracks.len().max(1),
        };
        matrix.sort();

        report.notes = matrix.notes.len();
        report.tempo_changes = matrix.tempo.events().len();
        report.meta_events = matrix.meta.len();
        report.program_changes = matrix.program_changes.len();
        report.control_events = matrix.controls.len();

        Ok((matrix, report))
    }

    /// Build a matrix from notes timed in seconds.
    ///
    /// Times convert to the nearest tick under `tempo`. Records whose
    /// duration rounds to zero ticks, or whose pitch or channel is out of
    /// MIDI range, are dropped and counted.
    pub fn from_timed_notes(
        tempo: TempoMap,
        records: &[TimedNoteRecord],
    ) -> (Self, TimedNoteStats) {
        let mut stats = TimedNoteStats::default();
        let notes = records
            .iter()
            .filter_map(|r| {
                if r.pitch > 127 || r.channel > 15 {
                    stats.out_of_range += 1;
                    return None;
                }
                let onset = tempo.tick_at_seconds(r.start);
                let end = tempo.tick_at_seconds(r.end);
                if end <= onset {
                    stats.too_short += 1;
                    return None;
                }
                Some(Note::new(
                    r.channel,
                    r.pitch,
                    r.velocity.clamp(1, 127),
                    onset,
                    end - onset,
                    0,
                ))
            })
            .collect();

        if stats.too_short > 0 {
            warn!(dropped = stats.too_short, "timed notes shorter than one tick dropped");
        }
        if stats.out_of_range > 0 {
            warn!(
                dropped = stats.out_of_range,
                "timed notes with pitch above 127 or channel above 15 dropped"
            );
        }

        let mut matrix = Self {
            format: 1,
            tempo,
            notes,
            meta: Vec::new(),
            program_changes: Vec::new(),
            controls: Vec::new(),
            track_count: 1,
        };
        matrix.sort();
        (matrix, stats)
    }

    /// Program in effect on each source channel at the end of the file.
    pub fn programs(&self) -> BTreeMap<u8, u8> {
        self.program_changes
            .iter()
            .map(|p| (p.channel, p.program))
            .collect()
    }

    /// Restore canonical order: onset, then pitch, then channel.
    pub fn sort(&mut self) {
        self.notes.sort_by(|a, b| {
            a.onset_tick
                .cmp(&b.onset_tick)
                .then(a.pitch.cmp(&b.pitch))
                .then(a.channel.cmp(&b.channel))
        });
    }

    /// Detect whether the matrix has been orchestrated.
    pub fn stage(&self) -> Result<Stage> {
        let assigned = self.notes.iter().filter(|n| n.assignment.is_some()).count();
        if assigned == 0 {
            Ok(Stage::Parsed)
        } else if assigned == self.notes.len() {
            Ok(Stage::Orchestrated)
        } else {
            Err(Error::PartialAssignment {
                assigned,
                total: self.notes.len(),
            })
        }
    }

    pub fn timing(&self, note: &Note) -> NoteTiming {
        let tpb = self.ticks_per_beat() as f64;
        NoteTiming {
            onset_beats: note.onset_tick as f64 / tpb,
            duration_beats: note.duration_ticks as f64 / tpb,
            onset_seconds: self.tempo.seconds_at(note.onset_tick),
            duration_seconds: self
                .tempo
                .duration_seconds(note.onset_tick, note.duration_ticks),
        }
    }

    /// Last tick touched by any note, meta or tempo event.
    pub fn end_tick(&self) -> u64 {
        let notes = self.notes.iter().map(Note::end_tick).max().unwrap_or(0);
        let meta = self.meta.last().map(|m| m.tick).unwrap_or(0);
        let tempo = self.tempo.events().last().map(|t| t.tick).unwrap_or(0);
        let programs = self.program_changes.last().map(|p| p.tick).unwrap_or(0);
        let controls = self.controls.last().map(|c| c.tick).unwrap_or(0);
        notes.max(meta).max(tempo).max(programs).max(controls)
    }

    pub fn duration_seconds(&self) -> f64 {
        self.tempo.seconds_at(self.end_tick())
    }
}

fn collect_track(
    track: usize,
    events: &[TimedEvent],
    tempo: &mut Vec<TempoEvent>,
    meta: &mut Vec<MetaEvent>,
    programs: &mut Vec<ProgramEvent>,
    controls: &mut Vec<ControlEvent>,
) {
    for event in events {
        match &event.kind {
            EventKind::Tempo(usec) => tempo.push(TempoEvent::new(event.tick, *usec)),
            EventKind::Meta(payload) => meta.push(MetaEvent {
                tick: event.tick,
                track,
                payload: payload.clone(),
            }),
            EventKind::ProgramChange { channel, program } => programs.push(ProgramEvent {
                tick: event.tick,
                track,
                channel: *channel,
                program: *program,
            }),
            EventKind::Control(payload) => controls.push(ControlEvent {
                tick: event.tick,
                track,
                payload: payload.clone(),
            }),
            EventKind::NoteOn { .. } | EventKind::NoteOff { .. } | EventKind::EndOfTrack => {}
        }
    }
}
