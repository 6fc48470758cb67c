//! Event stream writer: note matrix → sorted delta-timed events → SMF bytes.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::matrix::{NoteMatrix, Stage};
use crate::reader::{ControlPayload, MetaPayload, META_END_OF_TRACK, META_TEMPO};
use crate::{Error, Result};

/// Largest delta a four-byte variable-length quantity can hold.
pub const MAX_DELTA: u32 = 0x0FFF_FFFF;

/// An event ready for serialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteKind {
    ProgramChange { channel: u8, program: u8 },
    Control(ControlPayload),
    NoteOff { channel: u8, pitch: u8 },
    NoteOn { channel: u8, pitch: u8, velocity: u8 },
    Tempo(u32),
    Meta(MetaPayload),
}

impl WriteKind {
    /// Ordering among events on the same tick.
    fn priority(&self) -> u8 {
        match self {
            Self::ProgramChange { .. } | Self::Control(_) => 0,
            Self::NoteOff { .. } => 1,
            Self::NoteOn { .. } => 2,
            Self::Tempo(_) | Self::Meta(_) => 3,
        }
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            Self::ProgramChange { channel, program } => {
                buf.extend_from_slice(&[0xC0 | (channel & 0x0F), program & 0x7F]);
            }
            Self::Control(control) => {
                buf.push((control.status & 0xF0) | (control.channel & 0x0F));
                buf.extend(control.data.iter().map(|b| b & 0x7F));
            }
            Self::NoteOff { channel, pitch } => {
                buf.extend_from_slice(&[0x80 | (channel & 0x0F), pitch & 0x7F, 0]);
            }
            Self::NoteOn {
                channel,
                pitch,
                velocity,
            } => {
                buf.extend_from_slice(&[0x90 | (channel & 0x0F), pitch & 0x7F, velocity & 0x7F]);
            }
            Self::Tempo(usec) => {
                buf.extend_from_slice(&[
                    0xFF,
                    META_TEMPO,
                    0x03,
                    (usec >> 16) as u8,
                    (usec >> 8) as u8,
                    *usec as u8,
                ]);
            }
            Self::Meta(MetaPayload::Meta { kind, data }) => {
                buf.extend_from_slice(&[0xFF, *kind]);
                write_vlq(buf, data.len() as u32);
                buf.extend_from_slice(data);
            }
            Self::Meta(MetaPayload::SysEx(data)) => {
                buf.push(0xF0);
                write_vlq(buf, data.len() as u32);
                buf.extend_from_slice(data);
            }
            Self::Meta(MetaPayload::Escape(data)) => {
                buf.push(0xF7);
                write_vlq(buf, data.len() as u32);
                buf.extend_from_slice(data);
            }
        }
    }
}

/// An event with its absolute tick, the delta from its predecessor and the
/// track it is written to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteEvent {
    pub tick: u64,
    pub delta: u32,
    pub track: usize,
    pub kind: WriteKind,
}

/// Flatten a matrix into one sorted, delta-timed event stream.
///
/// A parsed matrix writes its program changes and control events where they
/// were read. An orchestrated matrix writes one program change per output
/// channel at tick 0, and copies each control event onto every output
/// channel fed by its source channel. Tempo events go to track 0; everything
/// else keeps its source track.
///
/// At a shared tick program changes and controls come first, then
/// note-offs, then note-ons, then tempo and meta events. Events of equal
/// tick and priority keep insertion order.
pub fn write_events(matrix: &NoteMatrix) -> Result<Vec<WriteEvent>> {
    let stage = matrix.stage()?;
    let mut timed: Vec<(u64, usize, WriteKind)> =
        Vec::with_capacity(matrix.notes.len() * 2 + matrix.controls.len() + 16);

    match stage {
        Stage::Parsed => {
            for p in &matrix.program_changes {
                timed.push((
                    p.tick,
                    p.track,
                    WriteKind::ProgramChange {
                        channel: p.channel,
                        program: p.program,
                    },
                ));
            }
            for c in &matrix.controls {
                timed.push((c.tick, c.track, WriteKind::Control(c.payload.clone())));
            }
        }
        Stage::Orchestrated => {
            // output channel → (track of its first note, program)
            let mut programs: BTreeMap<u8, (usize, u8)> = BTreeMap::new();
            // source channel → output channels
            let mut fed: BTreeMap<u8, BTreeSet<u8>> = BTreeMap::new();
            for note in &matrix.notes {
                if let Some(a) = &note.assignment {
                    let channel = note.output_channel();
                    programs.entry(channel).or_insert((note.track, a.new_program));
                    fed.entry(note.channel).or_default().insert(channel);
                }
            }
            for (&channel, &(track, program)) in &programs {
                timed.push((0, track, WriteKind::ProgramChange { channel, program }));
            }
            for c in &matrix.controls {
                for &channel in fed.get(&c.payload.channel).into_iter().flatten() {
                    timed.push((
                        c.tick,
                        c.track,
                        WriteKind::Control(c.payload.on_channel(channel)),
                    ));
                }
            }
        }
    }

    for note in &matrix.notes {
        let channel = note.output_channel();
        timed.push((
            note.onset_tick,
            note.track,
            WriteKind::NoteOn {
                channel,
                pitch: note.pitch,
                velocity: note.velocity,
            },
        ));
        timed.push((
            note.end_tick(),
            note.track,
            WriteKind::NoteOff {
                channel,
                pitch: note.pitch,
            },
        ));
    }

    for tempo in matrix.tempo.events() {
        timed.push((tempo.tick, 0, WriteKind::Tempo(tempo.microseconds_per_beat)));
    }
    for meta in &matrix.meta {
        timed.push((meta.tick, meta.track, WriteKind::Meta(meta.payload.clone())));
    }

    timed.sort_by_key(|(tick, _, kind)| (*tick, kind.priority()));

    let events = delta_encode(timed)?;
    debug!(%stage, events = events.len(), "flattened note matrix");
    Ok(events)
}

/// Assign deltas to an already-sorted `(tick, track, kind)` sequence.
fn delta_encode<I>(timed: I) -> Result<Vec<WriteEvent>>
where
    I: IntoIterator<Item = (u64, usize, WriteKind)>,
{
    let mut previous = 0u64;
    timed
        .into_iter()
        .map(|(tick, track, kind)| {
            let delta = tick
                .checked_sub(previous)
                .ok_or(Error::NegativeDelta { tick, previous })?;
            if delta > MAX_DELTA as u64 {
                return Err(Error::DeltaOverflow { delta });
            }
            previous = tick;
            Ok(WriteEvent {
                tick,
                delta: delta as u32,
                track,
                kind,
            })
        })
        .collect()
}

/// Serialize a matrix as a Standard MIDI File with the matrix's format and
/// resolution.
///
/// Format 0 writes the whole stream into one track. Formats 1 and 2 write
/// one track per source track, keeping empty ones.
pub fn to_smf_bytes(matrix: &NoteMatrix) -> Result<Vec<u8>> {
    let events = write_events(matrix)?;

    let tracks = if matrix.format == 0 {
        vec![build_track(events)?]
    } else {
        let count = events
            .iter()
            .map(|e| e.track + 1)
            .max()
            .unwrap_or(0)
            .max(matrix.track_count)
            .max(1);
        let mut grouped: Vec<Vec<WriteEvent>> = (0..count).map(|_| Vec::new()).collect();
        for event in events {
            grouped[event.track].push(event);
        }
        grouped
            .into_iter()
            .map(build_track)
            .collect::<Result<Vec<_>>>()?
    };

    Ok(build_midi_file(
        matrix.format as u16,
        matrix.ticks_per_beat(),
        &tracks,
    ))
}

/// Serialize a matrix and write it to `path`.
pub fn write_file(matrix: &NoteMatrix, path: &Path) -> Result<()> {
    let bytes = to_smf_bytes(matrix)?;
    std::fs::write(path, &bytes).map_err(|source| Error::Io {
        path: path.to_path_buf(),
        source,
    })?;
    debug!(path = %path.display(), bytes = bytes.len(), "wrote SMF");
    Ok(())
}

/// Re-delta one track's share of the sorted stream and append end-of-track.
fn build_track(events: Vec<WriteEvent>) -> Result<Vec<u8>> {
    let mut track_data = Vec::new();
    for event in delta_encode(events.into_iter().map(|e| (e.tick, e.track, e.kind)))? {
        write_vlq(&mut track_data, event.delta);
        event.kind.encode(&mut track_data);
    }

    write_vlq(&mut track_data, 0);
    track_data.extend_from_slice(&[0xFF, META_END_OF_TRACK, 0x00]);

    Ok(track_data)
}

/// Assemble a complete MIDI file from track data blobs.
fn build_midi_file(format: u16, ppq: u16, tracks: &[Vec<u8>]) -> Vec<u8> {
    let mut buf = Vec::new();

    buf.extend_from_slice(b"MThd");
    buf.extend_from_slice(&6u32.to_be_bytes());
    buf.extend_from_slice(&format.to_be_bytes());
    buf.extend_from_slice(&(tracks.len() as u16).to_be_bytes());
    buf.extend_from_slice(&ppq.to_be_bytes());

    for track_data in tracks {
        buf.extend_from_slice(b"MTrk");
        buf.extend_from_slice(&(track_data.len() as u32).to_be_bytes());
        buf.extend_from_slice(track_data);
    }

    buf
}

/// Write a variable-length quantity, most significant group first.
fn write_vlq(buf: &mut Vec<u8>, mut value: u32) {
    let mut groups = [0u8; 5];
    let mut len = 0;
    loop {
        groups[len] = (value & 0x7F) as u8;
        len += 1;
        value >>= 7;
        if value == 0 {
            break;
        }
    }
    for i in (0..len).rev() {
        let continuation = if i == 0 { 0 } else { 0x80 };
        buf.push(groups[i] | continuation);
    }
}
