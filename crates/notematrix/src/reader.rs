//! Event stream reader: delta-timed tracks → absolute-tick classified events.

use midly::{Fps, MetaMessage, MidiMessage, Smf, Timing, TrackEventKind};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Error, Result};

/// Meta-event type byte for `set_tempo`.
pub const META_TEMPO: u8 = 0x51;
/// Meta-event type byte for `end_of_track`.
pub const META_END_OF_TRACK: u8 = 0x2F;

/// Opaque non-channel event carried verbatim through a round-trip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetaPayload {
    /// `FF <kind> <len> <data>`
    Meta { kind: u8, data: Vec<u8> },
    /// `F0 <len> <data>`; data excludes the leading F0.
    SysEx(Vec<u8>),
    /// `F7 <len> <data>`
    Escape(Vec<u8>),
}

impl MetaPayload {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Meta { kind, .. } => match *kind {
                0x00 => "sequence_number",
                0x01 => "text",
                0x02 => "copyright",
                0x03 => "track_name",
                0x04 => "instrument_name",
                0x05 => "lyric",
                0x06 => "marker",
                0x07 => "cue_point",
                0x08 => "program_name",
                0x09 => "device_name",
                0x20 => "channel_prefix",
                0x21 => "midi_port",
                0x54 => "smpte_offset",
                0x58 => "time_signature",
                0x59 => "key_signature",
                0x7F => "sequencer_specific",
                _ => "unknown_meta",
            },
            Self::SysEx(_) => "sysex",
            Self::Escape(_) => "escape",
        }
    }
}

/// Controller, polyphonic/channel aftertouch or pitch bend, carried as
/// its raw data bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlPayload {
    /// Status high nibble: 0xA0, 0xB0, 0xD0 or 0xE0.
    pub status: u8,
    pub channel: u8,
    pub data: Vec<u8>,
}

impl ControlPayload {
    /// The same message on another channel.
    pub fn on_channel(&self, channel: u8) -> Self {
        Self {
            channel,
            ..self.clone()
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self.status {
            0xA0 => "poly_aftertouch",
            0xB0 => "controller",
            0xD0 => "channel_aftertouch",
            0xE0 => "pitch_bend",
            _ => "unknown_channel",
        }
    }
}

/// A classified track event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    NoteOn { channel: u8, pitch: u8, velocity: u8 },
    NoteOff { channel: u8, pitch: u8 },
    ProgramChange { channel: u8, program: u8 },
    Tempo(u32),
    Meta(MetaPayload),
    EndOfTrack,
    /// Controllers, pitch bend and aftertouch.
    Control(ControlPayload),
}

impl EventKind {
    /// `note_on` with positive velocity.
    pub fn is_note_start(&self) -> bool {
        matches!(self, Self::NoteOn { velocity, .. } if *velocity > 0)
    }

    /// `note_off`, or `note_on` with velocity 0. The two are interchangeable.
    pub fn is_note_end(&self) -> bool {
        matches!(self, Self::NoteOff { .. } | Self::NoteOn { velocity: 0, .. })
    }

    /// `(channel, pitch)` for note events.
    pub fn note_key(&self) -> Option<(u8, u8)> {
        match *self {
            Self::NoteOn { channel, pitch, .. } | Self::NoteOff { channel, pitch } => {
                Some((channel, pitch))
            }
            _ => None,
        }
    }
}

/// An event positioned at an absolute tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimedEvent {
    pub tick: u64,
    pub kind: EventKind,
}

/// A parsed file before note matching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSmf {
    pub format: u8,
    pub ticks_per_beat: u16,
    pub tracks: Vec<Vec<TimedEvent>>,
}

/// Prefix-sum delta times into absolute ticks, one forward pass per track.
///
/// A negative delta rejects the whole input with [`Error::MalformedTrack`].
pub fn read_tracks<I, T>(tracks: I) -> Result<Vec<Vec<TimedEvent>>>
where
    I: IntoIterator<Item = T>,
    T: IntoIterator<Item = (i64, EventKind)>,
{
    tracks
        .into_iter()
        .enumerate()
        .map(|(track, events)| {
            let mut tick: u64 = 0;
            events
                .into_iter()
                .enumerate()
                .map(|(index, (delta, kind))| {
                    if delta < 0 {
                        return Err(Error::MalformedTrack {
                            track,
                            index,
                            reason: format!("negative delta time {delta}"),
                        });
                    }
                    tick += delta as u64;
                    Ok(TimedEvent { tick, kind })
                })
                .collect()
        })
        .collect()
}

/// Parse a Standard MIDI File and classify every event.
pub fn read_smf(bytes: &[u8]) -> Result<RawSmf> {
    let smf = Smf::parse(bytes).map_err(|e| Error::Unreadable(e.to_string()))?;

    let ticks_per_beat = match smf.header.timing {
        Timing::Metrical(ticks) => ticks.as_int(),
        Timing::Timecode(_, _) => return Err(Error::UnsupportedTiming),
    };

    let format = match smf.header.format {
        midly::Format::SingleTrack => 0,
        midly::Format::Parallel => 1,
        midly::Format::Sequential => 2,
    };

    let tracks = read_tracks(smf.tracks.iter().map(|track| {
        track
            .iter()
            .map(|event| (event.delta.as_int() as i64, classify(&event.kind)))
    }))?;

    debug!(
        format,
        ticks_per_beat,
        tracks = tracks.len(),
        events = tracks.iter().map(Vec::len).sum::<usize>(),
        "read SMF"
    );

    Ok(RawSmf {
        format,
        ticks_per_beat,
        tracks,
    })
}

fn classify(kind: &TrackEventKind) -> EventKind {
    match *kind {
        TrackEventKind::Midi { channel, message } => {
            let channel = channel.as_int();
            match message {
                MidiMessage::NoteOn { key, vel } => EventKind::NoteOn {
                    channel,
                    pitch: key.as_int(),
                    velocity: vel.as_int(),
                },
                MidiMessage::NoteOff { key, .. } => EventKind::NoteOff {
                    channel,
                    pitch: key.as_int(),
                },
                MidiMessage::ProgramChange { program } => EventKind::ProgramChange {
                    channel,
                    program: program.as_int(),
                },
                MidiMessage::Aftertouch { key, vel } => EventKind::Control(ControlPayload {
                    status: 0xA0,
                    channel,
                    data: vec![key.as_int(), vel.as_int()],
                }),
                MidiMessage::Controller { controller, value } => {
                    EventKind::Control(ControlPayload {
                        status: 0xB0,
                        channel,
                        data: vec![controller.as_int(), value.as_int()],
                    })
                }
                MidiMessage::ChannelAftertouch { vel } => EventKind::Control(ControlPayload {
                    status: 0xD0,
                    channel,
                    data: vec![vel.as_int()],
                }),
                MidiMessage::PitchBend { bend } => {
                    let raw = bend.0.as_int();
                    EventKind::Control(ControlPayload {
                        status: 0xE0,
                        channel,
                        data: vec![(raw & 0x7F) as u8, (raw >> 7) as u8],
                    })
                }
            }
        }
        TrackEventKind::Meta(MetaMessage::Tempo(tempo)) => EventKind::Tempo(tempo.as_int()),
        TrackEventKind::Meta(MetaMessage::EndOfTrack) => EventKind::EndOfTrack,
        TrackEventKind::Meta(ref meta) => {
            let (kind, data) = meta_bytes(meta);
            EventKind::Meta(MetaPayload::Meta { kind, data })
        }
        TrackEventKind::SysEx(data) => EventKind::Meta(MetaPayload::SysEx(data.to_vec())),
        TrackEventKind::Escape(data) => EventKind::Meta(MetaPayload::Escape(data.to_vec())),
    }
}

/// Recover the on-disk `(type, data)` of a meta message.
fn meta_bytes(meta: &MetaMessage) -> (u8, Vec<u8>) {
    match *meta {
        MetaMessage::TrackNumber(number) => (
            0x00,
            number.map(|n| n.to_be_bytes().to_vec()).unwrap_or_default(),
        ),
        MetaMessage::Text(data) => (0x01, data.to_vec()),
        MetaMessage::Copyright(data) => (0x02, data.to_vec()),
        MetaMessage::TrackName(data) => (0x03, data.to_vec()),
        MetaMessage::InstrumentName(data) => (0x04, data.to_vec()),
        MetaMessage::Lyric(data) => (0x05, data.to_vec()),
        MetaMessage::Marker(data) => (0x06, data.to_vec()),
        MetaMessage::CuePoint(data) => (0x07, data.to_vec()),
        MetaMessage::ProgramName(data) => (0x08, data.to_vec()),
        MetaMessage::DeviceName(data) => (0x09, data.to_vec()),
        MetaMessage::MidiChannel(channel) => (0x20, vec![channel.as_int()]),
        MetaMessage::MidiPort(port) => (0x21, vec![port.as_int()]),
        MetaMessage::EndOfTrack => (META_END_OF_TRACK, Vec::new()),
        MetaMessage::Tempo(tempo) => (META_TEMPO, tempo.as_int().to_be_bytes()[1..].to_vec()),
        MetaMessage::SmpteOffset(time) => {
            let rate = match time.fps() {
                Fps::Fps24 => 0u8,
                Fps::Fps25 => 1,
                Fps::Fps29 => 2,
                Fps::Fps30 => 3,
            };
            (
                0x54,
                vec![
                    (rate << 5) | time.hour(),
                    time.minute(),
                    time.second(),
                    time.frame(),
                    time.subframe(),
                ],
            )
        }
        MetaMessage::TimeSignature(num, denom_pow, clocks, thirty_seconds) => {
            (0x58, vec![num, denom_pow, clocks, thirty_seconds])
        }
        MetaMessage::KeySignature(sharps, minor) => (0x59, vec![sharps as u8, minor as u8]),
        MetaMessage::SequencerSpecific(data) => (0x7F, data.to_vec()),
        MetaMessage::Unknown(kind, data) => (kind, data.to_vec()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn note_on(channel: u8, pitch: u8, velocity: u8) -> EventKind {
        EventKind::NoteOn {
            channel,
            pitch,
            velocity,
        }
    }

    #[test]
    fn prefix_sums_deltas() {
        let tracks = read_tracks(vec![vec![
            (0, note_on(0, 60, 100)),
            (480, EventKind::NoteOff { channel: 0, pitch: 60 }),
            (0, note_on(0, 62, 90)),
            (240, note_on(0, 62, 0)),
        ]])
        .unwrap();

        let ticks: Vec<u64> = tracks[0].iter().map(|e| e.tick).collect();
        assert_eq!(ticks, vec![0, 480, 480, 720]);
    }

    #[test]
    fn tracks_accumulate_independently() {
        let tracks = read_tracks(vec![
            vec![(100, EventKind::Tempo(400_000))],
            vec![(10, note_on(1, 40, 50)), (10, EventKind::EndOfTrack)],
        ])
        .unwrap();
        assert_eq!(tracks[0][0].tick, 100);
        assert_eq!(tracks[1][1].tick, 20);
    }

    #[test]
    fn negative_delta_is_malformed() {
        let err = read_tracks(vec![vec![
            (0, note_on(0, 60, 100)),
            (-5, EventKind::NoteOff { channel: 0, pitch: 60 }),
        ]])
        .unwrap_err();

        match err {
            Error::MalformedTrack { track, index, .. } => {
                assert_eq!(track, 0);
                assert_eq!(index, 1);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn zero_velocity_note_on_is_note_end() {
        assert!(note_on(0, 60, 0).is_note_end());
        assert!(!note_on(0, 60, 0).is_note_start());
        assert!(EventKind::NoteOff { channel: 3, pitch: 1 }.is_note_end());
        assert!(note_on(0, 60, 1).is_note_start());
        assert_eq!(note_on(5, 61, 0).note_key(), Some((5, 61)));
    }

    fn smf_with_track(format: u16, track: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"MThd");
        buf.extend_from_slice(&6u32.to_be_bytes());
        buf.extend_from_slice(&format.to_be_bytes());
        buf.extend_from_slice(&1u16.to_be_bytes());
        buf.extend_from_slice(&480u16.to_be_bytes());
        buf.extend_from_slice(b"MTrk");
        buf.extend_from_slice(&(track.len() as u32).to_be_bytes());
        buf.extend_from_slice(track);
        buf
    }

    #[test]
    fn classifies_smf_events() {
        let track = [
            0x00, 0xFF, 0x03, 0x05, b'P', b'i', b'a', b'n', b'o', // track name
            0x00, 0xFF, 0x51, 0x03, 0x07, 0xA1, 0x20, // tempo 500000
            0x00, 0xC0, 0x05, // program change
            0x00, 0xB0, 0x40, 0x7F, // sustain pedal
            0x00, 0x90, 60, 100, // note on
            0x83, 0x60, 0x90, 60, 0, // note on vel 0 at 480
            0x00, 0xFF, 0x2F, 0x00,
        ];
        let raw = read_smf(&smf_with_track(0, &track)).unwrap();

        assert_eq!(raw.format, 0);
        assert_eq!(raw.ticks_per_beat, 480);
        let kinds: Vec<&EventKind> = raw.tracks[0].iter().map(|e| &e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                &EventKind::Meta(MetaPayload::Meta {
                    kind: 0x03,
                    data: b"Piano".to_vec()
                }),
                &EventKind::Tempo(500_000),
                &EventKind::ProgramChange {
                    channel: 0,
                    program: 5
                },
                &EventKind::Control(ControlPayload {
                    status: 0xB0,
                    channel: 0,
                    data: vec![0x40, 0x7F]
                }),
                &note_on(0, 60, 100),
                &note_on(0, 60, 0),
                &EventKind::EndOfTrack,
            ]
        );
        assert_eq!(raw.tracks[0][5].tick, 480);
    }

    #[test]
    fn bend_and_aftertouch_keep_raw_bytes() {
        let track = [
            0x00, 0xE3, 0x00, 0x40, // bend centre on channel 3
            0x00, 0xE3, 0x7F, 0x7F, // bend max
            0x00, 0xA1, 60, 33, // poly aftertouch
            0x00, 0xD2, 44, // channel aftertouch
            0x00, 0xFF, 0x2F, 0x00,
        ];
        let raw = read_smf(&smf_with_track(0, &track)).unwrap();
        let controls: Vec<&ControlPayload> = raw.tracks[0]
            .iter()
            .filter_map(|e| match &e.kind {
                EventKind::Control(c) => Some(c),
                _ => None,
            })
            .collect();

        assert_eq!(controls.len(), 4);
        assert_eq!((controls[0].status, controls[0].channel), (0xE0, 3));
        assert_eq!(controls[0].data, vec![0x00, 0x40]);
        assert_eq!(controls[1].data, vec![0x7F, 0x7F]);
        assert_eq!(controls[2].kind_name(), "poly_aftertouch");
        assert_eq!(controls[2].data, vec![60, 33]);
        assert_eq!((controls[3].status, controls[3].data.as_slice()), (0xD0, &[44u8][..]));
    }

    #[test]
    fn meta_payloads_keep_raw_bytes() {
        let track = [
            0x00, 0xFF, 0x58, 0x04, 0x03, 0x02, 0x18, 0x08, // 3/4
            0x00, 0xFF, 0x59, 0x02, 0xFE, 0x01, // Bb minor-ish
            0x00, 0xF0, 0x03, 0x7E, 0x09, 0xF7, // sysex
            0x00, 0xFF, 0x2F, 0x00,
        ];
        let raw = read_smf(&smf_with_track(0, &track)).unwrap();
        assert_eq!(
            raw.tracks[0][0].kind,
            EventKind::Meta(MetaPayload::Meta {
                kind: 0x58,
                data: vec![3, 2, 0x18, 0x08]
            })
        );
        assert_eq!(
            raw.tracks[0][1].kind,
            EventKind::Meta(MetaPayload::Meta {
                kind: 0x59,
                data: vec![0xFE, 0x01]
            })
        );
        assert_eq!(
            raw.tracks[0][2].kind,
            EventKind::Meta(MetaPayload::SysEx(vec![0x7E, 0x09, 0xF7]))
        );
    }

    #[test]
    fn truncated_file_is_unreadable() {
        let mut bytes = smf_with_track(0, &[0x00, 0x90, 60, 100, 0x00, 0xFF, 0x2F, 0x00]);
        bytes.truncate(bytes.len() - 6);
        assert!(matches!(read_smf(&bytes), Err(Error::Unreadable(_))));
    }

    #[test]
    fn garbage_is_unreadable_without_a_location() {
        let err = read_smf(b"not a midi file").unwrap_err();
        assert!(matches!(err, Error::Unreadable(_)));
        assert!(!err.to_string().contains("track 0"), "{err}");
    }

    #[test]
    fn smpte_division_is_rejected() {
        let mut bytes = smf_with_track(0, &[0x00, 0xFF, 0x2F, 0x00]);
        // -25 fps, 40 ticks per frame
        bytes[12] = 0xE7;
        bytes[13] = 40;
        assert!(matches!(read_smf(&bytes), Err(Error::UnsupportedTiming)));
    }
}
