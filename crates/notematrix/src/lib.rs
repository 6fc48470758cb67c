//! MIDI ↔ note-matrix round-trip and re-channelling engine.
//!
//! The pipeline moves a file through four states:
//!
//! ```text
//! Unparsed ──read──▶ Parsed(NoteMatrix) ──orchestrate──▶ Orchestrated ──write──▶ bytes
//! ```
//!
//! - [`reader`] turns SMF bytes (or hand-built tracks) into absolute-tick events.
//! - [`matcher`] pairs note-starts with note-ends per `(channel, pitch)`.
//! - [`matrix`] holds the canonical note list plus tempo and meta events.
//! - [`orchestration`] assigns each note a layer, combo, channel and program.
//! - [`writer`] serializes either stage back to a Standard MIDI File.
//!
//! # Example
//!
//! ```no_run
//! use notematrix::{NoteMatrix, Orchestrator, OrchestraTable};
//!
//! let bytes = std::fs::read("piano.mid").unwrap();
//! let (matrix, report) = NoteMatrix::from_bytes(&bytes).unwrap();
//! println!("{report}");
//!
//! let orchestrator = Orchestrator::new(OrchestraTable::default()).unwrap();
//! let (orchestrated, _) = orchestrator.orchestrate(matrix);
//! let out = notematrix::to_smf_bytes(&orchestrated).unwrap();
//! std::fs::write("orchestra.mid", out).unwrap();
//! ```

pub mod compare;
pub mod gm;
pub mod matcher;
pub mod matrix;
pub mod orchestration;
pub mod reader;
pub mod table;
pub mod tempo;
pub mod writer;

pub use compare::{verify_round_trip, RoundTripMismatch, RoundTripSummary};
pub use matcher::{MatchStats, NoteMatcher};
pub use matrix::{
    ControlEvent, MetaEvent, Note, NoteMatrix, NoteTiming, ParseReport, ProgramEvent, Stage,
    TimedNoteRecord, TimedNoteStats,
};
pub use orchestration::{
    Assignment, Combo, ComboSchedule, ComboSlots, ComboTable, Instrument, Layer,
    LayerThresholds, OrchestraTable, OrchestrationReport, Orchestrator, Slot,
};
pub use reader::{
    read_smf, read_tracks, ControlPayload, EventKind, MetaPayload, RawSmf, TimedEvent,
};
pub use tempo::{TempoEvent, TempoMap, DEFAULT_TEMPO_USEC};
pub use writer::{to_smf_bytes, write_events, write_file, WriteEvent, WriteKind};

use std::path::PathBuf;

/// Errors from reading, orchestrating and writing note matrices.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("malformed track {track} at event {index}: {reason}")]
    MalformedTrack {
        track: usize,
        index: usize,
        reason: String,
    },

    /// The container could not be parsed at all; midly reports no position.
    #[error("unreadable MIDI file: {0}")]
    Unreadable(String),

    #[error("SMPTE timecode division is not supported, only ticks per beat")]
    UnsupportedTiming,

    #[error("invalid timing: {0}")]
    InvalidTiming(String),

    #[error("negative delta time: event at tick {tick} follows tick {previous}")]
    NegativeDelta { tick: u64, previous: u64 },

    #[error("delta time {delta} does not fit in a MIDI variable-length quantity")]
    DeltaOverflow { delta: u64 },

    #[error("matrix is partially orchestrated: {assigned} of {total} notes assigned")]
    PartialAssignment { assigned: usize, total: usize },

    #[error("invalid orchestra table: {0}")]
    InvalidTable(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
