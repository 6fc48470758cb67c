//! Note-by-note comparison of two matrices, used to verify round-trips.

use serde::{Deserialize, Serialize};

use crate::matrix::{Note, NoteMatrix};

/// How two matrices differ.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoundTripMismatch {
    #[error("note count differs: expected {expected}, got {actual}")]
    Count { expected: usize, actual: usize },

    #[error("note {index} differs in {field}: expected {expected}, got {actual}")]
    Field {
        index: usize,
        field: &'static str,
        expected: u64,
        actual: u64,
    },

    #[error("ticks per beat differs: expected {expected}, got {actual}")]
    Resolution { expected: u16, actual: u16 },
}

/// Largest timing drift seen in a passing comparison.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundTripSummary {
    pub notes: usize,
    pub max_onset_error: u64,
    pub max_duration_error: u64,
}

/// Check that `actual` holds the same notes as `expected`.
///
/// Notes are compared pairwise in canonical order on output channel, pitch
/// and velocity exactly, and on onset and duration within
/// `tolerance_ticks`. Source track indices are ignored since format 0
/// output merges tracks.
pub fn verify_round_trip(
    expected: &NoteMatrix,
    actual: &NoteMatrix,
    tolerance_ticks: u64,
) -> Result<RoundTripSummary, RoundTripMismatch> {
    if expected.ticks_per_beat() != actual.ticks_per_beat() {
        return Err(RoundTripMismatch::Resolution {
            expected: expected.ticks_per_beat(),
            actual: actual.ticks_per_beat(),
        });
    }
    if expected.notes.len() != actual.notes.len() {
        return Err(RoundTripMismatch::Count {
            expected: expected.notes.len(),
            actual: actual.notes.len(),
        });
    }

    let mut summary = RoundTripSummary {
        notes: expected.notes.len(),
        ..Default::default()
    };

    let (expected_notes, actual_notes) = (by_output_channel(expected), by_output_channel(actual));
    for (index, (e, a)) in expected_notes.iter().zip(&actual_notes).enumerate() {
        exact(index, "channel", e.output_channel().into(), a.output_channel().into())?;
        exact(index, "pitch", e.pitch.into(), a.pitch.into())?;
        exact(index, "velocity", e.velocity.into(), a.velocity.into())?;

        let onset = within(index, "onset", e, a, |n| n.onset_tick, tolerance_ticks)?;
        let duration = within(index, "duration", e, a, |n| n.duration_ticks, tolerance_ticks)?;
        summary.max_onset_error = summary.max_onset_error.max(onset);
        summary.max_duration_error = summary.max_duration_error.max(duration);
    }

    Ok(summary)
}

/// Canonical order keyed on the channel the note is written to.
fn by_output_channel(matrix: &NoteMatrix) -> Vec<&Note> {
    let mut notes: Vec<&Note> = matrix.notes.iter().collect();
    notes.sort_by_key(|n| (n.onset_tick, n.pitch, n.output_channel()));
    notes
}

fn exact(
    index: usize,
    field: &'static str,
    expected: u64,
    actual: u64,
) -> Result<(), RoundTripMismatch> {
    if expected == actual {
        Ok(())
    } else {
        Err(RoundTripMismatch::Field {
            index,
            field,
            expected,
            actual,
        })
    }
}

fn within(
    index: usize,
    field: &'static str,
    expected: &Note,
    actual: &Note,
    get: impl Fn(&Note) -> u64,
    tolerance: u64,
) -> Result<u64, RoundTripMismatch> {
    let (e, a) = (get(expected), get(actual));
    let error = e.abs_diff(a);
    if error > tolerance {
        return Err(RoundTripMismatch::Field {
            index,
            field,
            expected: e,
            actual: a,
        });
    }
    Ok(error)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matrix(notes: Vec<Note>) -> NoteMatrix {
        let mut m = NoteMatrix::new(1, 480).unwrap();
        m.notes = notes;
        m
    }

    #[test]
    fn identical_matrices_pass() {
        let m = matrix(vec![Note::new(0, 60, 90, 0, 480, 0)]);
        let summary = verify_round_trip(&m, &m.clone(), 0).unwrap();
        assert_eq!(summary.notes, 1);
        assert_eq!(summary.max_onset_error, 0);
    }

    #[test]
    fn drift_within_tolerance_is_reported() {
        let e = matrix(vec![Note::new(0, 60, 90, 100, 480, 0)]);
        let a = matrix(vec![Note::new(0, 60, 90, 101, 479, 2)]);
        let summary = verify_round_trip(&e, &a, 1).unwrap();
        assert_eq!(summary.max_onset_error, 1);
        assert_eq!(summary.max_duration_error, 1);

        assert_eq!(
            verify_round_trip(&e, &a, 0),
            Err(RoundTripMismatch::Field {
                index: 0,
                field: "onset",
                expected: 100,
                actual: 101
            })
        );
    }

    #[test]
    fn count_and_pitch_mismatches() {
        let e = matrix(vec![Note::new(0, 60, 90, 0, 480, 0)]);
        assert_eq!(
            verify_round_trip(&e, &matrix(Vec::new()), 1),
            Err(RoundTripMismatch::Count {
                expected: 1,
                actual: 0
            })
        );

        let a = matrix(vec![Note::new(0, 61, 90, 0, 480, 0)]);
        let err = verify_round_trip(&e, &a, 1).unwrap_err();
        assert!(err.to_string().contains("pitch"), "{err}");
    }
}
