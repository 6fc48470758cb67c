//! Diagnostic CSV rendering of note matrices.

use std::fmt::Write;

use crate::matrix::{Note, NoteMatrix};

/// Column names, in order.
pub const COLUMNS: [&str; 10] = [
    "onset_beats",
    "duration_beats",
    "channel",
    "pitch",
    "velocity",
    "onset_sec",
    "duration_sec",
    "new_channel",
    "new_program",
    "new_instrument",
];

/// One CSV line per note in canonical order, preceded by a header.
///
/// The assignment columns are blank for a matrix that has not been
/// orchestrated.
pub fn to_csv(matrix: &NoteMatrix) -> String {
    let mut out = COLUMNS.join(",");
    out.push('\n');
    for note in &matrix.notes {
        out.push_str(&row(matrix, note).join(","));
        out.push('\n');
    }
    out
}

/// Two matrices side by side: `in_*` columns, a blank separator, `out_*`
/// columns. Rows align by canonical order and the shorter side is padded.
pub fn comparison_csv(input: &NoteMatrix, output: &NoteMatrix) -> String {
    let header: Vec<String> = COLUMNS
        .iter()
        .map(|c| format!("in_{c}"))
        .chain(std::iter::once(String::new()))
        .chain(COLUMNS.iter().map(|c| format!("out_{c}")))
        .collect();

    let mut out = header.join(",");
    out.push('\n');

    let blank = vec![String::new(); COLUMNS.len()];
    let rows = input.notes.len().max(output.notes.len());
    for i in 0..rows {
        let left = input
            .notes
            .get(i)
            .map(|n| row(input, n))
            .unwrap_or_else(|| blank.clone());
        let right = output
            .notes
            .get(i)
            .map(|n| row(output, n))
            .unwrap_or_else(|| blank.clone());
        let _ = writeln!(out, "{},,{}", left.join(","), right.join(","));
    }
    out
}

fn row(matrix: &NoteMatrix, note: &Note) -> Vec<String> {
    let timing = matrix.timing(note);
    let mut cells = vec![
        format!("{:.6}", timing.onset_beats),
        format!("{:.6}", timing.duration_beats),
        note.channel.to_string(),
        note.pitch.to_string(),
        note.velocity.to_string(),
        format!("{:.6}", timing.onset_seconds),
        format!("{:.6}", timing.duration_seconds),
    ];
    match &note.assignment {
        Some(a) => {
            cells.push(a.new_channel.to_string());
            cells.push(a.new_program.to_string());
            cells.push(quote(&a.new_instrument));
        }
        None => cells.extend([String::new(), String::new(), String::new()]),
    }
    cells
}

fn quote(field: &str) -> String {
    if field.contains([',', '"', '\n']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::{OrchestraTable, Orchestrator};
    use pretty_assertions::assert_eq;

    fn parsed() -> NoteMatrix {
        let mut m = NoteMatrix::new(1, 480).unwrap();
        m.notes = vec![Note::new(0, 64, 100, 0, 480, 0), Note::new(0, 40, 80, 480, 240, 0)];
        m
    }

    #[test]
    fn parsed_rows_leave_assignment_blank() {
        let csv = to_csv(&parsed());
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], COLUMNS.join(","));
        assert_eq!(
            lines[1],
            "0.000000,1.000000,0,64,100,0.000000,0.500000,,,"
        );
        assert_eq!(
            lines[2],
            "1.000000,0.500000,0,40,80,0.500000,0.250000,,,"
        );
    }

    #[test]
    fn orchestrated_rows_carry_assignment() {
        let orchestrator = Orchestrator::new(OrchestraTable::default()).unwrap();
        let (m, _) = orchestrator.orchestrate(parsed());
        let csv = to_csv(&m);
        let lines: Vec<&str> = csv.lines().collect();
        assert!(lines[1].ends_with(",1,40,Violin"), "{}", lines[1]);
        assert!(lines[2].ends_with(",3,43,Contrabass"), "{}", lines[2]);
    }

    #[test]
    fn comparison_pads_shorter_side() {
        let input = parsed();
        let mut output = parsed();
        output.notes.pop();

        let csv = comparison_csv(&input, &output);
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("in_onset_beats,"));
        assert!(lines[0].contains(",,out_onset_beats,"));
        assert_eq!(lines[2].split(',').count(), COLUMNS.len() * 2 + 1);
        assert!(lines[2].ends_with(&",".repeat(COLUMNS.len() - 1)));
    }

    #[test]
    fn quotes_only_when_needed() {
        assert_eq!(quote("Violin"), "Violin");
        assert_eq!(quote("Horn, French"), "\"Horn, French\"");
        assert_eq!(quote("say \"hi\""), "\"say \"\"hi\"\"\"");
    }
}
