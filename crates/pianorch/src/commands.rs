//! CLI command implementations

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use notematrix::table::{comparison_csv, to_csv};
use notematrix::{
    to_smf_bytes, verify_round_trip, MetaEvent, NoteMatrix, OrchestrationReport, Orchestrator,
    ParseReport, RoundTripSummary,
};
use orchconf::{ConfigSources, OrchConfig};
use serde::Serialize;
use tracing::{error, info, warn};

/// Settings shared by the batch commands, CLI flags folded over config.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub output_dir: Option<PathBuf>,
    pub suffix: String,
    pub write_table: bool,
    pub tolerance: u64,
    pub json: bool,
}

impl RunOptions {
    pub fn new(
        config: &OrchConfig,
        output_dir: Option<PathBuf>,
        table: bool,
        tolerance: Option<u64>,
        json: bool,
    ) -> Self {
        Self {
            output_dir: output_dir.or_else(|| config.output.dir.clone()),
            suffix: config.output.suffix.clone(),
            write_table: table || config.output.write_table,
            tolerance: tolerance.unwrap_or(config.output.round_trip_tolerance),
            json,
        }
    }
}

/// What happened to one input file.
#[derive(Debug, Default, Serialize)]
pub struct FileOutcome {
    pub input: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parse: Option<ParseReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub orchestration: Option<OrchestrationReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub round_trip: Option<RoundTripSummary>,
    /// How re-reading the orchestrated output differed. Sections that share
    /// a channel can collide, so this is reported rather than failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub round_trip_mismatch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Orchestrate every input. Returns the number of files that failed.
pub fn orchestrate(inputs: &[PathBuf], config: &OrchConfig, options: &RunOptions) -> Result<usize> {
    let orchestrator =
        Orchestrator::new(config.orchestra_table()).context("Invalid orchestra table")?;
    prepare_output_dir(options)?;

    let outcomes: Vec<FileOutcome> = inputs
        .iter()
        .map(|input| {
            orchestrate_one(input, &orchestrator, options).unwrap_or_else(|e| failed(input, e))
        })
        .collect();

    print_outcomes(&outcomes, options.json)?;
    Ok(outcomes.iter().filter(|o| o.error.is_some()).count())
}

/// Rewrite every input unchanged and verify it. Returns the number of
/// files that failed.
pub fn roundtrip(inputs: &[PathBuf], options: &RunOptions) -> Result<usize> {
    prepare_output_dir(options)?;

    let outcomes: Vec<FileOutcome> = inputs
        .iter()
        .map(|input| roundtrip_one(input, options).unwrap_or_else(|e| failed(input, e)))
        .collect();

    print_outcomes(&outcomes, options.json)?;
    Ok(outcomes.iter().filter(|o| o.error.is_some()).count())
}

/// Print the note matrix of `input`, orchestrated with `config` if given.
pub fn dump(input: &Path, config: Option<&OrchConfig>) -> Result<()> {
    let (matrix, _) = NoteMatrix::read_file(input)
        .with_context(|| format!("Failed to read {}", input.display()))?;

    let matrix = match config {
        Some(config) => {
            let orchestrator =
                Orchestrator::new(config.orchestra_table()).context("Invalid orchestra table")?;
            orchestrator.orchestrate(matrix).0
        }
        None => matrix,
    };

    print!("{}", to_csv(&matrix));
    Ok(())
}

/// Print the effective configuration, optionally preceded by its sources.
pub fn show_config(config: &OrchConfig, sources: Option<&ConfigSources>) {
    if let Some(sources) = sources {
        println!("# Config files loaded:");
        if sources.files.is_empty() {
            println!("#   (none, using defaults)");
        }
        for path in &sources.files {
            println!("#   {}", path.display());
        }
        if !sources.env_overrides.is_empty() {
            println!("# Environment overrides:");
            for var in &sources.env_overrides {
                println!("#   {var}");
            }
        }
        println!();
    }
    print!("{}", config.to_toml());
}

fn orchestrate_one(
    input: &Path,
    orchestrator: &Orchestrator,
    options: &RunOptions,
) -> Result<FileOutcome> {
    let (parsed, parse) = NoteMatrix::read_file(input)
        .with_context(|| format!("Failed to read {}", input.display()))?;
    let (orchestrated, report) = orchestrator.orchestrate(parsed.clone());

    let bytes = to_smf_bytes(&orchestrated)
        .with_context(|| format!("Failed to serialize {}", input.display()))?;
    let output = output_path(input, options.output_dir.as_deref(), &options.suffix, "mid");
    std::fs::write(&output, &bytes)
        .with_context(|| format!("Failed to write {}", output.display()))?;

    let (reread, _) = NoteMatrix::from_bytes(&bytes)
        .with_context(|| format!("Failed to re-read {}", output.display()))?;
    let (round_trip, round_trip_mismatch) =
        match verify_round_trip(&orchestrated, &reread, options.tolerance) {
            Ok(summary) => (Some(summary), None),
            Err(mismatch) => {
                warn!(output = %output.display(), %mismatch, "orchestrated output reads back differently");
                (None, Some(mismatch.to_string()))
            }
        };

    let table = if options.write_table {
        let path = output_path(input, options.output_dir.as_deref(), &options.suffix, "csv");
        std::fs::write(&path, comparison_csv(&parsed, &orchestrated))
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Some(path)
    } else {
        None
    };

    info!(input = %input.display(), output = %output.display(), "orchestrated");
    Ok(FileOutcome {
        input: input.to_path_buf(),
        output: Some(output),
        table,
        parse: Some(parse),
        orchestration: Some(report),
        round_trip,
        round_trip_mismatch,
        error: None,
    })
}

fn roundtrip_one(input: &Path, options: &RunOptions) -> Result<FileOutcome> {
    let (parsed, parse) = NoteMatrix::read_file(input)
        .with_context(|| format!("Failed to read {}", input.display()))?;

    let bytes = to_smf_bytes(&parsed)
        .with_context(|| format!("Failed to serialize {}", input.display()))?;
    let output = output_path(input, options.output_dir.as_deref(), "_roundtrip", "mid");
    std::fs::write(&output, &bytes)
        .with_context(|| format!("Failed to write {}", output.display()))?;

    let (reread, _) = NoteMatrix::from_bytes(&bytes)
        .with_context(|| format!("Failed to re-read {}", output.display()))?;
    let summary = verify_round_trip(&parsed, &reread, options.tolerance)
        .with_context(|| format!("Round-trip check failed for {}", input.display()))?;

    let meta_key = |m: &MetaEvent| (m.tick, m.payload.clone());
    if !reread.meta.iter().map(meta_key).eq(parsed.meta.iter().map(meta_key)) {
        warn!(input = %input.display(), "meta events changed across round-trip");
    }

    let table = if options.write_table {
        let path = output_path(input, options.output_dir.as_deref(), "_roundtrip", "csv");
        std::fs::write(&path, comparison_csv(&parsed, &reread))
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Some(path)
    } else {
        None
    };

    Ok(FileOutcome {
        input: input.to_path_buf(),
        output: Some(output),
        table,
        parse: Some(parse),
        orchestration: None,
        round_trip: Some(summary),
        round_trip_mismatch: None,
        error: None,
    })
}

fn failed(input: &Path, e: anyhow::Error) -> FileOutcome {
    error!(input = %input.display(), "{e:#}");
    FileOutcome {
        input: input.to_path_buf(),
        error: Some(format!("{e:#}")),
        ..Default::default()
    }
}

fn prepare_output_dir(options: &RunOptions) -> Result<()> {
    if let Some(dir) = &options.output_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create output directory {}", dir.display()))?;
    }
    Ok(())
}

/// `<dir>/<stem><suffix>.<ext>`, with `dir` defaulting to the input's directory.
fn output_path(input: &Path, dir: Option<&Path>, suffix: &str, ext: &str) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    let name = format!("{stem}{suffix}.{ext}");
    match dir.or_else(|| input.parent()) {
        Some(dir) => dir.join(name),
        None => PathBuf::from(name),
    }
}

fn print_outcomes(outcomes: &[FileOutcome], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(outcomes)?);
        return Ok(());
    }

    for outcome in outcomes {
        let input = outcome.input.display();
        if let Some(e) = &outcome.error {
            println!("✗ {input}: {e}");
            continue;
        }
        if let Some(output) = &outcome.output {
            println!("✓ {input} → {}", output.display());
        }
        if let Some(parse) = &outcome.parse {
            println!("    {parse}");
        }
        if let Some(report) = &outcome.orchestration {
            println!("    {report}");
        }
        if let Some(summary) = &outcome.round_trip {
            println!(
                "    round-trip ok: {} notes, max drift {} onset / {} duration ticks",
                summary.notes, summary.max_onset_error, summary.max_duration_error
            );
        }
        if let Some(mismatch) = &outcome.round_trip_mismatch {
            println!("    round-trip differs: {mismatch}");
        }
        if let Some(table) = &outcome.table {
            println!("    table: {}", table.display());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use notematrix::Note;

    fn write_piano(dir: &Path, name: &str) -> PathBuf {
        let mut matrix = NoteMatrix::new(1, 480).unwrap();
        matrix.notes = vec![
            Note::new(0, 64, 100, 0, 480, 0),
            Note::new(0, 55, 80, 0, 960, 0),
            Note::new(0, 40, 70, 480, 480, 0),
        ];
        matrix.sort();
        let path = dir.join(name);
        std::fs::write(&path, to_smf_bytes(&matrix).unwrap()).unwrap();
        path
    }

    fn options(dir: Option<PathBuf>, table: bool) -> RunOptions {
        RunOptions::new(&OrchConfig::default(), dir, table, None, false)
    }

    #[test]
    fn output_path_variants() {
        assert_eq!(
            output_path(Path::new("/music/song.mid"), None, "_orchestrated", "mid"),
            PathBuf::from("/music/song_orchestrated.mid")
        );
        assert_eq!(
            output_path(
                Path::new("/music/song.mid"),
                Some(Path::new("/out")),
                "_x",
                "csv"
            ),
            PathBuf::from("/out/song_x.csv")
        );
        assert_eq!(
            output_path(Path::new("song.midi"), None, "_rt", "mid"),
            PathBuf::from("song_rt.mid")
        );
    }

    #[test]
    fn options_fold_flags_over_config() {
        let mut config = OrchConfig::default();
        config.output.write_table = true;
        config.output.round_trip_tolerance = 3;
        let options = RunOptions::new(&config, None, false, Some(0), true);
        assert!(options.write_table);
        assert_eq!(options.tolerance, 0);
        assert_eq!(options.suffix, "_orchestrated");
    }

    #[test]
    fn orchestrate_writes_midi_and_table() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_piano(dir.path(), "piano.mid");
        let out = dir.path().join("out");

        let failures =
            orchestrate(&[input], &OrchConfig::default(), &options(Some(out.clone()), true))
                .unwrap();
        assert_eq!(failures, 0);

        let (matrix, _) = NoteMatrix::read_file(&out.join("piano_orchestrated.mid")).unwrap();
        let channels: Vec<u8> = matrix.notes.iter().map(|n| n.channel).collect();
        // canonical order is 55 harmony, 64 melody, 40 rhythm
        assert_eq!(channels, vec![1, 0, 2]);

        let csv = std::fs::read_to_string(out.join("piano_orchestrated.csv")).unwrap();
        assert_eq!(csv.lines().count(), 4);
    }

    #[test]
    fn shared_section_collision_is_reported_not_failed() {
        // channels 0 and 1 overlap on pitch 64; both land on the melody channel
        let dir = tempfile::tempdir().unwrap();
        let mut matrix = NoteMatrix::new(0, 480).unwrap();
        matrix.notes = vec![
            Note::new(0, 64, 100, 0, 960, 0),
            Note::new(1, 64, 100, 480, 960, 0),
        ];
        matrix.sort();
        let input = dir.path().join("duet.mid");
        std::fs::write(&input, to_smf_bytes(&matrix).unwrap()).unwrap();

        let config = OrchConfig::default();
        let orchestrator = Orchestrator::new(config.orchestra_table()).unwrap();
        let outcome = orchestrate_one(&input, &orchestrator, &options(None, false)).unwrap();
        assert!(outcome.error.is_none());
        assert!(outcome.round_trip.is_none());
        let mismatch = outcome.round_trip_mismatch.unwrap();
        assert!(mismatch.contains("expected 2, got 1"), "{mismatch}");

        let failures = orchestrate(&[input], &config, &options(None, false)).unwrap();
        assert_eq!(failures, 0);
        assert!(dir.path().join("duet_orchestrated.mid").exists());
    }

    #[test]
    fn one_bad_file_does_not_stop_the_batch() {
        let dir = tempfile::tempdir().unwrap();
        let good = write_piano(dir.path(), "good.mid");
        let bad = dir.path().join("bad.mid");
        std::fs::write(&bad, b"MThd garbage").unwrap();
        let missing = dir.path().join("missing.mid");

        let failures = roundtrip(&[bad, good, missing], &options(None, false)).unwrap();
        assert_eq!(failures, 2);
        assert!(dir.path().join("good_roundtrip.mid").exists());
    }

    #[test]
    fn failed_outcome_serializes_error_only() {
        let outcome = failed(Path::new("x.mid"), anyhow::anyhow!("boom"));
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["input"], "x.mid");
        assert_eq!(json["error"], "boom");
        assert!(json.get("output").is_none());
    }
}
