//! Pitch-layered, beat-scheduled re-channelling of notes onto an orchestra.
//!
//! Every note gets a [`Layer`] from its pitch alone and a [`Combo`] from its
//! onset beat alone. The `(combo, layer)` slot of the [`OrchestraTable`]
//! names the output channel and instrument. Nothing depends on neighbouring
//! notes, so the assignment is a pure function of the note.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::matrix::{Note, NoteMatrix};
use crate::{Error, Result};

/// Register role derived from pitch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    Melody,
    Harmony,
    Rhythm,
}

impl Layer {
    pub const ALL: [Layer; 3] = [Layer::Melody, Layer::Harmony, Layer::Rhythm];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Melody => "melody",
            Self::Harmony => "harmony",
            Self::Rhythm => "rhythm",
        }
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which instrument combination is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Combo {
    Combo1,
    Combo2,
}

impl Combo {
    pub const ALL: [Combo; 2] = [Combo::Combo1, Combo::Combo2];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Combo1 => "combo1",
            Self::Combo2 => "combo2",
        }
    }
}

impl fmt::Display for Combo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A GM instrument and its comfortable playing range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instrument {
    pub name: String,
    pub program: u8,
    pub low: u8,
    pub high: u8,
}

impl Instrument {
    pub fn new(name: &str, program: u8, low: u8, high: u8) -> Self {
        Self {
            name: name.to_string(),
            program,
            low,
            high,
        }
    }

    pub fn in_range(&self, pitch: u8) -> bool {
        (self.low..=self.high).contains(&pitch)
    }
}

/// Output channel (1-16) and instrument for one `(combo, layer)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub channel: u8,
    #[serde(flatten)]
    pub instrument: Instrument,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComboSlots {
    pub melody: Slot,
    pub harmony: Slot,
    pub rhythm: Slot,
}

impl ComboSlots {
    pub fn slot(&self, layer: Layer) -> &Slot {
        match layer {
            Layer::Melody => &self.melody,
            Layer::Harmony => &self.harmony,
            Layer::Rhythm => &self.rhythm,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComboTable {
    pub combo1: ComboSlots,
    pub combo2: ComboSlots,
}

impl ComboTable {
    pub fn slots(&self, combo: Combo) -> &ComboSlots {
        match combo {
            Combo::Combo1 => &self.combo1,
            Combo::Combo2 => &self.combo2,
        }
    }

    pub fn slot(&self, combo: Combo, layer: Layer) -> &Slot {
        self.slots(combo).slot(layer)
    }
}

impl Default for ComboTable {
    fn default() -> Self {
        Self {
            // Strings
            combo1: ComboSlots {
                melody: Slot {
                    channel: 1,
                    instrument: Instrument::new("Violin", 40, 55, 103),
                },
                harmony: Slot {
                    channel: 2,
                    instrument: Instrument::new("Cello", 42, 36, 76),
                },
                rhythm: Slot {
                    channel: 3,
                    instrument: Instrument::new("Contrabass", 43, 28, 67),
                },
            },
            // Winds
            combo2: ComboSlots {
                melody: Slot {
                    channel: 4,
                    instrument: Instrument::new("Flute", 73, 60, 96),
                },
                harmony: Slot {
                    channel: 5,
                    instrument: Instrument::new("Clarinet", 71, 50, 94),
                },
                rhythm: Slot {
                    channel: 6,
                    instrument: Instrument::new("French Horn", 60, 34, 77),
                },
            },
        }
    }
}

/// Pitch thresholds splitting the keyboard into layers.
///
/// `pitch > melody_above` is melody, `pitch < rhythm_below` is rhythm,
/// everything in between (both bounds inclusive) is harmony.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerThresholds {
    pub melody_above: u8,
    pub rhythm_below: u8,
}

impl Default for LayerThresholds {
    fn default() -> Self {
        Self {
            melody_above: 60,
            rhythm_below: 50,
        }
    }
}

impl LayerThresholds {
    pub fn layer(&self, pitch: u8) -> Layer {
        if pitch > self.melody_above {
            Layer::Melody
        } else if pitch >= self.rhythm_below {
            Layer::Harmony
        } else {
            Layer::Rhythm
        }
    }
}

/// Repeating beat cycle: `combo1_beats` of combo1, then `combo2_beats` of combo2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComboSchedule {
    pub combo1_beats: u32,
    pub combo2_beats: u32,
}

impl Default for ComboSchedule {
    fn default() -> Self {
        Self {
            combo1_beats: 16,
            combo2_beats: 8,
        }
    }
}

impl ComboSchedule {
    pub fn cycle_beats(&self) -> u64 {
        self.combo1_beats as u64 + self.combo2_beats as u64
    }

    /// Combo active at a beat position.
    pub fn combo_at(&self, beats: f64) -> Combo {
        let cycle = self.cycle_beats();
        if cycle == 0 {
            return Combo::Combo1;
        }
        let beat = beats.max(0.0).floor() as u64;
        if beat % cycle < self.combo1_beats as u64 {
            Combo::Combo1
        } else {
            Combo::Combo2
        }
    }
}

/// Static orchestration policy injected into the [`Orchestrator`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestraTable {
    #[serde(default)]
    pub layers: LayerThresholds,
    #[serde(default)]
    pub schedule: ComboSchedule,
    #[serde(default)]
    pub combos: ComboTable,
}

impl OrchestraTable {
    /// Check that the table can produce a writable file.
    pub fn validate(&self) -> Result<()> {
        if self.schedule.combo1_beats == 0 || self.schedule.combo2_beats == 0 {
            return Err(Error::InvalidTable(
                "combo windows must be at least one beat".to_string(),
            ));
        }
        if self.layers.rhythm_below as u16 > self.layers.melody_above as u16 + 1 {
            return Err(Error::InvalidTable(format!(
                "rhythm_below {} overlaps melody_above {}",
                self.layers.rhythm_below, self.layers.melody_above
            )));
        }

        let mut programs: BTreeMap<u8, (u8, Combo, Layer)> = BTreeMap::new();
        for combo in Combo::ALL {
            for layer in Layer::ALL {
                let slot = self.combos.slot(combo, layer);
                if !(1..=16).contains(&slot.channel) {
                    return Err(Error::InvalidTable(format!(
                        "{combo}.{layer}: channel {} outside 1-16",
                        slot.channel
                    )));
                }
                if slot.instrument.program > 127 {
                    return Err(Error::InvalidTable(format!(
                        "{combo}.{layer}: program {} outside 0-127",
                        slot.instrument.program
                    )));
                }
                if slot.instrument.low > slot.instrument.high {
                    return Err(Error::InvalidTable(format!(
                        "{combo}.{layer}: range {}-{} is empty",
                        slot.instrument.low, slot.instrument.high
                    )));
                }
                if let Some(&(program, other_combo, other_layer)) = programs.get(&slot.channel) {
                    if program != slot.instrument.program {
                        return Err(Error::InvalidTable(format!(
                            "channel {} carries program {} for {other_combo}.{other_layer} and {} for {combo}.{layer}",
                            slot.channel, program, slot.instrument.program
                        )));
                    }
                }
                programs.insert(slot.channel, (slot.instrument.program, combo, layer));
            }
        }

        Ok(())
    }
}

/// Per-note orchestration decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub layer: Layer,
    pub combo: Combo,
    /// 1-16.
    pub new_channel: u8,
    pub new_program: u8,
    pub new_instrument: String,
}

#[cfg(test)]
impl Assignment {
    pub(crate) fn for_test(new_channel: u8, new_program: u8) -> Self {
        Self {
            layer: Layer::Melody,
            combo: Combo::Combo1,
            new_channel,
            new_program,
            new_instrument: String::new(),
        }
    }
}

/// Counts from one orchestration pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestrationReport {
    pub notes: usize,
    pub per_layer: BTreeMap<Layer, usize>,
    pub per_combo: BTreeMap<Combo, usize>,
    /// Notes outside the assigned instrument's playing range.
    pub out_of_range: usize,
    /// Output channel (1-16) → program.
    pub channels: BTreeMap<u8, u8>,
}

impl fmt::Display for OrchestrationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = |layer| self.per_layer.get(&layer).copied().unwrap_or(0);
        write!(
            f,
            "{} notes orchestrated ({} melody, {} harmony, {} rhythm) on {} channels",
            self.notes,
            count(Layer::Melody),
            count(Layer::Harmony),
            count(Layer::Rhythm),
            self.channels.len()
        )?;
        if self.out_of_range > 0 {
            write!(f, ", {} outside instrument range", self.out_of_range)?;
        }
        Ok(())
    }
}

/// Applies an [`OrchestraTable`] to notes.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    table: OrchestraTable,
}

impl Orchestrator {
    pub fn new(table: OrchestraTable) -> Result<Self> {
        table.validate()?;
        Ok(Self { table })
    }

    pub fn table(&self) -> &OrchestraTable {
        &self.table
    }

    pub fn layer_for(&self, pitch: u8) -> Layer {
        self.table.layers.layer(pitch)
    }

    pub fn combo_for(&self, onset_beats: f64) -> Combo {
        self.table.schedule.combo_at(onset_beats)
    }

    /// Decide the slot for one note.
    pub fn assign(&self, note: &Note, ticks_per_beat: u16) -> Assignment {
        let layer = self.layer_for(note.pitch);
        let onset_beats = note.onset_tick as f64 / ticks_per_beat as f64;
        let combo = self.combo_for(onset_beats);
        let slot = self.table.combos.slot(combo, layer);

        Assignment {
            layer,
            combo,
            new_channel: slot.channel,
            new_program: slot.instrument.program,
            new_instrument: slot.instrument.name.clone(),
        }
    }

    /// Annotate every note of a parsed matrix.
    ///
    /// Existing assignments are replaced, so re-orchestrating with a new
    /// table is allowed.
    pub fn orchestrate(&self, mut matrix: NoteMatrix) -> (NoteMatrix, OrchestrationReport) {
        let ticks_per_beat = matrix.ticks_per_beat();
        let mut report = OrchestrationReport {
            notes: matrix.notes.len(),
            ..Default::default()
        };

        for note in &mut matrix.notes {
            let assignment = self.assign(note, ticks_per_beat);
            let slot = self.table.combos.slot(assignment.combo, assignment.layer);

            *report.per_layer.entry(assignment.layer).or_default() += 1;
            *report.per_combo.entry(assignment.combo).or_default() += 1;
            report
                .channels
                .insert(assignment.new_channel, assignment.new_program);
            if !slot.instrument.in_range(note.pitch) {
                report.out_of_range += 1;
                debug!(
                    pitch = note.pitch,
                    onset = note.onset_tick,
                    instrument = %slot.instrument.name,
                    "note outside instrument range"
                );
            }

            note.assignment = Some(assignment);
        }

        info!("{report}");
        (matrix, report)
    }
}
