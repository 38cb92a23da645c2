// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Persona generation and assignment
//!
//! A template is resolved into an indexable persona source: uploaded records
//! are validated and materialized, attribute axes are decoded lazily from
//! an index into their cartesian product. A [`PersonaStream`] then maps
//! dispatch positions onto that source according to the assignment strategy.

use agentsim_core::{
    AssignmentStrategy, Level, Persona, PersonaAxes, PersonaTemplate, SimulationError,
    SimulationResult,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;

type Context = serde_json::Map<String, serde_json::Value>;

/// Indexable set of personas a batch draws from
#[derive(Debug, Clone)]
enum PersonaSource {
    Records(Arc<[Persona]>),
    Axes(Arc<PersonaAxes>),
}

impl PersonaSource {
    fn len(&self) -> usize {
        match self {
            PersonaSource::Records(records) => records.len(),
            PersonaSource::Axes(axes) => axis_radices(axes)
                .iter()
                .fold(1usize, |acc, r| acc.saturating_mul(*r)),
        }
    }

    fn get(&self, index: usize) -> Persona {
        match self {
            PersonaSource::Records(records) => records[index].clone(),
            PersonaSource::Axes(axes) => decode_axes(axes, index),
        }
    }
}

/// Axis sizes in decode order; an empty axis counts as one unset slot
fn axis_radices(axes: &PersonaAxes) -> [usize; 11] {
    [
        axes.age_ranges.len(),
        axes.genders.len(),
        axes.residences.len(),
        axes.income_ranges.len(),
        axes.personalities.len(),
        axes.emotional_baselines.len(),
        axes.urgency.len(),
        axes.patience.len(),
        axes.language_proficiency.len(),
        axes.intensity.len(),
        axes.occupations.len(),
    ]
    .map(|n| n.max(1))
}

/// Mixed-radix decode of `index` into one combination of axis values
fn decode_axes(axes: &PersonaAxes, index: usize) -> Persona {
    let radices = axis_radices(axes);
    let mut digits = [0usize; 11];
    let mut rest = index;
    for (digit, radix) in digits.iter_mut().zip(radices.iter()) {
        *digit = rest % radix;
        rest /= radix;
    }

    fn pick<T: Clone>(values: &[T], digit: usize) -> Option<T> {
        values.get(digit).cloned()
    }

    let mut persona = Persona::new(format!("persona-{}", index + 1));
    persona.demographics.age_range = pick(&axes.age_ranges, digits[0]);
    persona.demographics.gender = pick(&axes.genders, digits[1]);
    persona.demographics.residence = pick(&axes.residences, digits[2]);
    persona.demographics.income_range = pick(&axes.income_ranges, digits[3]);
    persona.psychology.personality = pick(&axes.personalities, digits[4]);
    persona.psychology.emotional_baseline = pick(&axes.emotional_baselines, digits[5]);
    persona.psychology.urgency = pick(&axes.urgency, digits[6]).unwrap_or_default();
    persona.psychology.patience = pick(&axes.patience, digits[7]).unwrap_or_default();
    persona.communication.language_proficiency = pick(&axes.language_proficiency, digits[8]);
    persona.communication.intensity = pick(&axes.intensity, digits[9]).unwrap_or_default();
    persona.occupation = pick(&axes.occupations, digits[10]);
    persona
}

fn parse_level(raw: &str) -> Option<Level> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "low" | "l" => Some(Level::Low),
        "medium" | "med" | "m" | "moderate" => Some(Level::Medium),
        "high" | "h" => Some(Level::High),
        other => match other.parse::<u8>() {
            Ok(0..=3) => Some(Level::Low),
            Ok(4..=6) => Some(Level::Medium),
            Ok(7..=10) => Some(Level::High),
            _ => None,
        },
    }
}

/// Build a persona from one uploaded row. Known columns populate the typed
/// fields; every non-identifier column is also kept in `attributes`.
fn persona_from_row(user_id: &str, id_column: &str, row: &BTreeMap<String, String>) -> Persona {
    let mut persona = Persona::new(user_id);
    for (column, value) in row {
        if column == id_column || value.trim().is_empty() {
            continue;
        }
        let value = value.trim().to_string();
        match column.to_ascii_lowercase().as_str() {
            "age" | "age_range" => persona.demographics.age_range = Some(value.clone()),
            "gender" => persona.demographics.gender = Some(value.clone()),
            "residence" | "location" => persona.demographics.residence = Some(value.clone()),
            "income" | "income_range" => persona.demographics.income_range = Some(value.clone()),
            "personality" => persona.psychology.personality = Some(value.clone()),
            "emotional_baseline" | "mood" => {
                persona.psychology.emotional_baseline = Some(value.clone())
            }
            "urgency" => {
                if let Some(level) = parse_level(&value) {
                    persona.psychology.urgency = level;
                }
            }
            "patience" => {
                if let Some(level) = parse_level(&value) {
                    persona.psychology.patience = level;
                }
            }
            "language_proficiency" | "language" => {
                persona.communication.language_proficiency = Some(value.clone())
            }
            "intensity" => {
                if let Some(level) = parse_level(&value) {
                    persona.communication.intensity = level;
                }
            }
            "occupation" => persona.occupation = Some(value.clone()),
            "notes" => persona.notes = Some(value.clone()),
            _ => {}
        }
        persona.attributes.insert(column.clone(), value);
    }
    persona
}

/// Read a CSV file with a header row into string records
pub fn load_csv_rows(path: &Path) -> SimulationResult<Vec<BTreeMap<String, String>>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|e| SimulationError::config(format!("{}: {}", path.display(), e)))?;

    let headers = reader
        .headers()
        .map_err(|e| SimulationError::config(format!("{}: {}", path.display(), e)))?
        .clone();

    let mut rows = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record.map_err(|e| {
            SimulationError::config(format!("{} row {}: {}", path.display(), line + 1, e))
        })?;
        rows.push(
            headers
                .iter()
                .zip(record.iter())
                .map(|(h, v)| (h.to_string(), v.to_string()))
                .collect(),
        );
    }
    Ok(rows)
}

/// Validate uploaded rows and turn them into personas
fn records_to_personas(
    id_column: &str,
    rows: &[BTreeMap<String, String>],
) -> SimulationResult<Vec<Persona>> {
    if rows.is_empty() {
        return Err(SimulationError::config("persona record set is empty"));
    }

    let mut seen = HashSet::new();
    rows.iter()
        .enumerate()
        .map(|(i, row)| {
            let id = row
                .get(id_column)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .ok_or_else(|| {
                    SimulationError::config(format!(
                        "persona record {} lacks required identifier column '{}'",
                        i + 1,
                        id_column
                    ))
                })?;
            if !seen.insert(id.to_string()) {
                return Err(SimulationError::config(format!(
                    "duplicate persona identifier '{}' in column '{}'",
                    id, id_column
                )));
            }
            Ok(persona_from_row(id, id_column, row))
        })
        .collect()
}

/// Resolves persona templates and produces assignment streams
#[derive(Debug, Clone)]
pub struct PersonaGenerator {
    source: PersonaSource,
    context: Arc<Context>,
}

impl PersonaGenerator {
    /// Resolve and validate a template. User context is merged into every
    /// persona produced.
    pub fn from_template(template: &PersonaTemplate, context: Context) -> SimulationResult<Self> {
        let source = match template {
            PersonaTemplate::Axes(axes) => PersonaSource::Axes(Arc::new(axes.clone())),
            PersonaTemplate::Records { id_column, rows } => {
                PersonaSource::Records(records_to_personas(id_column, rows)?.into())
            }
            PersonaTemplate::Csv { path, id_column } => {
                let rows = load_csv_rows(path)?;
                PersonaSource::Records(records_to_personas(id_column, &rows)?.into())
            }
        };

        Ok(Self {
            source,
            context: Arc::new(context),
        })
    }

    /// Number of distinct personas available
    pub fn available(&self) -> usize {
        self.source.len()
    }

    /// Stream of `count` personas assigned by `strategy`
    ///
    /// Random and round-robin orders are reproducible for a given seed; with
    /// no seed they are drawn from OS entropy.
    pub fn stream(
        &self,
        strategy: AssignmentStrategy,
        count: usize,
        seed: Option<u64>,
    ) -> PersonaStream {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        PersonaStream {
            source: self.source.clone(),
            context: self.context.clone(),
            strategy,
            rng,
            position: 0,
            count,
            cycle: CyclePermutation::identity(),
        }
    }

    /// One-shot convenience: resolve `template` and stream `count` personas
    pub fn generate(
        template: &PersonaTemplate,
        strategy: AssignmentStrategy,
        count: usize,
        seed: Option<u64>,
        context: Context,
    ) -> SimulationResult<PersonaStream> {
        Ok(Self::from_template(template, context)?.stream(strategy, count, seed))
    }
}

/// Permutation of `0..k` as `(offset + i * stride) mod k` with
/// `gcd(stride, k) == 1`; avoids materializing large axis products.
#[derive(Debug, Clone, Copy)]
struct CyclePermutation {
    offset: usize,
    stride: usize,
}

impl CyclePermutation {
    fn identity() -> Self {
        Self {
            offset: 0,
            stride: 1,
        }
    }

    fn draw(rng: &mut StdRng, k: usize) -> Self {
        if k <= 1 {
            return Self::identity();
        }
        let offset = rng.gen_range(0..k);
        let mut stride = rng.gen_range(1..k);
        while gcd(stride, k) != 1 {
            stride = rng.gen_range(1..k);
        }
        Self { offset, stride }
    }

    fn apply(&self, i: usize, k: usize) -> usize {
        ((self.offset as u128 + i as u128 * self.stride as u128) % k as u128) as usize
    }
}

fn gcd(mut a: usize, mut b: usize) -> usize {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// Lazy, finite, single-pass persona sequence
#[derive(Debug)]
pub struct PersonaStream {
    source: PersonaSource,
    context: Arc<Context>,
    strategy: AssignmentStrategy,
    rng: StdRng,
    position: usize,
    count: usize,
    cycle: CyclePermutation,
}

impl PersonaStream {
    /// Source index for the next dispatch position
    fn next_index(&mut self) -> usize {
        let k = self.source.len();
        match self.strategy {
            AssignmentStrategy::Sequential => self.position % k,
            AssignmentStrategy::Random => self.rng.gen_range(0..k),
            AssignmentStrategy::RoundRobin => {
                let within = self.position % k;
                if within == 0 {
                    self.cycle = CyclePermutation::draw(&mut self.rng, k);
                }
                self.cycle.apply(within, k)
            }
        }
    }
}

impl Iterator for PersonaStream {
    type Item = Persona;

    fn next(&mut self) -> Option<Persona> {
        if self.position >= self.count || self.source.len() == 0 {
            return None;
        }
        let index = self.next_index();
        self.position += 1;

        let mut persona = self.source.get(index);
        for (k, v) in self.context.iter() {
            persona.context.insert(k.clone(), v.clone());
        }
        Some(persona)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = if self.source.len() == 0 {
            0
        } else {
            self.count - self.position
        };
        (left, Some(left))
    }
}

impl ExactSizeIterator for PersonaStream {}
