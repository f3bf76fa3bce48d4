//! Position/sample archive.
//!
//! The archive is the authoritative mapping of positions to samples. The
//! dispatch core only talks to it through [`PositionArchive`]; the
//! [`InMemoryArchive`] implementation backs tests, dry runs and the simulation
//! binary.
//!
//! The core never locks around archive calls. Exactly one plan is active at a
//! time, so there is only ever one writer.

use crate::error::{AppResult, WorkcellError};
use crate::position::{CustomPositionCaps, Position, TrayPosition};
use crate::sample::{Sample, SampleStatus, SampleType};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;
use uuid::Uuid;

/// Narrow CRUD-like interface onto the position/sample archive.
#[async_trait]
pub trait PositionArchive: Send + Sync {
    /// Samples currently occupying `position`. Invalid positions are errors,
    /// empty positions return an empty list.
    async fn samples_at(&self, position: &Position) -> AppResult<Vec<Sample>>;

    /// Replace the samples held at `position`. Returns `false` if the archive
    /// refused the update.
    async fn update_position(&self, position: &Position, samples: &[Sample]) -> AppResult<bool>;

    /// Build reference samples of `output` type made from `inputs`.
    async fn create_reference_samples(
        &self,
        inputs: &[Sample],
        output: SampleType,
        volume_ml: Option<f64>,
        position: &Position,
        action_uuid: Uuid,
    ) -> AppResult<Vec<Sample>> {
        position.validate()?;
        let parents: Vec<&Sample> = inputs.iter().collect();
        Ok(vec![
            Sample::reference(output, volume_ml).derived_from(&parents, action_uuid)
        ])
    }

    /// Latest archived state of each sample. References already committed are
    /// resolved by uuid; others are returned as given.
    async fn get_samples(&self, samples: &[Sample]) -> AppResult<Vec<Sample>>;

    /// Persist new state for already committed samples.
    async fn update_samples(&self, samples: &[Sample]) -> AppResult<()>;

    /// Commit reference samples, assigning global labels.
    async fn commit_new_samples(&self, samples: &[Sample]) -> AppResult<Vec<Sample>>;

    /// Whether liquid may be dispensed into `position`.
    async fn is_dest_allowed(&self, position: &Position) -> AppResult<bool>;

    /// Whether `position` may combine samples of different types.
    async fn is_assembly_allowed(&self, position: &Position) -> AppResult<bool>;

    /// Whether samples placed at `position` are consumed.
    async fn is_destroying_position(&self, position: &Position) -> AppResult<bool>;

    /// First occupied vial strictly after `after`.
    async fn find_next_occupied(&self, after: Option<TrayPosition>) -> AppResult<Option<TrayPosition>>;

    /// First free vial strictly after `after` that holds at least `min_volume_ml`.
    async fn find_next_free(
        &self,
        min_volume_ml: f64,
        after: Option<TrayPosition>,
    ) -> AppResult<Option<TrayPosition>>;
}

/// Geometry of one tray.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrayLayout {
    /// Tray number
    pub tray: u32,
    /// Slots in the tray
    pub slots: u32,
    /// Vials in each slot
    pub vials_per_slot: u32,
    /// Volume a vial can hold
    pub vial_capacity_ml: f64,
}

/// Initial archive contents, as loaded by the simulation binary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArchiveSeed {
    /// Tray geometry
    #[serde(default)]
    pub trays: Vec<TrayLayout>,
    /// Samples placed before the first plan
    #[serde(default)]
    pub samples: Vec<SeedEntry>,
}

/// One pre-placed sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedEntry {
    /// Where the sample sits
    pub position: Position,
    /// Uncommitted snapshot; the archive assigns the label
    pub sample: Sample,
}

#[derive(Default)]
struct ArchiveState {
    positions: BTreeMap<Position, Vec<Sample>>,
    samples: HashMap<String, Sample>,
    labels_by_uuid: HashMap<Uuid, String>,
    next_id: u64,
    writes: u64,
}

impl ArchiveState {
    fn latest(&self, sample: &Sample) -> Sample {
        sample
            .global_label
            .as_ref()
            .and_then(|label| self.samples.get(label))
            .cloned()
            .unwrap_or_else(|| sample.clone())
    }

    fn commit(&mut self, archive_name: &str, sample: &Sample) -> Sample {
        if let Some(label) = self.labels_by_uuid.get(&sample.uuid) {
            if let Some(existing) = self.samples.get(label) {
                return existing.clone();
            }
        }
        if !sample.is_reference() {
            return self.latest(sample);
        }

        let mut committed = sample.clone();
        committed.parts = sample
            .parts
            .iter()
            .map(|p| self.commit(archive_name, p))
            .collect();
        self.next_id += 1;
        let label = format!("{}__{}", archive_name, self.next_id);
        committed.global_label = Some(label.clone());
        self.labels_by_uuid.insert(committed.uuid, label.clone());
        self.samples.insert(label, committed.clone());
        self.writes += 1;
        committed
    }
}

/// In-process archive with tray geometry and a custom position table.
pub struct InMemoryArchive {
    name: String,
    trays: Vec<TrayLayout>,
    custom: HashMap<String, CustomPositionCaps>,
    state: RwLock<ArchiveState>,
}

impl InMemoryArchive {
    /// Empty archive with the given trays and custom positions.
    pub fn new(
        name: impl Into<String>,
        trays: Vec<TrayLayout>,
        custom_positions: impl IntoIterator<Item = CustomPositionCaps>,
    ) -> Self {
        Self {
            name: name.into(),
            trays,
            custom: custom_positions
                .into_iter()
                .map(|c| (c.name.clone(), c))
                .collect(),
            state: RwLock::new(ArchiveState::default()),
        }
    }

    /// Build an archive and place the seeded samples.
    pub fn from_seed(
        name: impl Into<String>,
        seed: ArchiveSeed,
        custom_positions: impl IntoIterator<Item = CustomPositionCaps>,
    ) -> AppResult<Self> {
        let archive = Self::new(name, seed.trays, custom_positions);
        for entry in seed.samples {
            archive.place(&entry.position, entry.sample)?;
        }
        Ok(archive)
    }

    /// Commit `sample` (if it is a reference) and put it at `position`.
    pub fn place(&self, position: &Position, sample: Sample) -> AppResult<Sample> {
        self.check_known(position)?;
        let mut state = self.state.write();
        let committed = state.commit(&self.name, &sample);
        state
            .positions
            .entry(position.clone())
            .or_default()
            .push(committed.clone());
        Ok(committed)
    }

    /// Current samples at `position`, without going through the async trait.
    pub fn peek(&self, position: &Position) -> Vec<Sample> {
        let state = self.state.read();
        state
            .positions
            .get(position)
            .map(|held| held.iter().map(|s| state.latest(s)).collect())
            .unwrap_or_default()
    }

    /// Archived state of a sample by label.
    pub fn sample(&self, label: &str) -> Option<Sample> {
        self.state.read().samples.get(label).cloned()
    }

    /// Number of mutating calls served so far.
    pub fn write_count(&self) -> u64 {
        self.state.read().writes
    }

    fn check_known(&self, position: &Position) -> AppResult<()> {
        position.validate()?;
        match position {
            Position::Tray(t) => {
                let layout = self.trays.iter().find(|l| l.tray == t.tray);
                match layout {
                    Some(l) if t.slot <= l.slots && t.vial <= l.vials_per_slot => Ok(()),
                    _ => Err(WorkcellError::InvalidPosition(format!(
                        "{} does not exist",
                        t
                    ))),
                }
            }
            Position::Custom(name) if self.custom.contains_key(name) => Ok(()),
            Position::Custom(name) => Err(WorkcellError::InvalidPosition(format!(
                "unknown custom position '{}'",
                name
            ))),
        }
    }

    fn tray_positions(&self) -> impl Iterator<Item = (TrayPosition, f64)> + '_ {
        self.trays.iter().flat_map(|layout| {
            (1..=layout.slots).flat_map(move |slot| {
                (1..=layout.vials_per_slot).map(move |vial| {
                    (
                        TrayPosition::new(layout.tray, slot, vial),
                        layout.vial_capacity_ml,
                    )
                })
            })
        })
    }

    fn caps(&self, position: &Position) -> AppResult<Option<&CustomPositionCaps>> {
        self.check_known(position)?;
        Ok(match position {
            Position::Custom(name) => self.custom.get(name),
            Position::Tray(_) => None,
        })
    }
}

#[async_trait]
impl PositionArchive for InMemoryArchive {
    async fn samples_at(&self, position: &Position) -> AppResult<Vec<Sample>> {
        self.check_known(position)?;
        Ok(self.peek(position))
    }

    async fn update_position(&self, position: &Position, samples: &[Sample]) -> AppResult<bool> {
        if self.check_known(position).is_err() {
            return Ok(false);
        }
        if samples.iter().any(Sample::is_reference) {
            return Ok(false);
        }
        let kept: Vec<Sample> = samples
            .iter()
            .filter(|s| !s.has_status(SampleStatus::Destroyed))
            .cloned()
            .collect();
        let mut state = self.state.write();
        debug!("archive: {} now holds {} sample(s)", position, kept.len());
        if kept.is_empty() {
            state.positions.remove(position);
        } else {
            state.positions.insert(position.clone(), kept);
        }
        state.writes += 1;
        Ok(true)
    }

    async fn get_samples(&self, samples: &[Sample]) -> AppResult<Vec<Sample>> {
        let state = self.state.read();
        samples
            .iter()
            .map(|s| match &s.global_label {
                Some(label) => state.samples.get(label).cloned().ok_or_else(|| {
                    WorkcellError::NotAvailable(format!("sample '{}' is not archived", label))
                }),
                None => Ok(state
                    .labels_by_uuid
                    .get(&s.uuid)
                    .and_then(|label| state.samples.get(label))
                    .cloned()
                    .unwrap_or_else(|| s.clone())),
            })
            .collect()
    }

    async fn update_samples(&self, samples: &[Sample]) -> AppResult<()> {
        let mut state = self.state.write();
        for sample in samples {
            let Some(label) = sample.global_label.clone() else {
                return Err(WorkcellError::Archive(format!(
                    "cannot update uncommitted sample {}",
                    sample.label()
                )));
            };
            if !state.samples.contains_key(&label) {
                return Err(WorkcellError::NotAvailable(format!(
                    "sample '{}' is not archived",
                    label
                )));
            }
            for part in sample.parts.iter().filter(|p| !p.is_reference()) {
                if let Some(label) = &part.global_label {
                    state.samples.insert(label.clone(), part.clone());
                }
            }
            state.samples.insert(label, sample.clone());
        }
        state.writes += 1;
        Ok(())
    }

    async fn commit_new_samples(&self, samples: &[Sample]) -> AppResult<Vec<Sample>> {
        let mut state = self.state.write();
        Ok(samples.iter().map(|s| state.commit(&self.name, s)).collect())
    }

    async fn is_dest_allowed(&self, position: &Position) -> AppResult<bool> {
        Ok(self.caps(position)?.map_or(true, |c| c.dest_allowed))
    }

    async fn is_assembly_allowed(&self, position: &Position) -> AppResult<bool> {
        Ok(self.caps(position)?.is_some_and(|c| c.assembly_allowed))
    }

    async fn is_destroying_position(&self, position: &Position) -> AppResult<bool> {
        Ok(self.caps(position)?.is_some_and(|c| c.destroys))
    }

    async fn find_next_occupied(&self, after: Option<TrayPosition>) -> AppResult<Option<TrayPosition>> {
        let state = self.state.read();
        Ok(self
            .tray_positions()
            .map(|(pos, _)| pos)
            .filter(|pos| after.map_or(true, |a| *pos > a))
            .find(|pos| {
                state
                    .positions
                    .get(&Position::Tray(*pos))
                    .is_some_and(|held| !held.is_empty())
            }))
    }

    async fn find_next_free(
        &self,
        min_volume_ml: f64,
        after: Option<TrayPosition>,
    ) -> AppResult<Option<TrayPosition>> {
        let state = self.state.read();
        Ok(self
            .tray_positions()
            .filter(|(pos, _)| after.map_or(true, |a| *pos > a))
            .find(|(pos, capacity)| {
                *capacity >= min_volume_ml && !state.positions.contains_key(&Position::Tray(*pos))
            })
            .map(|(pos, _)| pos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn archive() -> InMemoryArchive {
        InMemoryArchive::new(
            "test",
            vec![TrayLayout {
                tray: 1,
                slots: 1,
                vials_per_slot: 4,
                vial_capacity_ml: 2.0,
            }],
            [CustomPositionCaps {
                name: "waste".into(),
                dest_allowed: true,
                assembly_allowed: false,
                destroys: true,
            }],
        )
    }

    #[tokio::test]
    async fn test_commit_assigns_unique_labels_once() {
        let archive = archive();
        let part = Sample::reference(SampleType::Liquid, Some(0.1));
        let assembly = Sample::assembly(vec![part.clone()]);
        let committed = archive
            .commit_new_samples(&[part.clone(), assembly])
            .await
            .unwrap();
        assert_eq!(committed[0].global_label.as_deref(), Some("test__1"));
        assert_eq!(committed[1].parts[0].global_label.as_deref(), Some("test__1"));
        assert_eq!(committed[1].global_label.as_deref(), Some("test__2"));
    }

    #[tokio::test]
    async fn test_unknown_positions_are_critical() {
        let archive = archive();
        let err = archive
            .samples_at(&Position::tray(2, 1, 1))
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::Critical);
        assert!(archive.samples_at(&Position::custom("bench")).await.is_err());
    }

    #[tokio::test]
    async fn test_next_vial_searches_walk_forward() {
        let archive = archive();
        archive
            .place(&Position::tray(1, 1, 2), Sample::reference(SampleType::Liquid, Some(1.0)))
            .unwrap();
        assert_eq!(
            archive.find_next_occupied(None).await.unwrap(),
            Some(TrayPosition::new(1, 1, 2))
        );
        assert_eq!(
            archive
                .find_next_occupied(Some(TrayPosition::new(1, 1, 2)))
                .await
                .unwrap(),
            None
        );
        assert_eq!(
            archive
                .find_next_free(0.5, Some(TrayPosition::new(1, 1, 1)))
                .await
                .unwrap(),
            Some(TrayPosition::new(1, 1, 3))
        );
        assert_eq!(archive.find_next_free(5.0, None).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_destroyed_samples_leave_the_position() {
        let archive = archive();
        let waste = Position::custom("waste");
        let mut sample = archive
            .place(&waste, Sample::reference(SampleType::Liquid, Some(0.1)))
            .unwrap();
        sample.push_status(SampleStatus::Destroyed);
        assert!(archive.update_position(&waste, &[sample]).await.unwrap());
        assert!(archive.peek(&waste).is_empty());
        assert!(archive.is_destroying_position(&waste).await.unwrap());
    }
}
