//! Sample custody records.
//!
//! A [`Sample`] is a value snapshot. "Mutating" a sample produces a new snapshot
//! (see [`Sample::with_custody`] and [`Sample::with_volume_delta`]) which then
//! replaces the previous one wherever it is held. Bookkeeping lists therefore
//! always own independent copies, and a later status change on a working copy
//! can never leak into an already recorded snapshot.
//!
//! Samples that have not been committed to the archive are *references*: they
//! carry a local `uuid` but no `global_label`. The archive assigns the label on
//! commit and keeps the `uuid`, so a reference can always be matched to its
//! committed form.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;
use uuid::Uuid;

/// Physical sample type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleType {
    /// Solid material
    Solid,
    /// Liquid, tracks a volume
    Liquid,
    /// Gas, tracks a volume
    Gas,
    /// Several parts at one position
    Assembly,
}

impl SampleType {
    /// Only liquids and gases track a volume.
    pub fn has_volume(self) -> bool {
        matches!(self, SampleType::Liquid | SampleType::Gas)
    }
}

impl fmt::Display for SampleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SampleType::Solid => "solid",
            SampleType::Liquid => "liquid",
            SampleType::Gas => "gas",
            SampleType::Assembly => "assembly",
        };
        f.write_str(s)
    }
}

/// Status tags appended over a sample's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleStatus {
    /// Created by an action
    Created,
    /// Took part in an action and still exists
    Preserved,
    /// Became part of an assembly
    Incorporated,
    /// Taken back out of an assembly
    Recovered,
    /// Consumed, for example by an injector
    Destroyed,
}

/// Which direction material may flow between this sample and its relatives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Inheritance {
    /// May only give material
    GiveOnly,
    /// May only receive material
    ReceiveOnly,
    /// May give and receive
    AllowBoth,
}

/// A sample snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Local identity, stable from reference to committed sample
    pub uuid: Uuid,
    /// Sample type tag
    pub kind: SampleType,
    /// Archive-wide label; `None` while the sample is a reference
    #[serde(default)]
    pub global_label: Option<String>,
    /// Volume in mL (liquid and gas only)
    #[serde(default)]
    pub volume_ml: Option<f64>,
    /// Dilution relative to the sample as first created (liquid and gas only)
    #[serde(default)]
    pub dilution_factor: Option<f64>,
    /// Status history
    #[serde(default)]
    pub status: Vec<SampleStatus>,
    /// Custody policy; `None` until the destination is known
    #[serde(default)]
    pub inheritance: Option<Inheritance>,
    /// Constituents of an assembly, in order of incorporation
    #[serde(default)]
    pub parts: Vec<Sample>,
    /// Labels of the samples this one was made from
    #[serde(default)]
    pub source: Vec<String>,
    /// Action that caused the sample to exist
    #[serde(default)]
    pub action_uuid: Option<Uuid>,
    /// Set when the creating run completes
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl Sample {
    /// Create a reference sample that does not exist in the archive yet.
    pub fn reference(kind: SampleType, volume_ml: Option<f64>) -> Self {
        let (volume_ml, dilution_factor) = if kind.has_volume() {
            (Some(volume_ml.unwrap_or(0.0)), Some(1.0))
        } else {
            (None, None)
        };
        Self {
            uuid: Uuid::new_v4(),
            kind,
            global_label: None,
            volume_ml,
            dilution_factor,
            status: Vec::new(),
            inheritance: None,
            parts: Vec::new(),
            source: Vec::new(),
            action_uuid: None,
            created_at: None,
        }
    }

    /// Create a reference assembly from its parts.
    pub fn assembly(parts: Vec<Sample>) -> Self {
        let mut sample = Self::reference(SampleType::Assembly, None);
        sample.source = parts.iter().map(Sample::label).collect();
        sample.parts = parts;
        sample
    }

    /// Not yet committed, so it has no global label.
    pub fn is_reference(&self) -> bool {
        self.global_label.is_none()
    }

    /// Whether this sample is an assembly of parts.
    pub fn is_assembly(&self) -> bool {
        self.kind == SampleType::Assembly
    }

    /// Label used in records: the global label, or a reference tag.
    pub fn label(&self) -> String {
        match &self.global_label {
            Some(label) => label.clone(),
            None => format!("ref:{}", self.uuid),
        }
    }

    /// Whether `status` was ever recorded.
    pub fn has_status(&self, status: SampleStatus) -> bool {
        self.status.contains(&status)
    }

    /// Append a status tag once.
    pub fn push_status(&mut self, status: SampleStatus) {
        if !self.has_status(status) {
            self.status.push(status);
        }
    }

    /// Snapshot with the custody pair replaced.
    pub fn with_custody(&self, inheritance: Option<Inheritance>, status: &[SampleStatus]) -> Self {
        let mut next = self.clone();
        next.inheritance = inheritance;
        next.status = status.to_vec();
        next
    }

    /// Snapshot with `source` and `action_uuid` filled in.
    pub fn derived_from(mut self, parents: &[&Sample], action_uuid: Uuid) -> Self {
        self.source = parents.iter().map(|p| p.label()).collect();
        self.action_uuid = Some(action_uuid);
        self
    }

    /// First assembly part of the given type.
    pub fn part_of_type(&self, kind: SampleType) -> Option<&Sample> {
        self.parts.iter().find(|p| p.kind == kind)
    }

    /// Snapshot with a volume change applied.
    ///
    /// `delta_ml` is signed: negative for liquid leaving, positive for liquid
    /// arriving. With `dilute` the dilution factor follows the new volume.
    /// Assemblies apply the delta to every part of `target`; a sample whose
    /// type does not match `target`, or which tracks no volume, is returned
    /// unchanged.
    pub fn with_volume_delta(&self, delta_ml: f64, dilute: bool, target: SampleType) -> Self {
        if self.is_assembly() {
            let mut next = self.clone();
            next.parts = self
                .parts
                .iter()
                .map(|p| p.with_volume_delta(delta_ml, dilute, target))
                .collect();
            return next;
        }

        if self.kind != target || !self.kind.has_volume() {
            return self.clone();
        }

        let mut next = self.clone();
        let old_volume = self.volume_ml.unwrap_or(0.0);
        let mut total = old_volume + delta_ml;
        if total < 0.0 {
            warn!(
                "sample {} volume would drop below zero ({:.4} mL), clamping",
                self.label(),
                total
            );
            total = 0.0;
        }
        next.volume_ml = Some(total);

        if dilute {
            let old_factor = self.dilution_factor.unwrap_or(1.0);
            let factor = if old_volume <= 0.0 || old_factor <= 0.0 {
                1.0
            } else {
                total / (old_volume / old_factor)
            };
            next.dilution_factor = Some(factor);
        }
        next
    }

    /// Stamp the creation time on this sample and on any assembly part that
    /// has not been stamped yet.
    pub fn stamp_created(&mut self, at: DateTime<Utc>) {
        if self.created_at.is_none() {
            self.created_at = Some(at);
        }
        for part in &mut self.parts {
            part.stamp_created(at);
        }
    }
}
