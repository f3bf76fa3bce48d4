//! Job plan data types.
//!
//! A [`JobPlan`] is the unit of work handed to the dispatch loop: an ordered
//! list of [`MicroOperation`]s plus the repeat/spacing policy. Compiling the
//! plan appends one [`PalAction`] per executed repetition to each operation
//! and fills the vendor [`JobEntry`] list.

use crate::error::{AppResult, WorkcellError};
use crate::pal::method::MethodKind;
use crate::pal::scheduler::SpacingPolicy;
use crate::position::{Position, RequestedPosition, ResolvedPosition};
use crate::sample::{Sample, SampleType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Separator of the vendor parameter string.
pub const PARAM_SEPARATOR: char = ';';

/// Number of fields in a vendor parameter string.
const PARAM_FIELDS: usize = 15;

/// Needle wash selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WashFlags {
    /// Wash station 1
    #[serde(default)]
    pub wash1: bool,
    /// Wash station 2
    #[serde(default)]
    pub wash2: bool,
    /// Wash station 3
    #[serde(default)]
    pub wash3: bool,
    /// Wash station 4
    #[serde(default)]
    pub wash4: bool,
}

impl WashFlags {
    fn as_array(self) -> [bool; 4] {
        [self.wash1, self.wash2, self.wash3, self.wash4]
    }
}

/// One named chemistry action with its requested positions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MicroOperation {
    /// Method to run
    pub method: MethodKind,
    /// Syringe tool
    pub tool: String,
    /// Volume per repetition
    pub volume_ul: f64,
    /// Washes after the transfer
    pub wash: WashFlags,
    /// Updated in place when a search resolves, see [`RequestedPosition`]
    pub requested_source: RequestedPosition,
    /// Destination, fixed or a search
    pub requested_dest: RequestedPosition,
    /// Type of material moved; `None` takes the source sample's type
    #[serde(default)]
    pub transfer_type: Option<SampleType>,
    /// Additional repetitions within one run
    #[serde(default)]
    pub repeat: u32,
    /// One record per executed repetition
    #[serde(default)]
    pub runs: Vec<PalAction>,
}

impl MicroOperation {
    /// Volume per repetition in millilitres.
    pub fn volume_ml(&self) -> f64 {
        self.volume_ul / 1000.0
    }
}

/// One concrete execution of a micro-operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PalAction {
    /// Unique id
    pub uuid: Uuid,
    /// Method to run
    pub method: MethodKind,
    /// Syringe tool
    pub tool: String,
    /// Volume per repetition
    pub volume_ul: f64,
    /// Resolved source
    pub source: ResolvedPosition,
    /// Set once the destination is resolved
    pub dest: Option<ResolvedPosition>,
    /// Inputs, index-aligned with the three vectors below
    pub samples_in: Vec<Sample>,
    /// Volume change per input, aligned with `samples_in`
    pub delta_volume_ml: Vec<f64>,
    /// Whether each input is diluted
    pub dilute: Vec<bool>,
    /// Material added to each diluted input
    pub dilute_type: Vec<SampleType>,
    /// Created samples
    pub samples_out: Vec<Sample>,
    /// Start trigger time
    pub start_time: Option<DateTime<Utc>>,
    /// Continue trigger time
    pub continue_time: Option<DateTime<Utc>>,
    /// Done trigger time
    pub done_time: Option<DateTime<Utc>>,
    /// Set once bookkeeping reached the archive
    pub committed: bool,
}

impl PalAction {
    /// Uncommitted action for `op` with a resolved source.
    pub fn new(op: &MicroOperation, source: ResolvedPosition) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            method: op.method,
            tool: op.tool.clone(),
            volume_ul: op.volume_ul,
            source,
            dest: None,
            samples_in: Vec::new(),
            delta_volume_ml: Vec::new(),
            dilute: Vec::new(),
            dilute_type: Vec::new(),
            samples_out: Vec::new(),
            start_time: None,
            continue_time: None,
            done_time: None,
            committed: false,
        }
    }

    /// Append an input together with its volume bookkeeping.
    pub fn push_input(&mut self, sample: Sample, delta_ml: f64, dilute: bool, dilute_type: SampleType) {
        self.samples_in.push(sample);
        self.delta_volume_ml.push(delta_ml);
        self.dilute.push(dilute);
        self.dilute_type.push(dilute_type);
    }
}

/// Position of an action inside a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionIndex {
    /// Index into `micro_ops`
    pub op: usize,
    /// Index into the operation's `runs`
    pub run: usize,
}

/// One vendor job-list entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEntry {
    /// Vendor method file
    pub method_file: PathBuf,
    /// Semicolon-separated parameter string
    pub params: String,
}

/// Fields recovered from a vendor parameter string.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedJob {
    /// Syringe tool
    pub tool: String,
    /// Volume per repetition
    pub volume_ul: f64,
    /// Source position
    pub source: Position,
    /// Destination position
    pub dest: Position,
    /// Washes after the transfer
    pub wash: WashFlags,
    /// Auxiliary log file
    pub logfile: PathBuf,
}

impl JobEntry {
    /// Encode one repetition. Field order: tool, volume, source descriptor,
    /// source tray/slot/vial, destination descriptor, destination
    /// tray/slot/vial, four wash flags, auxiliary log file.
    pub fn encode(
        method_file: &Path,
        op: &MicroOperation,
        source: &Position,
        dest: &Position,
        logfile: &Path,
    ) -> Self {
        let mut fields: Vec<String> = Vec::with_capacity(PARAM_FIELDS);
        fields.push(op.tool.clone());
        fields.push(op.volume_ul.to_string());
        fields.push(source.descriptor().to_string());
        fields.extend(source.coordinate_fields());
        fields.push(dest.descriptor().to_string());
        fields.extend(dest.coordinate_fields());
        fields.extend(
            op.wash
                .as_array()
                .iter()
                .map(|w| if *w { "True" } else { "False" }.to_string()),
        );
        fields.push(logfile.display().to_string());

        Self {
            method_file: method_file.to_path_buf(),
            params: fields.join(&PARAM_SEPARATOR.to_string()),
        }
    }

    /// Parse the parameter string back into its fields.
    pub fn decode(&self) -> AppResult<DecodedJob> {
        let fields: Vec<&str> = self.params.split(PARAM_SEPARATOR).collect();
        if fields.len() != PARAM_FIELDS {
            return Err(WorkcellError::Bug(format!(
                "job entry has {} fields, expected {}",
                fields.len(),
                PARAM_FIELDS
            )));
        }
        let volume_ul = fields[1].parse::<f64>().map_err(|_| {
            WorkcellError::Bug(format!("job entry volume '{}' is not numeric", fields[1]))
        })?;
        let flag = |s: &str| s == "True";
        Ok(DecodedJob {
            tool: fields[0].to_string(),
            volume_ul,
            source: Position::from_vendor_fields(fields[2], [fields[3], fields[4], fields[5]])?,
            dest: Position::from_vendor_fields(fields[6], [fields[7], fields[8], fields[9]])?,
            wash: WashFlags {
                wash1: flag(fields[10]),
                wash2: flag(fields[11]),
                wash3: flag(fields[12]),
                wash4: flag(fields[13]),
            },
            logfile: PathBuf::from(fields[14]),
        })
    }
}

/// The top-level unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPlan {
    /// Unique id
    pub uuid: Uuid,
    /// Operations executed in order within each run
    pub micro_ops: Vec<MicroOperation>,
    /// Number of runs
    pub totalruns: u32,
    /// Delays between runs
    pub spacing: SpacingPolicy,
    /// Vendor job list of the most recent run
    #[serde(default)]
    pub joblist: Vec<JobEntry>,
    /// Plan-level snapshots of every committed input
    #[serde(default)]
    pub samples_in: Vec<Sample>,
    /// Plan-level snapshots of every committed output
    #[serde(default)]
    pub samples_out: Vec<Sample>,
    /// Tab-separated log handed to the vendor program
    #[serde(default)]
    pub aux_logfile: Option<PathBuf>,
}

impl JobPlan {
    /// New plan with a fresh uuid.
    pub fn new(micro_ops: Vec<MicroOperation>, totalruns: u32, spacing: SpacingPolicy) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            micro_ops,
            totalruns: totalruns.max(1),
            spacing,
            joblist: Vec::new(),
            samples_in: Vec::new(),
            samples_out: Vec::new(),
            aux_logfile: None,
        }
    }

    /// Action at `idx`, if it exists.
    pub fn action(&self, idx: ActionIndex) -> Option<&PalAction> {
        self.micro_ops.get(idx.op).and_then(|op| op.runs.get(idx.run))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::TrayPosition;

    fn op() -> MicroOperation {
        MicroOperation {
            method: MethodKind::TransferTrayTray,
            tool: "LS3".to_string(),
            volume_ul: 100.0,
            wash: WashFlags {
                wash1: true,
                ..Default::default()
            },
            requested_source: RequestedPosition::Tray(TrayPosition::new(1, 1, 1)),
            requested_dest: RequestedPosition::Tray(TrayPosition::new(1, 1, 2)),
            transfer_type: None,
            repeat: 0,
            runs: Vec::new(),
        }
    }

    #[test]
    fn test_job_entry_reconstructs_positions_and_volume() {
        let source = Position::tray(1, 1, 1);
        let dest = Position::custom("cell1_we");
        let entry = JobEntry::encode(
            Path::new("methods/transfer.cam"),
            &op(),
            &source,
            &dest,
            Path::new("logs/PAL_x.txt"),
        );
        assert_eq!(
            entry.params,
            "LS3;100;tray;1;1;1;cell1_we;;;;True;False;False;False;logs/PAL_x.txt"
        );
        let decoded = entry.decode().unwrap();
        assert_eq!(decoded.source, source);
        assert_eq!(decoded.dest, dest);
        assert_eq!(decoded.volume_ul, 100.0);
        assert!(decoded.wash.wash1 && !decoded.wash.wash4);
    }

    #[test]
    fn test_malformed_entry_is_bug() {
        let entry = JobEntry {
            method_file: PathBuf::from("m.cam"),
            params: "LS3;100".to_string(),
        };
        assert_eq!(entry.decode().unwrap_err().code(), crate::error::ErrorCode::Bug);
    }

    #[test]
    fn test_plan_has_at_least_one_run() {
        let plan = JobPlan::new(vec![op()], 0, SpacingPolicy::default());
        assert_eq!(plan.totalruns, 1);
        assert_eq!(plan.micro_ops[0].volume_ml(), 0.1);
    }
}
