//! Auxiliary vendor log files and per-run data records.

use crate::error::AppResult;
use crate::pal::method::MethodKind;
use crate::pal::plan::PalAction;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

/// Header of the tab-separated file the vendor program appends to.
pub const AUX_LOG_HEADER: [&str; 8] = [
    "Date",
    "Method",
    "Tool",
    "Source",
    "DestinationTray",
    "DestinationSlot",
    "DestinationVial",
    "Volume",
];

/// Create the auxiliary log file of a plan. The vendor program only records
/// timing into a file that already exists.
pub fn create_aux_logfile(dir: &Path, plan_uuid: Uuid) -> AppResult<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = dir.join(format!("PAL_{}.txt", plan_uuid));
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_path(&path)?;
    writer.write_record(AUX_LOG_HEADER)?;
    writer.flush()?;
    debug!("created auxiliary log {}", path.display());
    Ok(path)
}

fn epoch(ts: Option<DateTime<Utc>>) -> Option<f64> {
    ts.map(|t| t.timestamp_micros() as f64 / 1e6)
}

/// One data record per completed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PalDataRecord {
    /// Plan the action belongs to
    pub plan_uuid: Uuid,
    /// The committed action
    pub action_uuid: Uuid,
    /// Labels of consumed or diluted samples
    pub samples_in: Vec<String>,
    /// Labels of created samples
    pub samples_out: Vec<String>,
    /// Record time, seconds since the Unix epoch
    #[serde(rename = "epoch_PAL")]
    pub epoch_pal: f64,
    /// Start trigger time, if triggers are configured
    pub epoch_start: Option<f64>,
    /// Continue trigger time
    pub epoch_continue: Option<f64>,
    /// Done trigger time
    pub epoch_done: Option<f64>,
    /// Syringe tool
    pub tool: String,
    /// Source descriptor, `tray` or a custom name
    pub source: String,
    /// Transferred volume
    pub volume_ul: f64,
    /// Source tray, for tray positions
    pub source_tray: Option<u32>,
    /// Source slot
    pub source_slot: Option<u32>,
    /// Source vial
    pub source_vial: Option<u32>,
    /// Destination descriptor
    pub dest: String,
    /// Destination tray, for tray positions
    pub dest_tray: Option<u32>,
    /// Destination slot
    pub dest_slot: Option<u32>,
    /// Destination vial
    pub dest_vial: Option<u32>,
    /// Auxiliary log of the plan
    pub logfile: String,
    /// Method that ran
    pub method: MethodKind,
}

impl PalDataRecord {
    /// Record of a committed action.
    pub fn from_action(
        plan_uuid: Uuid,
        action: &PalAction,
        logfile: &Path,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        let source = action.source.position.as_tray();
        let dest_position = action.dest.as_ref().map(|d| &d.position);
        let dest = dest_position.and_then(|p| p.as_tray());
        Self {
            plan_uuid,
            action_uuid: action.uuid,
            samples_in: action.samples_in.iter().map(|s| s.label()).collect(),
            samples_out: action.samples_out.iter().map(|s| s.label()).collect(),
            epoch_pal: recorded_at.timestamp_micros() as f64 / 1e6,
            epoch_start: epoch(action.start_time),
            epoch_continue: epoch(action.continue_time),
            epoch_done: epoch(action.done_time),
            tool: action.tool.clone(),
            source: action.source.position.descriptor().to_string(),
            volume_ul: action.volume_ul,
            source_tray: source.map(|t| t.tray),
            source_slot: source.map(|t| t.slot),
            source_vial: source.map(|t| t.vial),
            dest: dest_position
                .map(|p| p.descriptor().to_string())
                .unwrap_or_default(),
            dest_tray: dest.map(|t| t.tray),
            dest_slot: dest.map(|t| t.slot),
            dest_vial: dest.map(|t| t.vial),
            logfile: logfile.display().to_string(),
            method: action.method,
        }
    }
}

/// Appends records as JSON lines to `<dir>/<plan uuid>.jsonl`.
pub struct DataRecordWriter {
    path: PathBuf,
    out: BufWriter<File>,
}

impl DataRecordWriter {
    /// Writer for `<dir>/<plan uuid>.jsonl`, creating `dir` if needed.
    pub fn create(dir: &Path, plan_uuid: Uuid) -> AppResult<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.jsonl", plan_uuid));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            out: BufWriter::new(file),
        })
    }

    /// File the records go to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one JSON line.
    pub fn append(&mut self, record: &PalDataRecord) -> AppResult<()> {
        serde_json::to_writer(&mut self.out, record)?;
        self.out.write_all(b"\n")?;
        self.out.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pal::plan::{MicroOperation, WashFlags};
    use crate::position::{Position, RequestedPosition, ResolvedPosition, TrayPosition};
    use crate::sample::{Sample, SampleType};

    fn action() -> PalAction {
        let op = MicroOperation {
            method: MethodKind::TransferTrayCustom,
            tool: "LS3".into(),
            volume_ul: 100.0,
            wash: WashFlags::default(),
            requested_source: RequestedPosition::Tray(TrayPosition::new(1, 2, 3)),
            requested_dest: RequestedPosition::Custom("cell1_we".into()),
            transfer_type: None,
            repeat: 0,
            runs: Vec::new(),
        };
        let mut action = PalAction::new(&op, ResolvedPosition::new(Position::tray(1, 2, 3), vec![]));
        action.dest = Some(ResolvedPosition::new(Position::custom("cell1_we"), vec![]));
        action.push_input(
            Sample::reference(SampleType::Liquid, Some(1.0)),
            -0.1,
            false,
            SampleType::Liquid,
        );
        action
    }

    #[test]
    fn test_aux_logfile_has_tab_header() {
        let dir = tempfile::tempdir().unwrap();
        let uuid = Uuid::new_v4();
        let path = create_aux_logfile(dir.path(), uuid).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.trim_end(), AUX_LOG_HEADER.join("\t"));
        assert!(path.ends_with(format!("PAL_{}.txt", uuid)));
    }

    #[test]
    fn test_record_fields_from_action() {
        let record = PalDataRecord::from_action(Uuid::new_v4(), &action(), Path::new("log.txt"), Utc::now());
        assert_eq!(record.source, "tray");
        assert_eq!(record.source_slot, Some(2));
        assert_eq!(record.dest, "cell1_we");
        assert_eq!(record.dest_tray, None);
        assert_eq!(record.epoch_start, None);
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("epoch_PAL").is_some());
        assert_eq!(json["method"], "transfer_tray_custom");
    }

    #[test]
    fn test_writer_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let plan = Uuid::new_v4();
        let mut writer = DataRecordWriter::create(dir.path(), plan).unwrap();
        let record = PalDataRecord::from_action(plan, &action(), Path::new("log.txt"), Utc::now());
        writer.append(&record).unwrap();
        writer.append(&record).unwrap();
        let content = std::fs::read_to_string(writer.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let back: PalDataRecord = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(back.action_uuid, record.action_uuid);
        assert_eq!(back.samples_in, record.samples_in);
    }
}
