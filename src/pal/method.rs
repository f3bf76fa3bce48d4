//! Chemistry methods understood by the autosampler.
//!
//! Every request names one [`PalMethod`] variant carrying its typed
//! parameters. The variant is turned into a [`MicroOperation`] when the plan
//! is built, so an unknown method can never reach the dispatch loop; the only
//! runtime lookup left is the vendor method file in the configuration table.

use crate::error::{AppResult, WorkcellError};
use crate::pal::plan::{JobPlan, MicroOperation, WashFlags};
use crate::pal::scheduler::SpacingPolicy;
use crate::position::{RequestedPosition, TrayPosition};
use crate::sample::SampleType;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Method name, also the key of the configured method table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MethodKind {
    /// Tray vial to tray vial
    TransferTrayTray,
    /// Custom position to custom position
    TransferCustomCustom,
    /// Tray vial to custom position
    TransferTrayCustom,
    /// Custom position to tray vial
    TransferCustomTray,
    /// Custom position into the next empty vial
    Archive,
    /// Gas from occupied vials into an injector
    HeadspaceInjection,
    /// Liquid from occupied vials into an injector
    LiquidInjection,
}

impl MethodKind {
    /// Every method, in table order.
    pub const ALL: [MethodKind; 7] = [
        MethodKind::TransferTrayTray,
        MethodKind::TransferCustomCustom,
        MethodKind::TransferTrayCustom,
        MethodKind::TransferCustomTray,
        MethodKind::Archive,
        MethodKind::HeadspaceInjection,
        MethodKind::LiquidInjection,
    ];

    /// Name used in the method table and in requests.
    pub fn as_str(self) -> &'static str {
        match self {
            MethodKind::TransferTrayTray => "transfer_tray_tray",
            MethodKind::TransferCustomCustom => "transfer_custom_custom",
            MethodKind::TransferTrayCustom => "transfer_tray_custom",
            MethodKind::TransferCustomTray => "transfer_custom_tray",
            MethodKind::Archive => "archive",
            MethodKind::HeadspaceInjection => "headspace_injection",
            MethodKind::LiquidInjection => "liquid_injection",
        }
    }

    /// Inverse of [`MethodKind::as_str`].
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }
}

impl fmt::Display for MethodKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters shared by every method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolParams {
    /// Syringe tool name
    pub tool: String,
    /// Volume per repetition
    pub volume_ul: f64,
    /// Washes after the transfer
    #[serde(default)]
    pub wash: WashFlags,
    /// Additional repetitions within one run
    #[serde(default)]
    pub repeat: u32,
}

/// Tray vial to tray vial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferTrayTrayParams {
    /// Tool, volume and washes
    #[serde(flatten)]
    pub common: ToolParams,
    /// Source vial
    pub source: TrayPosition,
    /// `None` dispenses into the next empty vial
    #[serde(default)]
    pub dest: Option<TrayPosition>,
}

/// Custom position to custom position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferCustomCustomParams {
    /// Tool, volume and washes
    #[serde(flatten)]
    pub common: ToolParams,
    /// Source custom position
    pub source: String,
    /// Destination custom position
    pub dest: String,
}

/// Tray vial to custom position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferTrayCustomParams {
    /// Tool, volume and washes
    #[serde(flatten)]
    pub common: ToolParams,
    /// Source vial
    pub source: TrayPosition,
    /// Destination custom position
    pub dest: String,
}

/// Custom position to tray vial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferCustomTrayParams {
    /// Tool, volume and washes
    #[serde(flatten)]
    pub common: ToolParams,
    /// Source custom position
    pub source: String,
    /// Destination vial
    pub dest: TrayPosition,
}

/// Move liquid from a cell into the next empty tray vial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveParams {
    /// Tool, volume and washes
    #[serde(flatten)]
    pub common: ToolParams,
    /// Source custom position
    pub source: String,
    /// Search starts after this vial
    #[serde(default)]
    pub after: Option<TrayPosition>,
}

/// Inject from a tray vial into a destroying injector position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InjectionParams {
    /// Tool, volume and washes
    #[serde(flatten)]
    pub common: ToolParams,
    /// `None` walks the occupied vials in tray order
    #[serde(default)]
    pub source: Option<TrayPosition>,
    /// Custom position of the injector
    pub injector: String,
}

/// A chemistry method with its typed parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum PalMethod {
    /// Tray vial to tray vial
    TransferTrayTray(TransferTrayTrayParams),
    /// Custom position to custom position
    TransferCustomCustom(TransferCustomCustomParams),
    /// Tray vial to custom position
    TransferTrayCustom(TransferTrayCustomParams),
    /// Custom position to tray vial
    TransferCustomTray(TransferCustomTrayParams),
    /// Custom position into the next empty vial
    Archive(ArchiveParams),
    /// Gas from occupied vials into an injector
    HeadspaceInjection(InjectionParams),
    /// Liquid from occupied vials into an injector
    LiquidInjection(InjectionParams),
}

impl PalMethod {
    /// Method of this request entry.
    pub fn kind(&self) -> MethodKind {
        match self {
            PalMethod::TransferTrayTray(_) => MethodKind::TransferTrayTray,
            PalMethod::TransferCustomCustom(_) => MethodKind::TransferCustomCustom,
            PalMethod::TransferTrayCustom(_) => MethodKind::TransferTrayCustom,
            PalMethod::TransferCustomTray(_) => MethodKind::TransferCustomTray,
            PalMethod::Archive(_) => MethodKind::Archive,
            PalMethod::HeadspaceInjection(_) => MethodKind::HeadspaceInjection,
            PalMethod::LiquidInjection(_) => MethodKind::LiquidInjection,
        }
    }

    fn common(&self) -> &ToolParams {
        match self {
            PalMethod::TransferTrayTray(p) => &p.common,
            PalMethod::TransferCustomCustom(p) => &p.common,
            PalMethod::TransferTrayCustom(p) => &p.common,
            PalMethod::TransferCustomTray(p) => &p.common,
            PalMethod::Archive(p) => &p.common,
            PalMethod::HeadspaceInjection(p) | PalMethod::LiquidInjection(p) => &p.common,
        }
    }

    fn positions(&self) -> (RequestedPosition, RequestedPosition) {
        match self {
            PalMethod::TransferTrayTray(p) => (
                RequestedPosition::Tray(p.source),
                p.dest.map_or(
                    RequestedPosition::NextEmptyVial { after: None },
                    RequestedPosition::Tray,
                ),
            ),
            PalMethod::TransferCustomCustom(p) => (
                RequestedPosition::Custom(p.source.clone()),
                RequestedPosition::Custom(p.dest.clone()),
            ),
            PalMethod::TransferTrayCustom(p) => (
                RequestedPosition::Tray(p.source),
                RequestedPosition::Custom(p.dest.clone()),
            ),
            PalMethod::TransferCustomTray(p) => (
                RequestedPosition::Custom(p.source.clone()),
                RequestedPosition::Tray(p.dest),
            ),
            PalMethod::Archive(p) => (
                RequestedPosition::Custom(p.source.clone()),
                RequestedPosition::NextEmptyVial { after: p.after },
            ),
            PalMethod::HeadspaceInjection(p) | PalMethod::LiquidInjection(p) => (
                p.source.map_or(
                    RequestedPosition::NextFullVial { after: None },
                    RequestedPosition::Tray,
                ),
                RequestedPosition::Custom(p.injector.clone()),
            ),
        }
    }

    /// Build the micro-operation, rejecting malformed parameters.
    pub fn into_micro_operation(self) -> AppResult<MicroOperation> {
        let common = self.common().clone();
        if !common.volume_ul.is_finite() || common.volume_ul <= 0.0 {
            return Err(WorkcellError::NotAllowed(format!(
                "{} volume must be positive, got {} uL",
                self.kind(),
                common.volume_ul
            )));
        }
        if common.tool.trim().is_empty() {
            return Err(WorkcellError::NotAvailable(format!("{} has no tool", self.kind())));
        }
        if common.tool.contains(';') {
            return Err(WorkcellError::NotAllowed(format!(
                "{} tool '{}' contains a separator",
                self.kind(),
                common.tool
            )));
        }

        let (requested_source, requested_dest) = self.positions();
        for requested in [&requested_source, &requested_dest] {
            if let Some(position) = requested.fixed() {
                position.validate()?;
            }
        }

        let transfer_type = match self {
            PalMethod::HeadspaceInjection(_) => Some(SampleType::Gas),
            PalMethod::LiquidInjection(_) => Some(SampleType::Liquid),
            _ => None,
        };

        Ok(MicroOperation {
            method: self.kind(),
            tool: common.tool,
            volume_ul: common.volume_ul,
            wash: common.wash,
            requested_source,
            requested_dest,
            transfer_type,
            repeat: common.repeat,
            runs: Vec::new(),
        })
    }
}

/// Repeat and spacing settings of a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanSettings {
    /// Number of runs, at least one
    #[serde(default = "default_totalruns")]
    pub totalruns: u32,
    /// Delays between runs
    #[serde(default)]
    pub spacing: SpacingPolicy,
}

fn default_totalruns() -> u32 {
    1
}

impl Default for PlanSettings {
    fn default() -> Self {
        Self {
            totalruns: default_totalruns(),
            spacing: SpacingPolicy::default(),
        }
    }
}

/// A caller request: one or more methods executed in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PalRequest {
    /// Methods executed in order within each run
    pub operations: Vec<PalMethod>,
    /// Repeat and spacing settings
    #[serde(default)]
    pub settings: PlanSettings,
}

impl PalRequest {
    /// Request for one method.
    pub fn single(method: PalMethod, settings: PlanSettings) -> Self {
        Self {
            operations: vec![method],
            settings,
        }
    }

    /// Validate the request and build its plan.
    pub fn into_plan(self) -> AppResult<JobPlan> {
        if self.operations.is_empty() {
            return Err(WorkcellError::NotAvailable(
                "request contains no operations".to_string(),
            ));
        }
        let micro_ops = self
            .operations
            .into_iter()
            .map(PalMethod::into_micro_operation)
            .collect::<AppResult<Vec<_>>>()?;
        self.settings.spacing.validate(self.settings.totalruns)?;
        Ok(JobPlan::new(
            micro_ops,
            self.settings.totalruns,
            self.settings.spacing,
        ))
    }
}
