//! Physical positions known to the autosampler.
//!
//! A [`Position`] is either a tray coordinate or a named custom location. The
//! micro-operations of a plan request positions with [`RequestedPosition`],
//! which additionally allows "next empty vial" and "next full vial" searches.
//! Searches carry an `after` anchor that the compiler moves forward each time a
//! vial is found, so repeats of one operation walk the tray instead of hitting
//! the same vial again.

use crate::error::{AppResult, WorkcellError};
use crate::sample::Sample;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Descriptor used for tray positions in vendor parameter strings.
pub const TRAY_DESCRIPTOR: &str = "tray";

/// Tray/slot/vial triple (1-indexed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TrayPosition {
    /// Tray number
    pub tray: u32,
    /// Slot within the tray
    pub slot: u32,
    /// Vial within the slot
    pub vial: u32,
}

impl TrayPosition {
    /// Tray/slot/vial triple.
    pub fn new(tray: u32, slot: u32, vial: u32) -> Self {
        Self { tray, slot, vial }
    }
}

impl fmt::Display for TrayPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tray {} slot {} vial {}", self.tray, self.slot, self.vial)
    }
}

/// A concrete, addressable position.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Position {
    /// Vial in a tray
    Tray(TrayPosition),
    /// Named location such as a cell or an injector
    Custom(String),
}

impl Position {
    /// Tray position from its coordinates.
    pub fn tray(tray: u32, slot: u32, vial: u32) -> Self {
        Position::Tray(TrayPosition::new(tray, slot, vial))
    }

    /// Custom position by name.
    pub fn custom(name: impl Into<String>) -> Self {
        Position::Custom(name.into())
    }

    /// Reject coordinates the hardware cannot address.
    pub fn validate(&self) -> AppResult<()> {
        match self {
            Position::Tray(t) if t.tray == 0 || t.slot == 0 || t.vial == 0 => Err(
                WorkcellError::InvalidPosition(format!("{} is not 1-indexed", t)),
            ),
            Position::Custom(name) if name.trim().is_empty() => Err(
                WorkcellError::InvalidPosition("custom position name is empty".to_string()),
            ),
            Position::Custom(name) if name.contains(';') => Err(WorkcellError::InvalidPosition(
                format!("custom position '{}' contains a separator", name),
            )),
            // would decode as a tray coordinate
            Position::Custom(name) if name.eq_ignore_ascii_case(TRAY_DESCRIPTOR) => Err(
                WorkcellError::InvalidPosition(format!(
                    "custom position cannot be named '{}'",
                    name
                )),
            ),
            _ => Ok(()),
        }
    }

    /// Descriptor field of the vendor encoding.
    pub fn descriptor(&self) -> &str {
        match self {
            Position::Tray(_) => TRAY_DESCRIPTOR,
            Position::Custom(name) => name,
        }
    }

    /// Tray/slot/vial fields of the vendor encoding; custom positions leave
    /// them empty.
    pub fn coordinate_fields(&self) -> [String; 3] {
        match self {
            Position::Tray(t) => [t.tray.to_string(), t.slot.to_string(), t.vial.to_string()],
            Position::Custom(_) => [String::new(), String::new(), String::new()],
        }
    }

    /// Inverse of [`Position::descriptor`] + [`Position::coordinate_fields`].
    pub fn from_vendor_fields(descriptor: &str, fields: [&str; 3]) -> AppResult<Self> {
        if descriptor != TRAY_DESCRIPTOR {
            return Ok(Position::Custom(descriptor.to_string()));
        }
        let parse = |s: &str| {
            s.trim().parse::<u32>().map_err(|_| {
                WorkcellError::InvalidPosition(format!("'{}' is not a tray coordinate", s))
            })
        };
        Ok(Position::tray(parse(fields[0])?, parse(fields[1])?, parse(fields[2])?))
    }

    /// Tray coordinates, if this is a tray position.
    pub fn as_tray(&self) -> Option<TrayPosition> {
        match self {
            Position::Tray(t) => Some(*t),
            Position::Custom(_) => None,
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Position::Tray(t) => t.fmt(f),
            Position::Custom(name) => write!(f, "custom '{}'", name),
        }
    }
}

/// Position as requested by a micro-operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestedPosition {
    /// Vial in a tray
    Tray(TrayPosition),
    /// Named location such as a cell or an injector
    Custom(String),
    /// First free vial after the anchor (or from the start of the trays).
    NextEmptyVial {
        /// Search anchor, exclusive
        #[serde(default)]
        after: Option<TrayPosition>,
    },
    /// First occupied vial after the anchor.
    NextFullVial {
        /// Search anchor, exclusive
        #[serde(default)]
        after: Option<TrayPosition>,
    },
}

impl RequestedPosition {
    /// Fixed position, if the request is not a search.
    pub fn fixed(&self) -> Option<Position> {
        match self {
            RequestedPosition::Tray(t) => Some(Position::Tray(*t)),
            RequestedPosition::Custom(name) => Some(Position::Custom(name.clone())),
            _ => None,
        }
    }

    /// Move a search anchor to the vial that was just resolved.
    pub fn advance_anchor(&mut self, found: TrayPosition) {
        match self {
            RequestedPosition::NextEmptyVial { after } | RequestedPosition::NextFullVial { after } => {
                *after = Some(found);
            }
            _ => {}
        }
    }
}

impl fmt::Display for RequestedPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestedPosition::Tray(t) => t.fmt(f),
            RequestedPosition::Custom(name) => write!(f, "custom '{}'", name),
            RequestedPosition::NextEmptyVial { .. } => f.write_str("next empty vial"),
            RequestedPosition::NextFullVial { .. } => f.write_str("next full vial"),
        }
    }
}

/// Capabilities of a named custom position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomPositionCaps {
    /// Position name as used by the vendor method files
    pub name: String,
    /// Whether liquid may be dispensed here
    #[serde(default = "default_true")]
    pub dest_allowed: bool,
    /// Whether an assembly may be created here
    #[serde(default)]
    pub assembly_allowed: bool,
    /// Waste, injectors and the like: anything placed here is destroyed
    #[serde(default)]
    pub destroys: bool,
}

fn default_true() -> bool {
    true
}

/// A position resolved for one run, with its samples before and after.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedPosition {
    /// The resolved position
    pub position: Position,
    /// Contents before the action
    pub samples_initial: Vec<Sample>,
    /// Contents after the action
    pub samples_final: Vec<Sample>,
}

impl ResolvedPosition {
    /// Resolved position with its current contents.
    pub fn new(position: Position, samples_initial: Vec<Sample>) -> Self {
        Self {
            position,
            samples_initial,
            samples_final: Vec::new(),
        }
    }
}
