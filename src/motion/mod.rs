//! Stage motion in plate coordinates.
//!
//! [`transform`] holds the motor/instrument/plate matrices, [`driver`] moves
//! controller axes to plate positions.

pub mod driver;
pub mod transform;

pub use driver::{AxisController, AxisMoveResult, MotionDriver, MoveReport, SimulatedAxes};
pub use transform::{CoordInput, RotationAxis, RotationStep, TransformEngine};
