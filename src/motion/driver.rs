//! Plate-coordinate moves on top of a raw axis controller.

use crate::config::MotionConfig;
use crate::error::{AppResult, ErrorCode, WorkcellError};
use crate::estop::EstopFlag;
use crate::motion::transform::{CoordInput, TransformEngine};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Logical axes driven by plate moves, in coordinate order.
pub const PLATE_AXES: [&str; 3] = ["x", "y", "z"];

/// Raw axis I/O of a motion controller.
#[async_trait]
pub trait AxisController: Send + Sync {
    /// Start a move of `axis` to `position` without waiting for it.
    async fn move_absolute(&self, axis: usize, position: f64) -> AppResult<()>;
    /// Current position of `axis`.
    async fn position(&self, axis: usize) -> AppResult<f64>;
    /// Whether `axis` is still moving.
    async fn is_moving(&self, axis: usize) -> AppResult<bool>;
    /// Halt every axis.
    async fn stop_all(&self) -> AppResult<()>;
}

/// Per-axis result of a move.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AxisMoveResult {
    /// Logical axis name
    pub axis: String,
    /// `None` when the axis accepted the move
    pub error: ErrorCode,
    /// Error text, if any
    pub message: Option<String>,
}

/// Result of a plate move.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MoveReport {
    /// First failure, or `None`
    pub error: ErrorCode,
    /// Error text, if any
    pub message: Option<String>,
    /// Empty when the move was refused before any axis moved
    pub axes: Vec<AxisMoveResult>,
}

impl MoveReport {
    fn failed(e: &WorkcellError) -> Self {
        Self {
            error: e.code(),
            message: Some(e.to_string()),
            axes: Vec::new(),
        }
    }
}

/// Moves a stage in plate coordinates through an [`AxisController`].
pub struct MotionDriver {
    controller: Arc<dyn AxisController>,
    engine: RwLock<TransformEngine>,
    axes: BTreeMap<String, usize>,
    estop: EstopFlag,
    poll_interval: Duration,
}

impl MotionDriver {
    /// Driver with the calibrations of `config`.
    pub fn new(controller: Arc<dyn AxisController>, config: &MotionConfig, estop: EstopFlag) -> Self {
        Self {
            controller,
            engine: RwLock::new(
                TransformEngine::new(config.rotations.clone(), config.plate_affine)
                    .with_instrument_calibration(config.instrument_calibration),
            ),
            axes: config.axes.clone(),
            estop,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
        }
    }

    /// Load a new 2D plate calibration.
    pub fn update_plate_calibration(&self, affine: [[f64; 3]; 3]) {
        self.engine.write().update_plate_affine(affine);
    }

    /// Load a new motor -> instrument calibration.
    pub fn update_instrument_calibration(&self, rows: [[f64; 4]; 4]) {
        self.engine.write().update_instrument_calibration(rows);
    }

    fn axis_index(&self, name: &str) -> AppResult<usize> {
        self.axes
            .get(name)
            .copied()
            .ok_or_else(|| WorkcellError::Setup(format!("axis '{}' is not mapped", name)))
    }

    /// Move to a plate position. Axis errors are collected per axis; the
    /// remaining axes still move.
    pub async fn move_plate(&self, target: impl Into<CoordInput>) -> MoveReport {
        if self.estop.is_set() {
            return MoveReport::failed(&WorkcellError::Estop);
        }
        let motor = match self.engine.read().plate_to_motor(target) {
            Ok(motor) => motor,
            Err(e) => {
                error!("plate move rejected: {}", e);
                return MoveReport::failed(&e);
            }
        };

        let mut results = Vec::with_capacity(PLATE_AXES.len());
        let mut moving = Vec::new();
        for (name, value) in PLATE_AXES.iter().zip(motor) {
            let outcome = match self.axis_index(name) {
                Err(e) => Err(e),
                Ok(_) if !value.is_finite() => Err(WorkcellError::Numerical {
                    axis: name.to_string(),
                    reason: format!("target {} is not finite", value),
                }),
                Ok(index) => self
                    .controller
                    .move_absolute(index, value)
                    .await
                    .map(|()| index),
            };
            match outcome {
                Ok(index) => {
                    moving.push(index);
                    results.push(AxisMoveResult {
                        axis: name.to_string(),
                        error: ErrorCode::None,
                        message: None,
                    });
                }
                Err(e) => {
                    warn!("axis {}: {}", name, e);
                    results.push(AxisMoveResult {
                        axis: name.to_string(),
                        error: e.code(),
                        message: Some(e.to_string()),
                    });
                }
            }
        }

        let wait = self.wait_for_axes(&moving).await;
        let error = match &wait {
            Err(e) => e.code(),
            Ok(()) => results
                .iter()
                .map(|r| r.error)
                .find(|code| *code != ErrorCode::None)
                .unwrap_or(ErrorCode::None),
        };
        let message = match wait {
            Err(e) => Some(e.to_string()),
            Ok(()) => results.iter().find_map(|r| r.message.clone()),
        };
        MoveReport {
            error,
            message,
            axes: results,
        }
    }

    async fn wait_for_axes(&self, axes: &[usize]) -> AppResult<()> {
        loop {
            if self.estop.is_set() {
                if let Err(e) = self.controller.stop_all().await {
                    error!("failed to stop axes after emergency stop: {}", e);
                }
                return Err(WorkcellError::Estop);
            }
            let mut any_moving = false;
            for axis in axes {
                any_moving |= self.controller.is_moving(*axis).await?;
            }
            if !any_moving {
                return Ok(());
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = self.estop.wait() => {}
            }
        }
    }

    /// Current position in plate coordinates.
    pub async fn current_plate_position(&self) -> AppResult<[f64; 3]> {
        let mut motor = Vec::with_capacity(PLATE_AXES.len());
        for name in PLATE_AXES {
            motor.push(self.controller.position(self.axis_index(name)?).await?);
        }
        self.engine.read().motor_to_plate(motor)
    }
}

/// In-memory controller; each move takes `polls_per_move` polls to settle.
pub struct SimulatedAxes {
    axis_count: usize,
    polls_per_move: u32,
    state: Mutex<Vec<(f64, u32)>>,
}

impl SimulatedAxes {
    /// Controller with `axis_count` axes at zero.
    pub fn new(axis_count: usize, polls_per_move: u32) -> Self {
        Self {
            axis_count,
            polls_per_move,
            state: Mutex::new(vec![(0.0, 0); axis_count]),
        }
    }

    fn check(&self, axis: usize) -> AppResult<()> {
        if axis < self.axis_count {
            Ok(())
        } else {
            Err(WorkcellError::Setup(format!(
                "controller has no axis {}",
                axis
            )))
        }
    }
}

#[async_trait]
impl AxisController for SimulatedAxes {
    async fn move_absolute(&self, axis: usize, position: f64) -> AppResult<()> {
        self.check(axis)?;
        self.state.lock()[axis] = (position, self.polls_per_move);
        info!("simulated axis {} -> {:.4}", axis, position);
        Ok(())
    }

    async fn position(&self, axis: usize) -> AppResult<f64> {
        self.check(axis)?;
        Ok(self.state.lock()[axis].0)
    }

    async fn is_moving(&self, axis: usize) -> AppResult<bool> {
        self.check(axis)?;
        let mut state = self.state.lock();
        let remaining = &mut state[axis].1;
        if *remaining == 0 {
            return Ok(false);
        }
        *remaining -= 1;
        Ok(true)
    }

    async fn stop_all(&self) -> AppResult<()> {
        for entry in self.state.lock().iter_mut() {
            entry.1 = 0;
        }
        Ok(())
    }
}
