//! Motor/instrument/plate coordinate transforms.
//!
//! Three 4x4 homogeneous matrices are kept:
//!
//! - `instrument`: motor -> instrument axes, the instrument calibration
//!   applied after the rotation sequence (`calibration * rotations`)
//! - `plate`: instrument -> plate, from the live 2D affine plate calibration
//! - `system = plate * instrument` (motor -> plate) and its inverse
//!
//! Everything is recomputed when either calibration or the rotation sequence
//! changes. A singular system matrix is replaced by [`sentinel`] (identity
//! with the last element -1); [`TransformEngine::plate_to_motor`] refuses to
//! use it.

use crate::error::{AppResult, WorkcellError};
use ndarray::{arr1, Array1, Array2};
use serde::{Deserialize, Serialize};
use tracing::warn;

const SINGULAR_EPS: f64 = 1e-12;

/// Axis a rotation step turns about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RotationAxis {
    /// Turns y towards z
    X,
    /// Turns z towards x
    Y,
    /// Turns x towards y
    Z,
}

/// One rotation of the instrument calibration sequence.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RotationStep {
    /// Axis turned about
    pub axis: RotationAxis,
    /// Counter-clockwise, in degrees
    pub angle_deg: f64,
}

/// (cos, sin), exact for the four cardinal angles.
fn cos_sin(angle_deg: f64) -> (f64, f64) {
    let normalized = angle_deg.rem_euclid(360.0);
    for (cardinal, exact) in [
        (0.0, (1.0, 0.0)),
        (90.0, (0.0, 1.0)),
        (180.0, (-1.0, 0.0)),
        (270.0, (0.0, -1.0)),
        (360.0, (1.0, 0.0)),
    ] {
        if (normalized - cardinal).abs() < 1e-9 {
            return exact;
        }
    }
    let rad = normalized.to_radians();
    (rad.cos(), rad.sin())
}

/// 4x4 rotation for one step.
pub fn rotation_matrix(step: RotationStep) -> Array2<f64> {
    let (c, s) = cos_sin(step.angle_deg);
    let mut m = Array2::eye(4);
    let (i, j) = match step.axis {
        RotationAxis::X => (1, 2),
        RotationAxis::Y => (2, 0),
        RotationAxis::Z => (0, 1),
    };
    m[[i, i]] = c;
    m[[i, j]] = -s;
    m[[j, i]] = s;
    m[[j, j]] = c;
    m
}

/// Embed a row-major 2D affine matrix into a 4x4 transform that leaves z alone.
pub fn affine2d_to_homogeneous(affine: &[[f64; 3]; 3]) -> Array2<f64> {
    let mut m = Array2::eye(4);
    for (row, source) in [(0, 0), (1, 1)] {
        m[[row, 0]] = affine[source][0];
        m[[row, 1]] = affine[source][1];
        m[[row, 3]] = affine[source][2];
    }
    m
}

/// Row-major 4x4 matrix as an array.
pub fn homogeneous_from_rows(rows: &[[f64; 4]; 4]) -> Array2<f64> {
    Array2::from_shape_fn((4, 4), |(r, c)| rows[r][c])
}

/// Marker for an unusable inverse.
pub fn sentinel() -> Array2<f64> {
    let mut m = Array2::eye(4);
    m[[3, 3]] = -1.0;
    m
}

/// Whether `m` is the [`sentinel`].
pub fn is_sentinel(m: &Array2<f64>) -> bool {
    *m == sentinel()
}

/// Gauss-Jordan inversion with partial pivoting; `None` if singular.
pub fn invert(m: &Array2<f64>) -> Option<Array2<f64>> {
    let n = m.nrows();
    if n != m.ncols() {
        return None;
    }
    let mut a = m.clone();
    let mut inv = Array2::eye(n);
    for col in 0..n {
        let pivot = (col..n).max_by(|&x, &y| {
            a[[x, col]]
                .abs()
                .partial_cmp(&a[[y, col]].abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        })?;
        if !a[[pivot, col]].is_finite() || a[[pivot, col]].abs() < SINGULAR_EPS {
            return None;
        }
        if pivot != col {
            for k in 0..n {
                a.swap([pivot, k], [col, k]);
                inv.swap([pivot, k], [col, k]);
            }
        }
        let p = a[[col, col]];
        for k in 0..n {
            a[[col, k]] /= p;
            inv[[col, k]] /= p;
        }
        for row in 0..n {
            if row == col {
                continue;
            }
            let factor = a[[row, col]];
            if factor == 0.0 {
                continue;
            }
            for k in 0..n {
                let (da, dinv) = (factor * a[[col, k]], factor * inv[[col, k]]);
                a[[row, k]] -= da;
                inv[[row, k]] -= dinv;
            }
        }
    }
    Some(inv)
}

/// Coordinates as accepted by the transform functions.
#[derive(Debug, Clone, PartialEq)]
pub enum CoordInput {
    /// Literal numbers
    Values(Vec<f64>),
    /// Comma-separated numbers, e.g. `"12.5, 40"`
    Text(String),
}

impl From<Vec<f64>> for CoordInput {
    fn from(v: Vec<f64>) -> Self {
        CoordInput::Values(v)
    }
}

impl From<&[f64]> for CoordInput {
    fn from(v: &[f64]) -> Self {
        CoordInput::Values(v.to_vec())
    }
}

impl From<&str> for CoordInput {
    fn from(s: &str) -> Self {
        CoordInput::Text(s.to_string())
    }
}

impl CoordInput {
    /// Homogeneous 4-vector; 2D and 3D inputs are padded.
    pub fn to_homogeneous(&self) -> AppResult<Array1<f64>> {
        let values = match self {
            CoordInput::Values(v) => v.clone(),
            CoordInput::Text(s) => s
                .split(',')
                .map(|part| {
                    part.trim().parse::<f64>().map_err(|_| WorkcellError::Numerical {
                        axis: "input".to_string(),
                        reason: format!("'{}' is not a number", part.trim()),
                    })
                })
                .collect::<AppResult<Vec<f64>>>()?,
        };
        if let Some(bad) = values.iter().find(|v| !v.is_finite()) {
            return Err(WorkcellError::Numerical {
                axis: "input".to_string(),
                reason: format!("coordinate {} is not finite", bad),
            });
        }
        match values.as_slice() {
            [x, y] => Ok(arr1(&[*x, *y, 0.0, 1.0])),
            [x, y, z] => Ok(arr1(&[*x, *y, *z, 1.0])),
            [x, y, z, w] => Ok(arr1(&[*x, *y, *z, *w])),
            other => Err(WorkcellError::Numerical {
                axis: "input".to_string(),
                reason: format!("expected 2 to 4 coordinates, got {}", other.len()),
            }),
        }
    }
}

/// Calibration stack converting between motor and plate coordinates.
#[derive(Debug, Clone)]
pub struct TransformEngine {
    rotations: Vec<RotationStep>,
    calibration: Array2<f64>,
    instrument: Array2<f64>,
    plate: Array2<f64>,
    system: Array2<f64>,
    system_inv: Array2<f64>,
}

impl TransformEngine {
    /// Engine with an identity instrument calibration.
    pub fn new(rotations: Vec<RotationStep>, plate_affine: Option<[[f64; 3]; 3]>) -> Self {
        let mut engine = Self {
            rotations,
            calibration: Array2::eye(4),
            instrument: Array2::eye(4),
            plate: plate_affine
                .as_ref()
                .map_or_else(|| Array2::eye(4), affine2d_to_homogeneous),
            system: Array2::eye(4),
            system_inv: Array2::eye(4),
        };
        engine.recompute();
        engine
    }

    /// Replace the instrument calibration at construction.
    pub fn with_instrument_calibration(mut self, rows: Option<[[f64; 4]; 4]>) -> Self {
        if let Some(rows) = rows {
            self.update_instrument_calibration(rows);
        }
        self
    }

    fn recompute(&mut self) {
        let rotated = self
            .rotations
            .iter()
            .fold(Array2::eye(4), |acc, step| rotation_matrix(*step).dot(&acc));
        self.instrument = self.calibration.dot(&rotated);
        self.system = self.plate.dot(&self.instrument);
        self.system_inv = invert(&self.system).unwrap_or_else(|| {
            warn!("motor->plate calibration is singular, plate moves disabled");
            sentinel()
        });
    }

    /// Load a new motor -> instrument calibration (row-major 4x4).
    pub fn update_instrument_calibration(&mut self, rows: [[f64; 4]; 4]) {
        self.calibration = homogeneous_from_rows(&rows);
        self.recompute();
    }

    /// Load a new 2D plate calibration.
    pub fn update_plate_affine(&mut self, affine: [[f64; 3]; 3]) {
        self.plate = affine2d_to_homogeneous(&affine);
        self.recompute();
    }

    /// Replace the rotation sequence.
    pub fn set_rotations(&mut self, rotations: Vec<RotationStep>) {
        self.rotations = rotations;
        self.recompute();
    }

    /// Motor -> instrument matrix.
    pub fn instrument(&self) -> &Array2<f64> {
        &self.instrument
    }

    /// Motor -> plate matrix.
    pub fn system(&self) -> &Array2<f64> {
        &self.system
    }

    /// Plate -> motor matrix, or the [`sentinel`].
    pub fn system_inverse(&self) -> &Array2<f64> {
        &self.system_inv
    }

    /// Whether plate coordinates can be converted back to motor coordinates.
    pub fn is_valid(&self) -> bool {
        !is_sentinel(&self.system_inv)
    }

    /// Motor position to plate (x, y, z).
    pub fn motor_to_plate(&self, motor: impl Into<CoordInput>) -> AppResult<[f64; 3]> {
        let v = self.system.dot(&motor.into().to_homogeneous()?);
        Ok([v[0], v[1], v[2]])
    }

    /// Plate position to motor (x, y, z).
    pub fn plate_to_motor(&self, plate: impl Into<CoordInput>) -> AppResult<[f64; 3]> {
        if !self.is_valid() {
            return Err(WorkcellError::Setup(
                "plate calibration is singular".to_string(),
            ));
        }
        let v = self.system_inv.dot(&plate.into().to_homogeneous()?);
        Ok([v[0], v[1], v[2]])
    }
}

impl Default for TransformEngine {
    fn default() -> Self {
        Self::new(Vec::new(), None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: &[f64], b: &[f64]) -> bool {
        a.iter().zip(b).all(|(x, y)| (x - y).abs() < 1e-9)
    }

    #[test]
    fn test_cardinal_rotations_are_exact() {
        let m = rotation_matrix(RotationStep {
            axis: RotationAxis::Z,
            angle_deg: 90.0,
        });
        assert_eq!(m[[0, 0]], 0.0);
        assert_eq!(m[[0, 1]], -1.0);
        assert_eq!(m[[1, 0]], 1.0);
        let m = rotation_matrix(RotationStep {
            axis: RotationAxis::X,
            angle_deg: -180.0,
        });
        assert_eq!(m[[1, 1]], -1.0);
        assert_eq!(m[[2, 1]], 0.0);
    }

    #[test]
    fn test_invert_roundtrip() {
        let engine = TransformEngine::new(
            vec![RotationStep {
                axis: RotationAxis::Z,
                angle_deg: 30.0,
            }],
            Some([[2.0, 0.1, 5.0], [0.0, 1.5, -3.0], [0.0, 0.0, 1.0]]),
        );
        assert!(engine.is_valid());
        let product = engine.system().dot(engine.system_inverse());
        let identity: Array2<f64> = Array2::eye(4);
        assert!(close(product.as_slice().unwrap(), identity.as_slice().unwrap()));

        let plate = engine.motor_to_plate(vec![1.0, 2.0, 3.0]).unwrap();
        let motor = engine.plate_to_motor(plate.as_slice()).unwrap();
        assert!(close(&motor, &[1.0, 2.0, 3.0]));
    }

    #[test]
    fn test_instrument_calibration_composes_with_rotations() {
        // scale x by 2, y by 0.5, shift z by 4
        let calibration = [
            [2.0, 0.0, 0.0, 0.0],
            [0.0, 0.5, 0.0, 0.0],
            [0.0, 0.0, 1.0, 4.0],
            [0.0, 0.0, 0.0, 1.0],
        ];
        let mut engine = TransformEngine::new(
            vec![RotationStep {
                axis: RotationAxis::Z,
                angle_deg: 90.0,
            }],
            Some([[1.0, 0.0, 10.0], [0.0, 1.0, 20.0], [0.0, 0.0, 1.0]]),
        )
        .with_instrument_calibration(Some(calibration));

        // rotation first: (1, 2) -> (-2, 1), then calibration, then plate offset
        let plate = engine.motor_to_plate(vec![1.0, 2.0, 3.0]).unwrap();
        assert!(close(&plate, &[6.0, 20.5, 7.0]));
        let motor = engine.plate_to_motor(plate.as_slice()).unwrap();
        assert!(close(&motor, &[1.0, 2.0, 3.0]));

        // the plate stays valid across recalibrations
        engine.update_plate_affine([[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]]);
        let plate = engine.motor_to_plate(vec![1.0, 2.0, 3.0]).unwrap();
        assert!(close(&plate, &[-4.0, 0.5, 7.0]));

        let mut flat = calibration;
        flat[1][1] = 0.0;
        engine.update_instrument_calibration(flat);
        assert!(!engine.is_valid());
        engine.update_instrument_calibration(calibration);
        assert!(engine.is_valid());
        assert!(close(engine.instrument().row(2).as_slice().unwrap(), &[0.0, 0.0, 1.0, 4.0]));
    }

    #[test]
    fn test_singular_calibration_gives_sentinel() {
        let mut engine = TransformEngine::default();
        engine.update_plate_affine([[0.0, 0.0, 1.0], [0.0, 0.0, 2.0], [0.0, 0.0, 1.0]]);
        assert!(!engine.is_valid());
        assert!(is_sentinel(engine.system_inverse()));
        let err = engine.plate_to_motor("1, 2").unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::Setup);
    }

    #[test]
    fn test_inputs_are_padded() {
        assert_eq!(
            CoordInput::from("1.5, -2").to_homogeneous().unwrap().to_vec(),
            vec![1.5, -2.0, 0.0, 1.0]
        );
        assert_eq!(
            CoordInput::from(vec![1.0, 2.0, 3.0]).to_homogeneous().unwrap().to_vec(),
            vec![1.0, 2.0, 3.0, 1.0]
        );
        let err = CoordInput::from("1, x").to_homogeneous().unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::Numerical);
        assert!(CoordInput::from(vec![1.0]).to_homogeneous().is_err());
    }
}
