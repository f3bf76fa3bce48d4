//! Core library for the workcell service.
//!
//! Dispatches chemistry methods to a PAL autosampler, keeps the sample
//! archive consistent with what the robot did, and drives the sample stage
//! in plate coordinates.

pub mod archive;
pub mod config;
pub mod error;
pub mod estop;
pub mod logging;
pub mod motion;
pub mod pal;
pub mod position;
pub mod sample;
