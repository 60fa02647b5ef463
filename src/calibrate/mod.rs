//! Prediction and calibration feedback loop.
//!
//! Prediction → outcome → surprise → ECE → Platt rescaling, plus the
//! meta-cognition alerts derived from learning dynamics.

pub mod bins;
pub mod prediction;

pub use bins::{
    trend_slope, CalibrationBin, CalibrationConfig, CalibrationDomain, Calibrator,
    CycleReport, DomainCalibration, MetaAlert, PlattParams,
};
pub use prediction::{
    MatchedPrediction, Outcome, OutcomeClass, Prediction, PredictionLedger, Surprise,
};
