#![deny(dead_code)]
#![deny(unused_imports)]

pub mod curve;
pub mod folds;
pub mod harness;
pub mod metrics;
pub mod progress;
pub mod summary;

#[path = "../cohort/mod.rs"]
pub mod cohort;

#[path = "../models/mod.rs"]
pub mod models;

#[path = "../report/mod.rs"]
pub mod report;

#[path = "../shared/config.rs"]
pub mod config;

pub use harness::{
    CrossValidationResult, EvaluationData, EvaluationError, EvaluationSettings, evaluate,
};
