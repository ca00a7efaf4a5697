#![deny(dead_code)]
#![deny(unused_imports)]

//! Tall-and-Skinny QR: computes the R factor of a matrix with many more rows than
//! columns by streaming each partition through a bounded block compressor and
//! reducing the partial Rs over one or more shuffle stages.

pub mod codec;
pub mod compressor;
pub mod config;
pub mod driver;
pub mod faer_ndarray;
#[path = "../shared/files.rs"]
pub mod files;
pub mod kernel;
pub mod local;
pub mod progress;
pub mod schedule;
pub mod stage;
pub mod types;
pub mod verify;
