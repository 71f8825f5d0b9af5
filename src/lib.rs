//! Federated sketched SGD.
//!
//! Every worker folds its gradient into local momentum and error feedback
//! buffers, and the round's contributions are aggregated through a shared
//! Count-Sketch into a sparse top-k update with exact values.

pub mod config;
pub mod error;
pub mod model;
pub mod optim;
pub mod orchestra;
pub mod sketch;

pub use config::FedConfig;
pub use error::{FedError, Result};
