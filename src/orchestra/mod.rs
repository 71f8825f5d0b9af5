//! Federated round coordination on top of one actor per worker.

pub mod aggregate;
pub mod federated;
pub mod orchestrator;
pub mod round;
pub mod state;
pub mod worker;

pub use federated::{FedLoss, FedModel, FedOptimizer, LossArgs, LossResult, Workers, DEFAULT_HEAD};
pub use orchestrator::{Orchestrator, RoundReport};
pub use round::{ParticipantSampler, Round, RoundRecord};
pub use worker::{spawn_workers, SketchedWorker};
