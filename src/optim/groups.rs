use serde::{Deserialize, Serialize};

use crate::error::{FedError, Result};

/// A set of parameters sharing a learning rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamGroup {
    /// Indices into the model's parameter list, in traversal order.
    pub params: Vec<usize>,
    pub lr: f32,
    /// Set by learning rate schedulers that remember the starting rate.
    #[serde(default)]
    pub initial_lr: Option<f32>,
}

impl ParamGroup {
    /// Creates a group holding the given parameters.
    pub fn new(params: Vec<usize>, lr: f32) -> Self {
        Self {
            params,
            lr,
            initial_lr: None,
        }
    }

    /// A single group holding all of a model's `nparams` parameters.
    pub fn all(nparams: usize, lr: f32) -> Self {
        Self::new((0..nparams).collect(), lr)
    }

    /// Reports this group's learning rates.
    pub fn lr_report(&self) -> ParamGroupLr {
        match self.initial_lr {
            Some(initial_lr) => ParamGroupLr::Scheduled {
                initial_lr,
                lr: self.lr,
            },
            None => ParamGroupLr::Fixed { lr: self.lr },
        }
    }

    /// Sets one of the group's hyperparameters.
    pub fn set(&mut self, hyper: Hyperparameter, value: f32) -> Result<()> {
        if !value.is_finite() || value < 0.0 {
            return Err(FedError::InvalidConfig(format!(
                "{hyper:?} must be a non negative number, got {value}"
            )));
        }

        match hyper {
            Hyperparameter::Lr => self.lr = value,
            Hyperparameter::InitialLr => self.initial_lr = Some(value),
        }

        Ok(())
    }
}

/// The learning rates of a group, as seen from outside the workers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamGroupLr {
    /// The group carries the rate it started with besides the current one.
    Scheduled { initial_lr: f32, lr: f32 },
    Fixed { lr: f32 },
}

impl ParamGroupLr {
    /// The current learning rate.
    pub fn lr(&self) -> f32 {
        match *self {
            Self::Scheduled { lr, .. } | Self::Fixed { lr } => lr,
        }
    }
}

/// Group hyperparameters that can be changed while training.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Hyperparameter {
    Lr,
    InitialLr,
}
