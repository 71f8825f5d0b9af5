use ndarray::{ErrorKind, ShapeError};

use super::{Criterion, Tensor};
use crate::error::Result;

fn check_shapes(outputs: &Tensor, targets: &Tensor) -> Result<()> {
    if outputs.shape() != targets.shape() {
        return Err(ShapeError::from_kind(ErrorKind::IncompatibleShape).into());
    }

    Ok(())
}

/// Mean squared error loss function.
#[derive(Debug, Default, Clone, Copy)]
pub struct Mse;

impl Mse {
    /// Returns a new `Mse`.
    pub fn new() -> Self {
        Self
    }
}

impl Criterion for Mse {
    fn loss(&self, outputs: &Tensor, targets: &Tensor) -> Result<f32> {
        check_shapes(outputs, targets)?;

        let loss = (outputs - targets)
            .mapv(|x| x.powi(2))
            .mean()
            .unwrap_or_default();

        Ok(loss)
    }

    fn loss_grad(&self, outputs: &Tensor, targets: &Tensor) -> Result<Tensor> {
        check_shapes(outputs, targets)?;
        Ok((outputs - targets) * (2.0 / outputs.len().max(1) as f32))
    }
}
