use crate::{
    config::FedConfig,
    error::{FedError, Result},
};

/// Momentum rule hyperparameters of a worker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SgdSettings {
    pub momentum: f32,
    /// Carried for completeness, the momentum rule doesn't dampen.
    pub dampening: f32,
    pub weight_decay: f32,
    pub nesterov: bool,
    pub num_workers: usize,
}

impl From<&FedConfig> for SgdSettings {
    fn from(config: &FedConfig) -> Self {
        Self {
            momentum: config.momentum,
            dampening: config.dampening,
            weight_decay: config.weight_decay,
            nesterov: config.nesterov,
            num_workers: config.num_workers,
        }
    }
}

/// Momentum (`u`) and error feedback (`v`) buffers of a worker.
///
/// `v` holds every part of past updates that was never applied to the
/// parameters. Coordinates are only discharged once they make it into an
/// aggregated update, so nothing is lost to compression, only delayed.
#[derive(Debug, Clone, PartialEq)]
pub struct MomentumState {
    u: Vec<f32>,
    v: Vec<f32>,
}

impl MomentumState {
    /// Creates zeroed buffers for `grad_size` coordinates.
    pub fn new(grad_size: usize) -> Self {
        Self {
            u: vec![0.0; grad_size],
            v: vec![0.0; grad_size],
        }
    }

    /// The momentum buffer.
    pub fn u(&self) -> &[f32] {
        &self.u
    }

    /// The error feedback buffer.
    pub fn v(&self) -> &[f32] {
        &self.v
    }

    /// Folds a fresh gradient into the buffers.
    ///
    /// # Arguments
    /// * `grad` - The flattened gradient, modified in place by weight decay.
    /// * `params` - The flattened parameters, used for weight decay.
    /// * `settings` - The momentum rule.
    ///
    /// # Returns
    /// The error feedback buffer, which is this worker's contribution to aggregation.
    pub fn step(&mut self, grad: &mut [f32], params: &[f32], settings: &SgdSettings) -> Result<&[f32]> {
        self.check_len(grad.len())?;
        self.check_len(params.len())?;

        if settings.weight_decay != 0.0 {
            let decay = settings.weight_decay / settings.num_workers as f32;
            grad.iter_mut().zip(params).for_each(|(g, p)| *g += decay * p);
        }

        let mu = settings.momentum;
        let buffers = self.u.iter_mut().zip(self.v.iter_mut()).zip(grad.iter());

        if settings.nesterov {
            buffers.for_each(|((u, v), &g)| {
                *u = mu * (*u + g);
                *v += *u + g;
            });
        } else {
            buffers.for_each(|((u, v), &g)| {
                *u = mu * *u + g;
                *v += *u;
            });
        }

        Ok(&self.v)
    }

    /// Discharges the coordinates that were just applied.
    ///
    /// Both buffers are zeroed wherever `update` is nonzero, and `v` is zeroed
    /// at every dense coordinate since those are applied in full every round.
    ///
    /// # Arguments
    /// * `update` - The aggregated update, before learning rate scaling.
    /// * `sketch_mask` - `true` at sketched coordinates.
    pub fn discharge(&mut self, update: &[f32], sketch_mask: &[bool]) -> Result<()> {
        self.check_len(update.len())?;
        self.check_len(sketch_mask.len())?;

        for (i, (&x, &sketched)) in update.iter().zip(sketch_mask).enumerate() {
            if x != 0.0 {
                self.u[i] = 0.0;
                self.v[i] = 0.0;
            }

            if !sketched {
                self.v[i] = 0.0;
            }
        }

        Ok(())
    }

    fn check_len(&self, got: usize) -> Result<()> {
        if got != self.v.len() {
            return Err(FedError::LengthMismatch {
                expected: self.v.len(),
                got,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(momentum: f32, nesterov: bool) -> SgdSettings {
        SgdSettings {
            momentum,
            dampening: 0.0,
            weight_decay: 0.0,
            nesterov,
            num_workers: 1,
        }
    }

    #[test]
    fn classic_momentum_accumulates_into_v() {
        let mut state = MomentumState::new(2);
        let s = settings(0.5, false);

        state.step(&mut [1.0, 2.0], &[0.0, 0.0], &s).unwrap();
        assert_eq!(state.u(), [1.0, 2.0]);
        assert_eq!(state.v(), [1.0, 2.0]);

        let v = state.step(&mut [1.0, 0.0], &[0.0, 0.0], &s).unwrap();
        assert_eq!(v, [2.5, 3.0]);
        assert_eq!(state.u(), [1.5, 1.0]);
    }

    #[test]
    fn nesterov_looks_ahead() {
        let mut state = MomentumState::new(1);
        let s = settings(0.5, true);

        state.step(&mut [2.0], &[0.0], &s).unwrap();
        assert_eq!(state.u(), [1.0]);
        assert_eq!(state.v(), [3.0]);

        state.step(&mut [2.0], &[0.0], &s).unwrap();
        assert_eq!(state.u(), [1.5]);
        assert_eq!(state.v(), [6.5]);
    }

    #[test]
    fn weight_decay_is_split_across_workers() {
        let mut state = MomentumState::new(2);
        let s = SgdSettings {
            weight_decay: 0.5,
            num_workers: 4,
            ..settings(0.0, false)
        };

        let mut grad = [1.0, 1.0];
        state.step(&mut grad, &[8.0, -8.0], &s).unwrap();
        assert_eq!(grad, [2.0, 0.0]);
        assert_eq!(state.v(), [2.0, 0.0]);
    }

    #[test]
    fn discharge_only_resets_updated_and_dense_coordinates() {
        let mut state = MomentumState::new(4);
        state.step(&mut [1.0, 2.0, 3.0, 4.0], &[0.0; 4], &settings(0.9, false)).unwrap();

        state
            .discharge(&[0.0, 5.0, 0.0, 0.0], &[true, true, true, false])
            .unwrap();

        assert_eq!(state.v(), [1.0, 0.0, 3.0, 0.0]);
        assert_eq!(state.u(), [1.0, 0.0, 3.0, 4.0]);
    }

    #[test]
    fn mismatched_lengths_are_rejected() {
        let mut state = MomentumState::new(3);
        let s = settings(0.9, false);
        assert!(state.step(&mut [1.0, 2.0], &[0.0, 0.0, 0.0], &s).is_err());
        assert!(state.discharge(&[0.0; 3], &[true; 2]).is_err());
    }
}
