use std::collections::HashSet;

use super::ParamGroup;
use crate::{
    error::{FedError, Result},
    model::{ParamKind, Parameter},
};

/// Decides which parameters are compressed through the sketch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SketchRules {
    /// Whether bias parameters are sketched, regardless of their size.
    pub sketch_biases: bool,
    /// Parameters with fewer elements than this are always dense.
    pub sketch_params_larger_than: usize,
}

impl SketchRules {
    /// Whether `param` is eligible for sketching.
    pub fn eligible(&self, param: &Parameter) -> bool {
        match param.kind {
            ParamKind::Bias => self.sketch_biases,
            ParamKind::Weight => param.numel() >= self.sketch_params_larger_than,
        }
    }
}

/// Per-coordinate learning rate.
#[derive(Debug, Clone, PartialEq)]
pub enum LrVec {
    /// Every coordinate shares one rate.
    Uniform(f32),
    PerCoordinate(Vec<f32>),
}

impl LrVec {
    /// The learning rate of coordinate `i`.
    pub fn at(&self, i: usize) -> f32 {
        match self {
            Self::Uniform(lr) => *lr,
            Self::PerCoordinate(lrs) => lrs[i],
        }
    }
}

#[derive(Debug, Clone)]
struct Slot {
    param: usize,
    group: usize,
    offset: usize,
    len: usize,
}

/// The fixed traversal that flattens a model's gradients into one vector.
///
/// Parameters are visited group by group, and in group order within a group.
/// Parameters that don't require a gradient are left out. The layout never
/// changes once built, so every vector indexed by it keeps its meaning for the
/// whole training run.
#[derive(Debug, Clone)]
pub struct FlatLayout {
    slots: Vec<Slot>,
    grad_size: usize,
    sketch_mask: Vec<bool>,
    sketched: Vec<usize>,
    dense: Vec<usize>,
}

impl FlatLayout {
    /// Builds the layout of `params` as grouped by `groups`.
    ///
    /// # Arguments
    /// * `params` - The model's parameters.
    /// * `groups` - The optimizer's parameter groups.
    /// * `rules` - Which parameters get sketched.
    ///
    /// # Returns
    /// The layout, or an error if a group names an unknown parameter or a parameter twice.
    pub fn new(params: &[Parameter], groups: &[ParamGroup], rules: SketchRules) -> Result<Self> {
        let mut seen = HashSet::new();
        let mut slots = Vec::new();
        let mut sketch_mask = Vec::new();
        let mut offset = 0;

        for (group_id, group) in groups.iter().enumerate() {
            for &param_id in &group.params {
                let Some(param) = params.get(param_id) else {
                    return Err(FedError::InvalidConfig(format!(
                        "group {group_id} names parameter {param_id}, the model has {}",
                        params.len()
                    )));
                };

                if !seen.insert(param_id) {
                    return Err(FedError::InvalidConfig(format!(
                        "parameter {param_id} belongs to more than one group"
                    )));
                }

                if !param.requires_grad {
                    continue;
                }

                let len = param.numel();
                let sketched = rules.eligible(param);
                sketch_mask.extend(std::iter::repeat_n(sketched, len));
                slots.push(Slot {
                    param: param_id,
                    group: group_id,
                    offset,
                    len,
                });
                offset += len;
            }
        }

        let (sketched, dense): (Vec<usize>, Vec<usize>) =
            (0..offset).partition(|&i| sketch_mask[i]);

        Ok(Self {
            slots,
            grad_size: offset,
            sketch_mask,
            sketched,
            dense,
        })
    }

    /// Length of every flattened vector.
    pub fn grad_size(&self) -> usize {
        self.grad_size
    }

    /// `true` at coordinates compressed through the sketch.
    pub fn sketch_mask(&self) -> &[bool] {
        &self.sketch_mask
    }

    /// Sketched coordinates, ascending.
    pub fn sketched_coords(&self) -> &[usize] {
        &self.sketched
    }

    /// Dense coordinates, ascending.
    pub fn dense_coords(&self) -> &[usize] {
        &self.dense
    }

    /// Flattens the gradients, writing zeros for parameters without one.
    pub fn grad_vec(&self, params: &[Parameter]) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.grad_size);

        for slot in &self.slots {
            match &params[slot.param].grad {
                Some(grad) => out.extend(grad.iter().copied()),
                None => out.extend(std::iter::repeat_n(0.0, slot.len)),
            }
        }

        out
    }

    /// Flattens the parameter values.
    pub fn param_vec(&self, params: &[Parameter]) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.grad_size);

        for slot in &self.slots {
            out.extend(params[slot.param].data.iter().copied());
        }

        out
    }

    /// Builds the per-coordinate learning rate.
    ///
    /// With a single group this is just that group's rate. Otherwise each
    /// coordinate takes its group's rate, except parameters that have no
    /// gradient, which get a zero rate.
    pub fn lr_vec(&self, params: &[Parameter], groups: &[ParamGroup]) -> LrVec {
        if let [group] = groups {
            return LrVec::Uniform(group.lr);
        }

        let mut lrs = Vec::with_capacity(self.grad_size);

        for slot in &self.slots {
            let lr = match params[slot.param].grad {
                Some(_) => groups[slot.group].lr,
                None => 0.0,
            };
            lrs.extend(std::iter::repeat_n(lr, slot.len));
        }

        LrVec::PerCoordinate(lrs)
    }

    /// Subtracts `lr * update` from the parameters.
    ///
    /// # Returns
    /// An error if `update` is not `grad_size` long.
    pub fn apply(&self, params: &mut [Parameter], update: &[f32], lr: &LrVec) -> Result<()> {
        if update.len() != self.grad_size {
            return Err(FedError::LengthMismatch {
                expected: self.grad_size,
                got: update.len(),
            });
        }

        for slot in &self.slots {
            let range = slot.offset..slot.offset + slot.len;
            let data = &mut params[slot.param].data;

            data.iter_mut()
                .zip(range.clone().zip(&update[range]))
                .for_each(|(p, (i, u))| *p -= lr.at(i) * u);
        }

        Ok(())
    }

    /// Zeroes the gradient of every parameter in the layout.
    pub fn zero_grads(&self, params: &mut [Parameter]) {
        for slot in &self.slots {
            params[slot.param].zero_grad();
        }
    }
}
