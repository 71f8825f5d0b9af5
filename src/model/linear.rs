use ndarray::{Array1, Array2, Axis, ErrorKind, Ix1, Ix2, ShapeError};
use rand::Rng;

use super::{DifferentiableModel, ParamKind, Parameter, Tensor};
use crate::error::Result;

const WEIGHT: usize = 0;
const BIAS: usize = 1;

/// A fully connected layer, `y = x W + b`.
///
/// Inputs are `(batch, in)` matrices and outputs are `(batch, out)` matrices.
#[derive(Debug, Clone)]
pub struct Linear {
    params: Vec<Parameter>,
    // Forward metadata
    x: Array2<f32>,
}

impl Linear {
    /// Creates a `Linear` layer initialised uniformly in `[-1/sqrt(in), 1/sqrt(in)]`.
    ///
    /// # Arguments
    /// * `dim` - The `(in, out)` dimensions.
    /// * `rng` - Source of the initial weights.
    pub fn new<R: Rng>(dim: (usize, usize), rng: &mut R) -> Self {
        let bound = 1.0 / (dim.0.max(1) as f32).sqrt();
        let weight = Array2::from_shape_fn(dim, |_| rng.random_range(-bound..=bound));
        let bias = Array1::from_shape_fn(dim.1, |_| rng.random_range(-bound..=bound));

        Self::from_parts(weight, bias)
    }

    /// Creates a `Linear` layer from explicit weights and biases.
    pub fn from_parts(weight: Array2<f32>, bias: Array1<f32>) -> Self {
        let params = vec![
            Parameter::new("weight", ParamKind::Weight, weight.into_dyn()),
            Parameter::new("bias", ParamKind::Bias, bias.into_dyn()),
        ];

        Self {
            params,
            x: Array2::zeros((0, 0)),
        }
    }
}

impl DifferentiableModel for Linear {
    fn forward(&mut self, inputs: &Tensor) -> Result<Tensor> {
        let x = inputs.view().into_dimensionality::<Ix2>()?;
        let w = self.params[WEIGHT].data.view().into_dimensionality::<Ix2>()?;
        let b = self.params[BIAS].data.view().into_dimensionality::<Ix1>()?;

        if x.ncols() != w.nrows() {
            return Err(ShapeError::from_kind(ErrorKind::IncompatibleShape).into());
        }

        let z = x.dot(&w) + &b;
        self.x = x.to_owned();

        Ok(z.into_dyn())
    }

    fn backward(&mut self, grad_outputs: &Tensor) -> Result<()> {
        let d = grad_outputs.view().into_dimensionality::<Ix2>()?;
        let outputs = self.params[BIAS].numel();

        if d.nrows() != self.x.nrows() || d.ncols() != outputs {
            return Err(ShapeError::from_kind(ErrorKind::IncompatibleShape).into());
        }

        let dw = self.x.t().dot(&d).into_dyn();
        let db = d.sum_axis(Axis(0)).into_dyn();

        self.params[WEIGHT].accumulate_grad(&dw);
        self.params[BIAS].accumulate_grad(&db);
        Ok(())
    }

    fn parameters(&self) -> &[Parameter] {
        &self.params
    }

    fn parameters_mut(&mut self) -> &mut [Parameter] {
        &mut self.params
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{arr1, arr2};

    use super::*;
    use crate::error::FedError;

    #[test]
    fn forward_applies_weights_and_bias() {
        let mut layer = Linear::from_parts(arr2(&[[1.0], [2.0]]), arr1(&[0.5]));
        let y = layer.forward(&arr2(&[[1.0, 1.0], [2.0, 0.0]]).into_dyn()).unwrap();
        assert_eq!(y, arr2(&[[3.5], [2.5]]).into_dyn());
    }

    #[test]
    fn backward_accumulates_gradients() {
        let mut layer = Linear::from_parts(arr2(&[[1.0], [2.0]]), arr1(&[0.0]));
        layer.forward(&arr2(&[[1.0, 3.0]]).into_dyn()).unwrap();

        let d = arr2(&[[2.0]]).into_dyn();
        layer.backward(&d).unwrap();
        layer.backward(&d).unwrap();

        let params = layer.parameters();
        assert_eq!(params[WEIGHT].grad, Some(arr2(&[[4.0], [12.0]]).into_dyn()));
        assert_eq!(params[BIAS].grad, Some(arr1(&[4.0]).into_dyn()));
    }

    #[test]
    fn wrongly_shaped_input_is_an_error() {
        let mut layer = Linear::from_parts(arr2(&[[1.0], [2.0]]), arr1(&[0.0]));
        assert!(layer.forward(&arr1(&[1.0, 2.0]).into_dyn()).is_err());
    }

    #[test]
    fn mismatched_widths_are_errors_not_panics() {
        let mut layer = Linear::from_parts(arr2(&[[1.0], [2.0]]), arr1(&[0.0]));
        let err = layer.forward(&arr2(&[[1.0, 2.0, 3.0]]).into_dyn()).unwrap_err();
        assert!(matches!(err, FedError::Shape(_)));

        layer.forward(&arr2(&[[1.0, 2.0]]).into_dyn()).unwrap();
        assert!(layer.backward(&arr2(&[[1.0, 1.0]]).into_dyn()).is_err());
        assert!(layer.backward(&arr2(&[[1.0], [1.0]]).into_dyn()).is_err());
        assert_eq!(layer.parameters()[WEIGHT].grad, None);
    }
}
