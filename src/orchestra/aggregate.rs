use crate::{
    error::{FedError, Result},
    optim::FlatLayout,
    sketch::{top_k_entries, CountSketch},
};

/// Sparsity targets of the sketched aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopKParams {
    /// Amount of sketched coordinates kept in the final update.
    pub k: usize,
    /// Over-recovery multiplier, `p2 * k` candidates are pulled from the sketch.
    pub p2: usize,
}

/// Turns the contributions of every participant into one weight update.
///
/// 1. The sketched part of every contribution is inserted into `sketch`.
/// 2. `p2 * k` candidate coordinates are recovered from it.
/// 3. Each candidate's value is recomputed exactly from the contributions.
/// 4. The `k` candidates with the largest exact squared value are kept.
/// 5. Dense coordinates are summed exactly.
///
/// The sketch only decides *where* the update goes, never *what* it holds.
/// The output depends on nothing but the ordered contributions and the
/// sketch's hash seed, so every worker running this on the same inputs gets
/// the same update.
///
/// # Arguments
/// * `sketch` - Scratch sketch over the sketched coordinates, zeroed here.
/// * `layout` - The flattened layout shared by every contribution.
/// * `grads` - The contributions, each `layout.grad_size()` long.
/// * `params` - Sparsity targets.
///
/// # Returns
/// A `grad_size` long update, or an error if a contribution has the wrong length.
pub fn sketched_aggregate<G>(
    sketch: &mut CountSketch,
    layout: &FlatLayout,
    grads: &[G],
    params: TopKParams,
) -> Result<Vec<f32>>
where
    G: AsRef<[f32]>,
{
    let grad_size = layout.grad_size();
    let sketched = layout.sketched_coords();

    if sketch.dim() != sketched.len() {
        return Err(FedError::LengthMismatch {
            expected: sketched.len(),
            got: sketch.dim(),
        });
    }

    sketch.zero();
    let mut scratch = Vec::with_capacity(sketched.len());

    for grad in grads {
        let grad = grad.as_ref();
        if grad.len() != grad_size {
            return Err(FedError::LengthMismatch {
                expected: grad_size,
                got: grad.len(),
            });
        }

        scratch.clear();
        scratch.extend(sketched.iter().map(|&i| grad[i]));
        sketch.accumulate(&scratch)?;
    }

    let candidates = sketch.heavy_hitters(params.p2.saturating_mul(params.k));
    let exact = candidates
        .into_iter()
        .map(|j| (j, column_sum(grads, sketched[j])))
        .collect();

    let mut update = vec![0.0; grad_size];

    for (j, value) in top_k_entries(exact, params.k) {
        update[sketched[j]] = value;
    }

    for &i in layout.dense_coords() {
        update[i] = column_sum(grads, i);
    }

    Ok(update)
}

/// Exact sum of coordinate `i` across every contribution, in contribution order.
fn column_sum<G: AsRef<[f32]>>(grads: &[G], i: usize) -> f32 {
    grads.iter().map(|grad| grad.as_ref()[i]).sum()
}
