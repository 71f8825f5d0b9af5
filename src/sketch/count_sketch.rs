use rand::{rngs::StdRng, Rng, SeedableRng};

use super::topk;
use crate::error::{FedError, Result};

/// Mersenne prime 2^61 - 1, modulus of the hash families.
const LARGE_PRIME: u64 = (1 << 61) - 1;

/// Coefficients per row: two for the bucket hash, four for the sign hash.
const COEFFS_PER_ROW: usize = 6;

/// A Count-Sketch over a `d` dimensional vector.
///
/// The table has `r` rows of `c` buckets. Every coordinate is hashed to one bucket
/// per row and carries a random sign there, so inserting a vector is linear:
/// `sketch(a) + sketch(b) == sketch(a + b)`.
///
/// When `num_blocks > 1` the hashes are only generated for the first
/// `ceil(d / num_blocks)` coordinates and reused by every block, shifted by a
/// per-block bucket offset and flipped by a per-block sign.
///
/// Two sketches built with the same shape and seed hash coordinates identically,
/// which is what makes tables from different workers comparable.
#[derive(Debug, Clone)]
pub struct CountSketch {
    d: usize,
    c: usize,
    r: usize,
    num_blocks: usize,
    block_len: usize,
    /// `r x block_len`, row major.
    buckets: Vec<usize>,
    /// `r x block_len`, row major, each entry is `1.0` or `-1.0`.
    signs: Vec<f32>,
    block_offsets: Vec<usize>,
    block_signs: Vec<f32>,
    /// `r x c`, row major.
    table: Vec<f32>,
}

impl CountSketch {
    /// Creates a new zeroed `CountSketch`.
    ///
    /// # Arguments
    /// * `d` - Dimension of the sketched vectors.
    /// * `c` - Buckets per row.
    /// * `r` - Amount of independent hash rows.
    /// * `num_blocks` - Amount of blocks sharing the same hashes.
    /// * `seed` - Seed of the hash functions.
    ///
    /// # Returns
    /// A new sketch, or an error if `c`, `r` or `num_blocks` is zero.
    pub fn new(d: usize, c: usize, r: usize, num_blocks: usize, seed: u64) -> Result<Self> {
        if c == 0 || r == 0 || num_blocks == 0 {
            return Err(FedError::InvalidConfig(format!(
                "sketch shape must be positive, got c={c} r={r} num_blocks={num_blocks}"
            )));
        }

        let mut rng = StdRng::seed_from_u64(seed);

        let (block_offsets, block_signs) = if num_blocks > 1 {
            let offsets = (0..num_blocks).map(|_| rng.random_range(0..c)).collect();
            let signs = (0..num_blocks)
                .map(|_| if rng.random::<bool>() { 1.0 } else { -1.0 })
                .collect();
            (offsets, signs)
        } else {
            (vec![0], vec![1.0])
        };

        let coeffs: Vec<u64> = (0..r * COEFFS_PER_ROW)
            .map(|_| rng.random_range(0..LARGE_PRIME))
            .collect();

        let block_len = d.div_ceil(num_blocks);
        let mut buckets = Vec::with_capacity(r * block_len);
        let mut signs = Vec::with_capacity(r * block_len);

        for row in coeffs.chunks_exact(COEFFS_PER_ROW) {
            for token in 0..block_len as u64 {
                buckets.push(bucket_hash(row[0], row[1], token, c));
                signs.push(sign_hash(&row[2..], token));
            }
        }

        Ok(Self {
            d,
            c,
            r,
            num_blocks,
            block_len,
            buckets,
            signs,
            block_offsets,
            block_signs,
            table: vec![0.0; r * c],
        })
    }

    /// Dimension of the sketched vectors.
    pub fn dim(&self) -> usize {
        self.d
    }

    /// Raw bucket table, `rows x cols` in row major order.
    pub fn table(&self) -> &[f32] {
        &self.table
    }

    /// Clears every bucket.
    pub fn zero(&mut self) {
        self.table.fill(0.0);
    }

    /// Adds a dense vector of length `d` into the table.
    ///
    /// # Arguments
    /// * `vec` - The vector to insert.
    ///
    /// # Returns
    /// An error if `vec` is not `d` long.
    pub fn accumulate(&mut self, vec: &[f32]) -> Result<()> {
        if vec.len() != self.d {
            return Err(FedError::LengthMismatch {
                expected: self.d,
                got: vec.len(),
            });
        }

        for row in 0..self.r {
            for (block, chunk) in vec.chunks(self.block_len.max(1)).enumerate() {
                for (token, &x) in chunk.iter().enumerate() {
                    let (bucket, sign) = self.locate(row, block, token);
                    self.table[row * self.c + bucket] += sign * x;
                }
            }
        }

        Ok(())
    }

    /// Adds another sketch's table into this one.
    ///
    /// # Returns
    /// An error if the sketches don't share their shape.
    pub fn merge(&mut self, other: &CountSketch) -> Result<()> {
        if self.table.len() != other.table.len() || self.d != other.d {
            return Err(FedError::LengthMismatch {
                expected: self.table.len(),
                got: other.table.len(),
            });
        }

        self.table
            .iter_mut()
            .zip(&other.table)
            .for_each(|(a, b)| *a += b);

        Ok(())
    }

    /// Estimates every coordinate as the median of its signed buckets across rows.
    ///
    /// With an even amount of rows the lower of the two middle values is used.
    pub fn estimates(&self) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.d);
        let mut per_row = vec![0.0f32; self.r];
        let mid = (self.r - 1) / 2;

        for i in 0..self.d {
            let (block, token) = (i / self.block_len, i % self.block_len);

            for (row, slot) in per_row.iter_mut().enumerate() {
                let (bucket, sign) = self.locate(row, block, token);
                *slot = self.table[row * self.c + bucket] * sign;
            }

            let (_, median, _) = per_row.select_nth_unstable_by(mid, f32::total_cmp);
            out.push(*median);
        }

        out
    }

    /// Indices of the `m` coordinates with the largest estimated squared value.
    ///
    /// # Returns
    /// At most `m` indices sorted ascending, ties resolved by the lower index.
    pub fn heavy_hitters(&self, m: usize) -> Vec<usize> {
        topk::top_k_indices(&self.estimates(), m)
    }

    /// Recovers an approximation of the top `m` coordinates.
    ///
    /// # Returns
    /// A vector of length `d`, zero everywhere but at the `m` coordinates with the
    /// largest estimated squared value, which hold the sketch's estimate.
    pub fn unsketch(&self, m: usize) -> Vec<f32> {
        topk::top_k(&self.estimates(), m)
    }

    /// Bucket and sign of the `token`th coordinate of `block` in `row`.
    fn locate(&self, row: usize, block: usize, token: usize) -> (usize, f32) {
        let at = row * self.block_len + token;
        let bucket = self.buckets[at];
        let sign = self.signs[at];

        if self.num_blocks == 1 {
            return (bucket, sign);
        }

        (
            (bucket + self.block_offsets[block]) % self.c,
            sign * self.block_signs[block],
        )
    }
}

fn bucket_hash(a: u64, b: u64, token: u64, c: usize) -> usize {
    let p = LARGE_PRIME as u128;
    let h = (a as u128 * token as u128 + b as u128) % p;
    (h % c as u128) as usize
}

fn sign_hash(coeffs: &[u64], token: u64) -> f32 {
    let p = LARGE_PRIME as u128;
    let t = token as u128;
    let h = coeffs
        .iter()
        .fold(0u128, |acc, &coeff| (acc * t + coeff as u128) % p);

    if h % 2 == 0 {
        -1.0
    } else {
        1.0
    }
}
