use std::cmp::Ordering;

/// Orders `(index, value)` entries from largest to smallest squared value.
///
/// Entries with the same squared value are ordered by ascending index, so the
/// selection never depends on the order the entries were produced in.
fn by_magnitude(a: &(usize, f32), b: &(usize, f32)) -> Ordering {
    let a_sq = a.1 * a.1;
    let b_sq = b.1 * b.1;
    b_sq.total_cmp(&a_sq).then(a.0.cmp(&b.0))
}

/// Keeps the `k` entries with the largest squared value.
///
/// # Arguments
/// * `entries` - Sparse `(index, value)` pairs, indices must be unique.
/// * `k` - The amount of entries to keep.
///
/// # Returns
/// At most `k` entries, sorted by ascending index.
pub fn top_k_entries(mut entries: Vec<(usize, f32)>, k: usize) -> Vec<(usize, f32)> {
    if k == 0 {
        return Vec::new();
    }

    if k < entries.len() {
        entries.select_nth_unstable_by(k - 1, by_magnitude);
        entries.truncate(k);
    }

    entries.sort_unstable_by_key(|&(i, _)| i);
    entries
}

/// Indices of the `k` coordinates of `values` with the largest squared value.
///
/// # Returns
/// At most `k` indices, sorted ascending.
pub fn top_k_indices(values: &[f32], k: usize) -> Vec<usize> {
    let entries = values.iter().copied().enumerate().collect();
    top_k_entries(entries, k)
        .into_iter()
        .map(|(i, _)| i)
        .collect()
}

/// Dense copy of `values` with everything but the top `k` coordinates zeroed.
pub fn top_k(values: &[f32], k: usize) -> Vec<f32> {
    let mut out = vec![0.0; values.len()];

    for i in top_k_indices(values, k) {
        out[i] = values[i];
    }

    out
}
