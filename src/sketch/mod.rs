mod count_sketch;
mod topk;

pub use count_sketch::CountSketch;
pub use topk::{top_k, top_k_entries, top_k_indices};
