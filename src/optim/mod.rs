mod groups;
mod layout;

pub use groups::{Hyperparameter, ParamGroup, ParamGroupLr};
pub use layout::{FlatLayout, LrVec, SketchRules};
