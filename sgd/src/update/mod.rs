mod clipping;
mod engine;
mod rules;

pub use clipping::{ClippingMode, clip};
pub use engine::{UpdateArgs, WeightUpdateEngine};
pub use rules::{FsAdaGradSettings, GradientUpdateConfig, GradientUpdateType, RmsPropSettings};
