mod aggregator;
mod buffered;
mod mixed;
mod quantization;
mod reducer;
mod simple;

pub use aggregator::{Aggregator, GradientAggregator, LocalGradientAggregator};
pub use buffered::BufferedAggregator;
pub use mixed::MixedAggregator;
pub use quantization::QuantizationPolicy;
pub use reducer::ReduceOp;
pub use simple::SimpleAggregator;
