use comms::Transport;

use super::{BufferedAggregator, MixedAggregator, QuantizationPolicy, ReduceOp, SimpleAggregator};
use crate::{
    Result,
    config::ParallelConfig,
    distributed::Distributed,
    gradient::{GradientLayout, GradientPackage, Precision},
    header::AggregationHeader,
};

/// Combines the gradients and headers of every rank.
#[allow(unused)]
#[trait_variant::make(GradientAggregator: Send)]
pub trait LocalGradientAggregator {
    /// Reduces this rank's package together with every other rank's.
    ///
    /// Ranks without data for this round pass an empty package, they still
    /// receive the reduced header but no gradients.
    ///
    /// # Arguments
    /// * `package` - This rank's gradients, overwritten with the reduced ones.
    /// * `header` - This rank's totals, overwritten with the reduced ones.
    /// * `reset_state` - Drops any state carried over from previous rounds.
    ///
    /// # Returns
    /// `false` if every rank passed an empty package, in which case nothing was
    /// written.
    async fn aggregate(
        &mut self,
        package: &mut GradientPackage<'_>,
        header: &mut AggregationHeader,
        reset_state: bool,
    ) -> Result<bool>;

    /// Delivers any round still in flight.
    ///
    /// # Returns
    /// `true` if a round with at least one contribution was written.
    async fn flush(
        &mut self,
        package: &mut GradientPackage<'_>,
        header: &mut AggregationHeader,
    ) -> Result<bool>;
}

/// The aggregator picked for a run.
#[derive(Debug)]
pub enum Aggregator<T> {
    Simple(SimpleAggregator<T>),
    Mixed(MixedAggregator<T>),
    Buffered(BufferedAggregator<T>),
}

impl<T: Transport + Clone + Sync + 'static> Aggregator<T> {
    /// Picks the aggregator matching a parallel configuration and a package layout.
    ///
    /// # Arguments
    /// * `transport` - The collective layer shared with the other ranks.
    /// * `layout` - The shape every non empty package must have.
    /// * `parallel` - The parallel training settings.
    /// * `num_gradient_bits` - The quantization width for the current epoch.
    ///
    /// # Returns
    /// The aggregator, buffered if requested, mixed unless the layout is single precision only.
    pub fn from_config(
        transport: T,
        layout: GradientLayout,
        parallel: &ParallelConfig,
        num_gradient_bits: u32,
    ) -> Result<Self> {
        let policy = QuantizationPolicy::new(
            num_gradient_bits,
            parallel.pack_threshold_size_in_bytes,
            parallel.zero_threshold_for_1bit,
        );

        Self::new(
            transport,
            layout,
            parallel.reduce_op,
            policy,
            parallel.buffered_async_gradient_aggregation,
        )
    }

    /// Creates a new `Aggregator`.
    pub fn new(
        transport: T,
        layout: GradientLayout,
        op: ReduceOp,
        policy: QuantizationPolicy,
        buffered: bool,
    ) -> Result<Self> {
        if buffered {
            return Ok(Self::Buffered(BufferedAggregator::new(
                transport, layout, op, policy,
            )));
        }

        if layout.precisions() != [Precision::Single] {
            return Ok(Self::Mixed(MixedAggregator::new(
                transport, layout, op, policy,
            )));
        }

        Ok(Self::Simple(SimpleAggregator::new(
            transport, layout, op, policy,
        )?))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Simple(_) => "simple",
            Self::Mixed(_) => "mixed",
            Self::Buffered(_) => "buffered",
        }
    }

    pub fn set_num_gradient_bits(&mut self, bits: u32) {
        match self {
            Self::Simple(a) => a.set_num_gradient_bits(bits),
            Self::Mixed(a) => a.set_num_gradient_bits(bits),
            Self::Buffered(a) => a.set_num_gradient_bits(bits),
        }
    }
}

impl<T: Transport + Clone + Sync + 'static> GradientAggregator for Aggregator<T> {
    async fn aggregate(
        &mut self,
        package: &mut GradientPackage<'_>,
        header: &mut AggregationHeader,
        reset_state: bool,
    ) -> Result<bool> {
        match self {
            Self::Simple(a) => GradientAggregator::aggregate(a, package, header, reset_state).await,
            Self::Mixed(a) => GradientAggregator::aggregate(a, package, header, reset_state).await,
            Self::Buffered(a) => GradientAggregator::aggregate(a, package, header, reset_state).await,
        }
    }

    async fn flush(
        &mut self,
        package: &mut GradientPackage<'_>,
        header: &mut AggregationHeader,
    ) -> Result<bool> {
        match self {
            Self::Simple(a) => GradientAggregator::flush(a, package, header).await,
            Self::Mixed(a) => GradientAggregator::flush(a, package, header).await,
            Self::Buffered(a) => GradientAggregator::flush(a, package, header).await,
        }
    }
}

impl<T: Transport + Clone + Sync + 'static> Distributed for Aggregator<T> {
    type Transport = T;

    fn transport(&self) -> &T {
        match self {
            Self::Simple(a) => a.transport(),
            Self::Mixed(a) => a.transport(),
            Self::Buffered(a) => a.transport(),
        }
    }
}
