use comms::Transport;

use super::{
    GradientAggregator, QuantizationPolicy,
    reducer::{BucketPolicies, ReduceOp, Reducer},
};
use crate::{
    Result, distributed::Distributed,
    gradient::{GradientLayout, GradientPackage},
    header::AggregationHeader,
};

/// Blocking aggregation of packages mixing half, single and double precision buffers.
///
/// Half precision buffers are widened to single precision for the reduction,
/// double precision buffers always travel at full precision.
#[derive(Debug, Clone)]
pub struct MixedAggregator<T> {
    reducer: Reducer<T>,
    policies: BucketPolicies,
}

impl<T: Transport + Sync> MixedAggregator<T> {
    /// Creates a new `MixedAggregator`.
    ///
    /// # Arguments
    /// * `transport` - The collective layer shared with the other ranks.
    /// * `layout` - The shape every non empty package must have.
    /// * `op` - How the contributions are combined.
    /// * `policy` - The quantization applied to the half and single precision buckets.
    ///
    /// # Returns
    /// A new `MixedAggregator` instance.
    pub fn new(
        transport: T,
        layout: GradientLayout,
        op: ReduceOp,
        policy: QuantizationPolicy,
    ) -> Self {
        Self {
            reducer: Reducer::new(transport, layout, op),
            policies: BucketPolicies::mixed(policy),
        }
    }

    pub fn layout(&self) -> &GradientLayout {
        self.reducer.layout()
    }

    pub fn set_num_gradient_bits(&mut self, bits: u32) {
        self.policies.set_bits(bits);
    }
}

impl<T: Transport + Sync> GradientAggregator for MixedAggregator<T> {
    async fn aggregate(
        &mut self,
        package: &mut GradientPackage<'_>,
        header: &mut AggregationHeader,
        _reset_state: bool,
    ) -> Result<bool> {
        let contributors = self.reducer.reduce_header(header, package).await?;
        if contributors == 0 {
            return Ok(false);
        }

        self.reducer
            .reduce_package(package, &self.policies, None, contributors, true)
            .await?;

        Ok(true)
    }

    async fn flush(
        &mut self,
        _package: &mut GradientPackage<'_>,
        _header: &mut AggregationHeader,
    ) -> Result<bool> {
        Ok(false)
    }
}

impl<T: Transport + Sync> Distributed for MixedAggregator<T> {
    type Transport = T;

    fn transport(&self) -> &T {
        &self.reducer.transport
    }
}
