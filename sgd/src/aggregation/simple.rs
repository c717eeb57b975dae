use comms::Transport;

use super::{
    GradientAggregator, QuantizationPolicy,
    reducer::{BucketPolicies, ReduceOp, Reducer},
};
use crate::{
    Result, SgdErr, distributed::Distributed, gradient::GradientLayout,
    gradient::GradientPackage, header::AggregationHeader,
};

/// Blocking aggregation of single-precision packages.
#[derive(Debug, Clone)]
pub struct SimpleAggregator<T> {
    reducer: Reducer<T>,
    policies: BucketPolicies,
}

impl<T: Transport + Sync> SimpleAggregator<T> {
    /// Creates a new `SimpleAggregator`.
    ///
    /// # Arguments
    /// * `transport` - The collective layer shared with the other ranks.
    /// * `layout` - The shape every non empty package must have.
    /// * `op` - How the contributions are combined.
    /// * `policy` - The quantization applied before reducing.
    ///
    /// # Returns
    /// The aggregator, or an `InvalidConfig` error if `layout` mixes precisions.
    pub fn new(
        transport: T,
        layout: GradientLayout,
        op: ReduceOp,
        policy: QuantizationPolicy,
    ) -> Result<Self> {
        if layout.precisions().len() > 1 {
            return Err(SgdErr::InvalidConfig(
                "packages mixing precisions need the mixed aggregator".into(),
            ));
        }

        Ok(Self {
            reducer: Reducer::new(transport, layout, op),
            policies: BucketPolicies::uniform(policy),
        })
    }

    pub fn layout(&self) -> &GradientLayout {
        self.reducer.layout()
    }

    pub fn set_num_gradient_bits(&mut self, bits: u32) {
        self.policies.set_bits(bits);
    }
}

impl<T: Transport + Sync> GradientAggregator for SimpleAggregator<T> {
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
            .reduce_package(package, &self.policies, None, contributors, false)
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

impl<T: Transport + Sync> Distributed for SimpleAggregator<T> {
    type Transport = T;

    fn transport(&self) -> &T {
        &self.reducer.transport
    }
}
