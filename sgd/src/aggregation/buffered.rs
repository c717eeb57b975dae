use comms::Transport;
use log::debug;
use tokio::task::JoinHandle;

use super::{
    GradientAggregator, QuantizationPolicy,
    reducer::{BucketPolicies, OwnedGradients, ReduceOp, Reducer, Residuals, Round},
};
use crate::{
    Result,
    distributed::Distributed,
    gradient::{GradientLayout, GradientPackage},
    header::AggregationHeader,
};

/// Aggregation overlapped with the next minibatch's computation.
///
/// Every call starts reducing the given package in the background and delivers
/// the result of the previous call, so updates lag one minibatch behind. The
/// first call after a reset has nothing to deliver yet: it zeroes the package,
/// clears the header and returns `true`. Quantization errors are fed back into
/// the next round.
#[derive(Debug)]
pub struct BufferedAggregator<T> {
    reducer: Reducer<T>,
    policies: BucketPolicies,
    residuals: Option<Residuals>,
    pending: Option<JoinHandle<Result<Round>>>,
}

impl<T: Transport + Clone + Sync + 'static> BufferedAggregator<T> {
    /// Creates a new `BufferedAggregator`.
    ///
    /// # Arguments
    /// * `transport` - The collective layer shared with the other ranks.
    /// * `layout` - The shape every non empty package must have.
    /// * `op` - How the contributions are combined.
    /// * `policy` - The quantization applied to the half and single precision buckets.
    ///
    /// # Returns
    /// A new `BufferedAggregator` instance.
    pub fn new(
        transport: T,
        layout: GradientLayout,
        op: ReduceOp,
        policy: QuantizationPolicy,
    ) -> Self {
        Self {
            residuals: Some(Residuals::zeros(&layout)),
            reducer: Reducer::new(transport, layout, op),
            policies: BucketPolicies::mixed(policy),
            pending: None,
        }
    }

    pub fn layout(&self) -> &GradientLayout {
        self.reducer.layout()
    }

    pub fn set_num_gradient_bits(&mut self, bits: u32) {
        self.policies.set_bits(bits);
    }

    /// Returns `true` while a round is being reduced in the background.
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Waits for the round in flight, if any, and takes back its residuals.
    async fn take_pending(&mut self) -> Result<Option<Round>> {
        let Some(task) = self.pending.take() else {
            return Ok(None);
        };

        let mut round = task.await??;
        self.residuals = round.residuals.take();
        Ok(Some(round))
    }

    fn start_round(&mut self, package: &mut GradientPackage<'_>, header: &AggregationHeader) {
        let contributed = !package.is_empty();
        let mismatch = contributed && package.layout() != *self.reducer.layout();
        let grads = OwnedGradients::copy_from(package);

        let task = self.reducer.clone().reduce_round(
            grads,
            header.clone(),
            contributed,
            mismatch,
            self.policies,
            self.residuals.take(),
        );

        self.pending = Some(tokio::spawn(task));
    }

    /// Writes a finished round into the caller's buffers.
    fn deliver(round: Round, package: &mut GradientPackage<'_>, header: &mut AggregationHeader) -> bool {
        if round.contributors == 0 {
            return false;
        }

        round.grads.write_into(package);
        *header = round.header;
        true
    }
}

impl<T: Transport + Clone + Sync + 'static> GradientAggregator for BufferedAggregator<T> {
    async fn aggregate(
        &mut self,
        package: &mut GradientPackage<'_>,
        header: &mut AggregationHeader,
        reset_state: bool,
    ) -> Result<bool> {
        let previous = self.take_pending().await?;

        if reset_state {
            if previous.is_some() {
                debug!(rank = self.current_rank(); "discarded the round in flight");
            }
            self.residuals = Some(Residuals::zeros(self.reducer.layout()));
        }

        self.start_round(package, header);

        match previous {
            Some(round) if !reset_state => Ok(Self::deliver(round, package, header)),
            _ => {
                for b in package.half_mut() {
                    b.fill(Default::default());
                }
                for b in package.single_mut() {
                    b.fill(0.);
                }
                for b in package.double_mut() {
                    b.fill(0.);
                }
                header.reset();
                Ok(true)
            }
        }
    }

    async fn flush(
        &mut self,
        package: &mut GradientPackage<'_>,
        header: &mut AggregationHeader,
    ) -> Result<bool> {
        match self.take_pending().await? {
            Some(round) => Ok(Self::deliver(round, package, header)),
            None => Ok(false),
        }
    }
}

impl<T: Transport + Clone + Sync + 'static> Distributed for BufferedAggregator<T> {
    type Transport = T;

    fn transport(&self) -> &T {
        &self.reducer.transport
    }
}
