use comms::{Transport, broadcast_from_root};
use log::{debug, info, warn};

use crate::{
    Result, SgdErr,
    aggregation::{Aggregator, GradientAggregator},
    asgd::{AsyncContext, AsyncCoordinator},
    checkpoint::{BestEpochs, CheckpointManager, CheckpointRecord},
    config::{EpochView, ParallelizationMethod, SgdConfig},
    engine::{ComputationEngine, DataSource},
    gradient::{DeviceBuffer, Gradients},
    header::AggregationHeader,
    learning_rate::{
        Adjustment, IterationSchedule, LearnRateState, LearningRateController, LearningRateSearch,
    },
    minibatch::MinibatchSizeController,
    sync::{
        BlockMomentum, BlockMomentumState, ModelAveraging, ParameterSync, ParameterSynchronizer,
    },
    update::{UpdateArgs, WeightUpdateEngine},
};

/// What a training run reports once it stops.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSummary {
    /// Epochs trained by this run, resumed epochs excluded.
    pub epochs_run: usize,
    pub final_learn_rate: f64,
    pub final_criterion: f64,
    /// Samples the model was updated with, resumed epochs included.
    pub total_samples: u64,
    pub best_epochs: BestEpochs,
}

/// Runs the epoch loop of one rank.
///
/// Every rank of a run drives its own `EpochDriver`, all of them built out of
/// the same configuration and connected through their transports.
pub struct EpochDriver<T, E: ComputationEngine, D> {
    config: SgdConfig,
    transport: T,
    engine: E,
    data: D,
    validation: Vec<E::Batch>,
    checkpoints: Option<CheckpointManager>,
    async_ctx: Option<AsyncContext>,
    updater: WeightUpdateEngine,
    smoothed: Vec<Vec<f32>>,
    smoothed_counts: Vec<f64>,
    learning_rate: LearningRateController,
    minibatch: MinibatchSizeController,
    iteration: Option<IterationSchedule>,
    best_epochs: BestEpochs,
    total_samples: u64,
    aggregator: Option<Aggregator<T>>,
    param_sync: Option<ParameterSync<T>>,
    coordinator: Option<AsyncCoordinator>,
    restored_block_momentum: Option<BlockMomentumState>,
}

impl<T, E, D> EpochDriver<T, E, D>
where
    T: Transport + Clone + Sync + 'static,
    E: ComputationEngine,
    D: DataSource<Batch = E::Batch>,
{
    /// Creates a new `EpochDriver`.
    ///
    /// Checkpoints are written where the configuration says, if anywhere.
    ///
    /// # Arguments
    /// * `config` - The trainer configuration, validated here.
    /// * `transport` - This rank's handle to the cluster.
    /// * `engine` - The model being trained.
    /// * `data` - The training data.
    ///
    /// # Returns
    /// The driver, or the first configuration error found.
    pub fn new(config: SgdConfig, transport: T, mut engine: E, data: D) -> Result<Self> {
        config.validate()?;

        let (params, grads) = engine.split_mut();
        let lens: Vec<usize> = params.iter().map(|p| p.len()).collect();
        check_lens("gradient", &lens, &grads.lens())?;
        if let Gradients::Half { working, .. } = &grads {
            let working: Vec<usize> = working.iter().map(|w| w.len()).collect();
            check_lens("working parameter", &lens, &working)?;
        }
        engine.refresh_working_copy();

        let updater = WeightUpdateEngine::from_config(&config)?;
        let smoothed = lens
            .iter()
            .map(|&len| vec![0.; updater.state_len(len)])
            .collect();
        let smoothed_counts = vec![0.; lens.len()];

        Ok(Self {
            learning_rate: LearningRateController::new(config.learning_rate_search.clone()),
            minibatch: MinibatchSizeController::new(config.minibatch_tuning.clone()),
            iteration: config
                .learning_rate_search
                .iteration_policy
                .map(IterationSchedule::new),
            checkpoints: CheckpointManager::from_config(&config.checkpoint),
            config,
            transport,
            engine,
            data,
            validation: Vec::new(),
            async_ctx: None,
            updater,
            smoothed,
            smoothed_counts,
            best_epochs: BestEpochs::default(),
            total_samples: 0,
            aggregator: None,
            param_sync: None,
            coordinator: None,
            restored_block_momentum: None,
        })
    }

    /// Evaluates `batches` after every epoch and tracks the best epochs on them.
    pub fn with_validation(mut self, batches: Vec<E::Batch>) -> Self {
        self.validation = batches;
        self
    }

    /// Replaces the checkpoint manager built out of the configuration.
    pub fn with_checkpoints(mut self, manager: CheckpointManager) -> Self {
        self.checkpoints = Some(manager);
        self
    }

    /// Connects the driver to the parameter store shared by asynchronous ranks.
    pub fn with_parameter_server(mut self, ctx: AsyncContext) -> Self {
        self.async_ctx = Some(ctx);
        self
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn into_engine(self) -> E {
        self.engine
    }

    /// Returns `true` on the rank owning the shared side effects: checkpoints and the store's seed.
    pub fn is_main(&self) -> bool {
        self.transport.current_rank() == 0
    }

    /// Returns the per-sample learning rate in effect, `None` before the first epoch.
    pub fn learn_rate(&self) -> Option<f64> {
        self.learning_rate.current()
    }

    /// Trains from the latest checkpoint, or from scratch, up to `max_epochs`.
    ///
    /// # Returns
    /// What the run did, or the error that aborted it on this rank.
    pub async fn train(&mut self) -> Result<TrainingSummary> {
        let uses_store = self.config.parallel.method == ParallelizationMethod::AsyncSgd;
        if uses_store && self.async_ctx.is_none() {
            return Err(SgdErr::InvalidConfig(
                "asynchronous SGD needs a parameter store".into(),
            ));
        }

        let start = self.resume()?;
        let mut summary = TrainingSummary {
            epochs_run: 0,
            final_learn_rate: self.learning_rate.current().unwrap_or_default(),
            final_criterion: f64::NAN,
            total_samples: 0,
            best_epochs: BestEpochs::default(),
        };

        for epoch in start..self.config.max_epochs {
            let (rate, criterion) = self.run_epoch(epoch).await?;
            summary.epochs_run += 1;
            summary.final_learn_rate = self.learning_rate.current().unwrap_or(rate);
            summary.final_criterion = criterion;

            let done = self.iteration.as_ref().is_some_and(|s| s.reach_max_iter());
            if share_from_main(&self.transport, done as u8 as f64).await? > 0. {
                info!(epoch = epoch; "reached the maximum amount of iterations");
                break;
            }
        }

        summary.total_samples = self.total_samples;
        summary.best_epochs = self.best_epochs.clone();
        Ok(summary)
    }

    /// Restores the latest readable checkpoint.
    ///
    /// # Returns
    /// The first epoch left to train.
    fn resume(&mut self) -> Result<usize> {
        let Some(manager) = &self.checkpoints else {
            return Ok(0);
        };

        let Some(record) = manager.load_latest() else {
            return Ok(0);
        };

        self.restore_model(&record)?;
        self.total_samples = record.total_samples_seen;

        let mut state = record.learn_rate_state.clone().unwrap_or_else(|| LearnRateState {
            current: Some(record.learn_rate_per_sample),
            ..Default::default()
        });
        if state.prev_criterion.is_none() && record.prev_criterion != f64::MAX {
            state.prev_criterion = Some(record.prev_criterion);
        }
        self.learning_rate.restore(state);

        if self.config.minibatch_tuning.frequency > 0 {
            self.minibatch.restore(Some(record.minibatch_size));
        }
        if let Some(policy) = self.config.learning_rate_search.iteration_policy {
            self.iteration = Some(IterationSchedule::resume(policy, record.iteration));
        }
        self.best_epochs = record.best_epochs.clone();

        info!(
            epoch = record.epoch,
            samples = record.total_samples_seen,
            rate = record.learn_rate_per_sample;
            "resumed training"
        );

        Ok(record.epoch + 1)
    }

    /// Overwrites the model and its update state with a checkpoint's.
    fn restore_model(&mut self, record: &CheckpointRecord) -> Result<()> {
        let (params, _) = self.engine.split_mut();
        copy_into(params, &record.parameters)?;
        self.engine.refresh_working_copy();

        let shapes_match = record.smoothed_gradients.len() == self.smoothed.len()
            && record
                .smoothed_gradients
                .iter()
                .zip(&self.smoothed)
                .all(|(a, b)| a.len() == b.len())
            && record.smoothed_counts.len() == self.smoothed_counts.len();
        if !shapes_match {
            return Err(SgdErr::SizeMismatch {
                what: "checkpoint smoothed gradients",
                got: record.smoothed_gradients.len(),
                expected: self.smoothed.len(),
            });
        }

        self.smoothed.clone_from(&record.smoothed_gradients);
        self.smoothed_counts.clone_from(&record.smoothed_counts);

        match (&mut self.param_sync, &record.block_momentum) {
            (Some(ParameterSync::BlockMomentum(bm)), Some(state)) => {
                bm.import_state(state.clone(), false)
            }
            (_, state) => self.restored_block_momentum = state.clone(),
        }

        Ok(())
    }

    /// Trains a single epoch.
    ///
    /// # Returns
    /// The epoch's learning rate and its global average criterion.
    async fn run_epoch(&mut self, epoch: usize) -> Result<(f64, f64)> {
        let ranks = self.transport.rank_count();
        let rank = self.transport.current_rank();

        let mut view = self.config.epoch_view(epoch, ranks, rank)?;
        let minibatch_size = self.choose_minibatch_size(&view).await?;
        if minibatch_size != view.minibatch_size {
            view.minibatch_size = minibatch_size;
            view.learn_rate_per_sample = self.config.learn_rate_per_sample(epoch, minibatch_size)?;
            view.momentum_per_sample = self.config.momentum_per_sample(epoch, minibatch_size)?;
        }
        let rate = self.choose_learn_rate(&view).await?;

        info!(
            epoch = epoch,
            method:? = view.method,
            minibatch_size = minibatch_size,
            rate = rate;
            "starting epoch"
        );

        let (data_rank, data_ranks) = match view.method {
            ParallelizationMethod::None => (0, 1),
            _ => (rank, ranks),
        };
        self.data
            .start_epoch(epoch, minibatch_size, data_rank, data_ranks);

        let mut header = AggregationHeader::new(self.engine.num_eval_metrics());
        match view.method {
            ParallelizationMethod::None => self.run_local(&view, rate, &mut header)?,
            ParallelizationMethod::GradientAggregation => {
                self.run_aggregated(&view, rate, &mut header).await?
            }
            ParallelizationMethod::ModelAveraging | ParallelizationMethod::BlockMomentum => {
                self.run_periodic(&view, rate, &mut header).await?;
                reduce_epoch_header(&self.transport, &mut header).await?;
            }
            ParallelizationMethod::AsyncSgd => {
                self.run_async(&view, rate, &mut header).await?;
                reduce_epoch_header(&self.transport, &mut header).await?;
            }
            ParallelizationMethod::ModelParallel => {
                return Err(SgdErr::Unsupported("model parallel training"));
            }
        }

        let criterion = header.average_criterion();
        if !criterion.is_finite() {
            warn!(epoch = epoch, criterion = criterion; "training criterion diverged");
        }
        info!(
            epoch = epoch,
            criterion = criterion,
            samples = header.num_samples;
            "finished epoch"
        );

        let adjustment = self.learning_rate.after_epoch(epoch, criterion);
        if adjustment == (Adjustment::Decreased { regressed: true })
            && self.config.learning_rate_search.load_best_model
        {
            self.roll_back(epoch, view.method)?;
        }

        self.track_best(epoch, criterion)?;
        self.save_checkpoint(epoch, minibatch_size, rate).await?;

        Ok((rate, criterion))
    }

    /// Searches the minibatch size on tuning epochs, rank 0's choice wins.
    async fn choose_minibatch_size(&mut self, view: &EpochView) -> Result<usize> {
        let epoch = view.epoch;
        let samples = self.config.minibatch_tuning.probe_samples;
        let template = self.update_args(view, view.learn_rate_per_sample, 0);

        let Self {
            config,
            engine,
            data,
            updater,
            smoothed,
            smoothed_counts,
            minibatch,
            ..
        } = &mut *self;

        let size = minibatch.size_for_epoch(epoch, view.minibatch_size, |mb| {
            let batches = data.probe_batches(epoch, mb, samples);
            let args = UpdateArgs {
                learn_rate_per_sample: config.learn_rate_per_sample(epoch, mb)?,
                momentum_per_sample: config.momentum_per_sample(epoch, mb)?,
                ..template
            };
            probe(engine, updater, smoothed, smoothed_counts, &batches, &args)
        })?;

        let shared = share_from_main(&self.transport, size as f64).await? as usize;
        if shared != size {
            self.minibatch.restore(Some(shared));
        }

        Ok(shared)
    }

    /// Picks the epoch's learning rate, rank 0's choice wins.
    async fn choose_learn_rate(&mut self, view: &EpochView) -> Result<f64> {
        let searching = self.learning_rate.mode() == LearningRateSearch::SearchBeforeEpoch
            && !self.learning_rate.search_exhausted();
        let batches = if searching {
            let samples = self.config.learning_rate_search.search_samples;
            self.data
                .probe_batches(view.epoch, view.minibatch_size, samples)
        } else {
            Vec::new()
        };
        let template = self.update_args(view, view.learn_rate_per_sample, 0);

        let Self {
            engine,
            updater,
            smoothed,
            smoothed_counts,
            learning_rate,
            ..
        } = &mut *self;

        let rate = learning_rate.rate_for_epoch(view.epoch, view.learn_rate_per_sample, |rate| {
            let args = UpdateArgs {
                learn_rate_per_sample: rate,
                ..template
            };
            probe(engine, updater, smoothed, smoothed_counts, &batches, &args)
        })?;

        let shared = share_from_main(&self.transport, rate).await?;
        if shared != rate {
            let mut state = self.learning_rate.state().clone();
            state.current = Some(shared);
            if let Some(last) = state.recent_rates.last_mut() {
                *last = shared;
            }
            self.learning_rate.restore(state);
        }

        Ok(shared)
    }

    fn update_args(&self, view: &EpochView, rate: f64, samples: usize) -> UpdateArgs {
        UpdateArgs {
            learn_rate_per_sample: rate,
            momentum_per_sample: view.momentum_per_sample,
            minibatch_samples: samples,
            l1: self.config.l1_reg_weight,
            l2: self.config.l2_reg_weight,
            need_average_multiplier: self.config.need_average_multiplier
                && view.method.is_periodic(),
            use_nesterov: self.config.use_nesterov_momentum,
            disable_unit_gain: self.config.disable_unit_gain,
        }
    }

    /// Returns the next batch unless this rank already saw `limit` samples.
    fn next_batch(&mut self, seen: usize, limit: Option<usize>) -> Option<E::Batch> {
        if limit.is_some_and(|l| seen >= l) {
            return None;
        }
        self.data.next_batch()
    }

    /// The per-rank share of `epoch_size`, `None` for the whole data source.
    fn local_limit(&self, ranks: usize) -> Option<usize> {
        (self.config.epoch_size > 0).then(|| self.config.epoch_size.div_ceil(ranks))
    }

    /// Trains on `batch` without talking to other ranks.
    ///
    /// # Returns
    /// The amount of samples in `batch`.
    fn local_step(
        &mut self,
        batch: &E::Batch,
        view: &EpochView,
        epoch_rate: f64,
        header: &mut AggregationHeader,
    ) -> Result<usize> {
        let stats = self.engine.forward_backward(batch)?;
        header.merge(&stats.to_header())?;
        self.apply(view, epoch_rate, stats.samples)?;
        Ok(stats.samples)
    }

    /// Applies the gradient currently in the engine, summed over `samples` samples.
    fn apply(&mut self, view: &EpochView, epoch_rate: f64, samples: usize) -> Result<()> {
        let rate = match &mut self.iteration {
            Some(schedule) => schedule.advance(),
            None => epoch_rate,
        };

        let args = self.update_args(view, rate, samples);
        apply_update(
            &mut self.engine,
            &mut self.updater,
            &mut self.smoothed,
            &mut self.smoothed_counts,
            &args,
        )?;

        self.total_samples += samples as u64;
        Ok(())
    }

    fn run_local(
        &mut self,
        view: &EpochView,
        epoch_rate: f64,
        header: &mut AggregationHeader,
    ) -> Result<()> {
        let limit = self.local_limit(1);
        let mut seen = 0;

        while let Some(batch) = self.next_batch(seen, limit) {
            seen += self.local_step(&batch, view, epoch_rate, header)?;
        }

        Ok(())
    }

    /// Aggregates the gradients of every minibatch across ranks.
    ///
    /// Ranks out of data keep taking part with zeroed gradients until a round
    /// comes back without samples.
    async fn run_aggregated(
        &mut self,
        view: &EpochView,
        epoch_rate: f64,
        epoch_header: &mut AggregationHeader,
    ) -> Result<()> {
        let mut aggregator = match self.aggregator.take() {
            Some(aggregator) => aggregator,
            None => {
                let (_, grads) = self.engine.split_mut();
                let layout = grads.layout();
                let aggregator = Aggregator::from_config(
                    self.transport.clone(),
                    layout,
                    &self.config.parallel,
                    view.num_gradient_bits,
                )?;
                info!(kind = aggregator.kind(); "created gradient aggregator");
                aggregator
            }
        };
        aggregator.set_num_gradient_bits(view.num_gradient_bits);

        let num_eval = self.engine.num_eval_metrics();
        let limit = (self.config.epoch_size > 0).then_some(self.config.epoch_size);
        let mut seen = 0;
        let mut first = true;

        loop {
            let batch = self.next_batch(seen, limit);
            let mut header = match &batch {
                Some(batch) => self.engine.forward_backward(batch)?.to_header(),
                None => {
                    let (_, mut grads) = self.engine.split_mut();
                    grads.fill_zero();
                    AggregationHeader::new(num_eval)
                }
            };

            let (_, mut grads) = self.engine.split_mut();
            let mut package = grads.package()?;
            let delivered = aggregator.aggregate(&mut package, &mut header, first).await?;
            drop(package);

            let samples = if delivered { header.num_samples } else { 0 };
            if samples > 0 {
                epoch_header.merge(&header)?;
                self.apply(view, epoch_rate, samples)?;
                seen += samples;
            } else if !first {
                break;
            }
            first = false;
        }

        let mut header = AggregationHeader::new(num_eval);
        let (_, mut grads) = self.engine.split_mut();
        let mut package = grads.package()?;
        let delivered = aggregator.flush(&mut package, &mut header).await?;
        drop(package);

        if delivered && header.num_samples > 0 {
            epoch_header.merge(&header)?;
            self.apply(view, epoch_rate, header.num_samples)?;
        }

        debug!(
            rank = self.transport.current_rank(),
            samples = epoch_header.num_samples;
            "aggregated epoch"
        );

        self.aggregator = Some(aggregator);
        Ok(())
    }

    /// Trains locally and synchronizes the parameters every sync block.
    async fn run_periodic(
        &mut self,
        view: &EpochView,
        epoch_rate: f64,
        header: &mut AggregationHeader,
    ) -> Result<()> {
        let ranks = self.transport.rank_count();
        let mut sync = match self.param_sync.take() {
            Some(sync) => sync,
            None => self.create_param_sync(view).await?,
        };

        let interval = view.block_size.div_ceil(ranks).max(1);
        let limit = self.local_limit(ranks);
        let (mut seen, mut since_sync) = (0, 0);

        while let Some(batch) = self.next_batch(seen, limit) {
            let samples = self.local_step(&batch, view, epoch_rate, header)?;
            seen += samples;
            since_sync += samples;

            if since_sync >= interval {
                let (params, _) = self.engine.split_mut();
                sync.synchronize(params, since_sync, false).await?;
                self.engine.refresh_working_copy();
                since_sync = 0;
            }
        }

        loop {
            let (params, _) = self.engine.split_mut();
            let outcome = sync.synchronize(params, since_sync, true).await?;
            self.engine.refresh_working_copy();
            since_sync = 0;
            if outcome.all_finished {
                break;
            }
        }

        self.param_sync = Some(sync);
        Ok(())
    }

    async fn create_param_sync(&mut self, view: &EpochView) -> Result<ParameterSync<T>> {
        let parallel = &self.config.parallel;
        let mut sync = match view.method {
            ParallelizationMethod::BlockMomentum => {
                let mut bm = BlockMomentum::new(
                    self.transport.clone(),
                    view.block_momentum,
                    parallel.block_learning_rate,
                    parallel.use_nesterov_block_momentum,
                );
                if let Some(state) = self.restored_block_momentum.take() {
                    bm.import_state(state, parallel.reset_momentum_on_restart);
                }
                ParameterSync::BlockMomentum(bm)
            }
            _ => ParameterSync::Averaging(ModelAveraging::new(self.transport.clone())),
        };

        let (params, _) = self.engine.split_mut();
        sync.initialize(params).await?;
        self.engine.refresh_working_copy();

        info!(
            method:? = view.method,
            block_size = view.block_size,
            block_momentum = view.block_momentum;
            "created parameter synchronizer"
        );

        Ok(sync)
    }

    /// Trains locally and pushes the progress into the shared store every few samples.
    async fn run_async(
        &mut self,
        view: &EpochView,
        epoch_rate: f64,
        header: &mut AggregationHeader,
    ) -> Result<()> {
        let mut coordinator = match self.coordinator.take() {
            Some(mut coordinator) => {
                coordinator.set_interval(view.n_sync_samples);
                coordinator
            }
            None => self.create_coordinator(view).await?,
        };

        let limit = self.local_limit(self.transport.rank_count());
        let mut seen = 0;

        while let Some(batch) = self.next_batch(seen, limit) {
            let samples = self.local_step(&batch, view, epoch_rate, header)?;
            seen += samples;

            let (params, _) = self.engine.split_mut();
            coordinator.on_samples(params, samples).await?;
            self.engine.refresh_working_copy();
        }

        let (params, _) = self.engine.split_mut();
        coordinator.sync_now(params).await?;
        coordinator.wait_all().await;
        coordinator.pull(params).await?;
        self.engine.refresh_working_copy();

        self.coordinator = Some(coordinator);
        Ok(())
    }

    /// Joins the shared store, which starts from rank 0's parameters.
    async fn create_coordinator(&mut self, view: &EpochView) -> Result<AsyncCoordinator> {
        let ctx = self.async_ctx.clone().ok_or_else(|| {
            SgdErr::InvalidConfig("asynchronous SGD needs a parameter store".into())
        })?;

        let is_main = self.is_main();
        let (params, _) = self.engine.split_mut();
        let local: Vec<f32> = params.iter().flat_map(|p| p.iter().copied()).collect();
        let mut coordinator = AsyncCoordinator::new(ctx, params, view.n_sync_samples).await?;

        if is_main {
            let delta: Vec<f32> = local
                .iter()
                .zip(params.iter().flat_map(|p| p.iter()))
                .map(|(l, s)| l - s)
                .collect();
            coordinator.push(&delta).await?;
        }

        self.transport.barrier().await?;
        coordinator.pull(params).await?;
        self.engine.refresh_working_copy();

        info!(
            rank = self.transport.current_rank(),
            interval = view.n_sync_samples;
            "joined the parameter store"
        );

        Ok(coordinator)
    }

    /// Drops the epoch's model in favour of the previous checkpoint.
    fn roll_back(&mut self, epoch: usize, method: ParallelizationMethod) -> Result<()> {
        if method == ParallelizationMethod::AsyncSgd {
            warn!(epoch = epoch; "the parameter store can't be rolled back, keeping the model");
            return Ok(());
        }

        let record = self
            .checkpoints
            .as_ref()
            .and_then(|m| m.load_latest_before(epoch));
        let Some(record) = record else {
            warn!(epoch = epoch; "no earlier checkpoint to roll back to, keeping the model");
            return Ok(());
        };

        self.restore_model(&record)?;
        info!(epoch = epoch, to = record.epoch; "rolled back to the previous model");
        Ok(())
    }

    /// Records the epoch's validation results, or its training criterion
    /// without a validation set.
    fn track_best(&mut self, epoch: usize, criterion: f64) -> Result<()> {
        if self.validation.is_empty() {
            self.best_epochs.update("criterion", criterion, epoch);
            return Ok(());
        }

        let mut header = AggregationHeader::new(self.engine.num_eval_metrics());
        for batch in &self.validation {
            header.merge(&self.engine.evaluate(batch)?.to_header())?;
        }

        let criterion = header.average_criterion();
        if self.best_epochs.update("criterion", criterion, epoch) {
            debug!(epoch = epoch, criterion = criterion; "new best epoch");
        }
        for (i, error) in header.average_eval_errors().into_iter().enumerate() {
            self.best_epochs
                .update(&format!("eval_error_{i}"), error, epoch);
        }

        info!(epoch = epoch, criterion = criterion; "validated epoch");
        Ok(())
    }

    /// Rank 0 writes the checkpoint, every rank waits for it.
    async fn save_checkpoint(&mut self, epoch: usize, minibatch_size: usize, rate: f64) -> Result<()> {
        if let Some(manager) = &self.checkpoints
            && self.is_main()
        {
            let block_momentum = match &self.param_sync {
                Some(ParameterSync::BlockMomentum(bm)) => Some(bm.export_state()),
                _ => self.restored_block_momentum.clone(),
            };
            let state = self.learning_rate.state();

            let record = CheckpointRecord {
                epoch,
                total_samples_seen: self.total_samples,
                learn_rate_per_sample: state.current.unwrap_or(rate),
                minibatch_size,
                prev_criterion: state.prev_criterion.unwrap_or(f64::MAX),
                iteration: self.iteration.as_ref().map_or(0, |s| s.iteration()),
                parameters: self.engine.parameters().iter().map(|p| p.to_vec()).collect(),
                smoothed_gradients: self.smoothed.clone(),
                smoothed_counts: self.smoothed_counts.clone(),
                learn_rate_state: Some(state.clone()),
                best_epochs: self.best_epochs.clone(),
                block_momentum,
            };

            manager.save(epoch, &record)?;
        }

        Ok(self.transport.barrier().await?)
    }
}

/// Runs one update of every parameter out of the gradients in the engine.
fn apply_update<E: ComputationEngine>(
    engine: &mut E,
    updater: &mut WeightUpdateEngine,
    smoothed: &mut [Vec<f32>],
    smoothed_counts: &mut [f64],
    args: &UpdateArgs,
) -> Result<()> {
    let (params, grads) = engine.split_mut();
    let state = smoothed.iter_mut().zip(smoothed_counts.iter_mut());

    match grads {
        Gradients::Single(grads) => {
            for ((p, g), (s, c)) in params.iter_mut().zip(grads.iter_mut()).zip(state) {
                updater.update(p, g, s, c, args)?;
            }
        }
        Gradients::Half { working, grads } => {
            let weights = params.iter_mut().zip(working.iter_mut());
            for (((p, w), g), (s, c)) in weights.zip(grads.iter()).zip(state) {
                updater.update_mixed(w, p, g, s, c, args)?;
            }
        }
    }

    Ok(())
}

/// Trains on `batches` and returns the resulting criterion on them.
///
/// The parameters, the update state and the noise generator are left as
/// they were.
fn probe<E: ComputationEngine>(
    engine: &mut E,
    updater: &WeightUpdateEngine,
    smoothed: &[Vec<f32>],
    smoothed_counts: &[f64],
    batches: &[E::Batch],
    args: &UpdateArgs,
) -> Result<f64> {
    let snapshot: Vec<Vec<f32>> = engine.parameters().iter().map(|p| p.to_vec()).collect();
    let mut updater = updater.clone();
    let mut smoothed = smoothed.to_vec();
    let mut smoothed_counts = smoothed_counts.to_vec();

    let criterion = train_and_evaluate(
        engine,
        &mut updater,
        &mut smoothed,
        &mut smoothed_counts,
        batches,
        args,
    );

    let (params, _) = engine.split_mut();
    copy_into(params, &snapshot)?;
    engine.refresh_working_copy();
    criterion
}

fn train_and_evaluate<E: ComputationEngine>(
    engine: &mut E,
    updater: &mut WeightUpdateEngine,
    smoothed: &mut [Vec<f32>],
    smoothed_counts: &mut [f64],
    batches: &[E::Batch],
    args: &UpdateArgs,
) -> Result<f64> {
    for batch in batches {
        let stats = engine.forward_backward(batch)?;
        let args = UpdateArgs {
            minibatch_samples: stats.samples,
            ..*args
        };
        apply_update(engine, updater, smoothed, smoothed_counts, &args)?;
    }

    let mut total = AggregationHeader::new(engine.num_eval_metrics());
    for batch in batches {
        total.merge(&engine.evaluate(batch)?.to_header())?;
    }

    Ok(total.average_criterion())
}

fn check_lens(what: &'static str, expected: &[usize], got: &[usize]) -> Result<()> {
    if got.len() != expected.len() {
        return Err(SgdErr::SizeMismatch {
            what,
            got: got.len(),
            expected: expected.len(),
        });
    }

    match got.iter().zip(expected).find(|(g, e)| g != e) {
        Some((&got, &expected)) => Err(SgdErr::SizeMismatch { what, got, expected }),
        None => Ok(()),
    }
}

fn copy_into(params: &mut [DeviceBuffer<f32>], values: &[Vec<f32>]) -> Result<()> {
    if params.len() != values.len() {
        return Err(SgdErr::SizeMismatch {
            what: "parameters",
            got: values.len(),
            expected: params.len(),
        });
    }

    for (p, v) in params.iter_mut().zip(values) {
        if p.len() != v.len() {
            return Err(SgdErr::SizeMismatch {
                what: "parameter buffer",
                got: v.len(),
                expected: p.len(),
            });
        }
        p.copy_from_slice(v);
    }

    Ok(())
}

/// Hands every rank rank 0's `value`.
async fn share_from_main<T: Transport + Sync>(transport: &T, value: f64) -> Result<f64> {
    if transport.rank_count() == 1 {
        return Ok(value);
    }

    let mut buf = [value];
    broadcast_from_root(transport, 0, &mut buf).await?;
    Ok(buf[0])
}

/// Sums the epoch totals of every rank.
async fn reduce_epoch_header<T: Transport + Sync>(
    transport: &T,
    header: &mut AggregationHeader,
) -> Result<()> {
    let mut wire = header.to_wire(header.num_samples > 0, false, 0.);
    transport.all_reduce(&mut wire).await?;
    header.load_wire(&wire);
    Ok(())
}
