mod common;

use std::num::NonZeroUsize;

use comms::LocalCluster;
use common::{Line, Samples, initial_criterion, train_lines, train_ranks};
use sgd::{
    EpochDriver, SgdErr,
    asgd::AsyncContext,
    checkpoint::{CheckpointManager, CheckpointRecord},
    config::{
        CheckpointConfig, LearnRateSearchConfig, ParallelConfig, ParallelizationMethod,
        RateSchedule, Schedule, SgdConfig,
    },
    engine::ComputationEngine,
    gradient::DeviceBuffer,
    learning_rate::LearningRateSearch,
};
use tokio::task::JoinSet;

const SAMPLES: usize = 64;

fn config(method: ParallelizationMethod, epochs: usize) -> SgdConfig {
    SgdConfig {
        max_epochs: epochs,
        minibatch_size: Schedule::constant(8),
        learning_rate: RateSchedule::per_sample(vec![0.05]),
        parallel: ParallelConfig {
            method,
            model_aggregation_block_size: Some(8),
            n_sync_samples_per_worker: Schedule::constant(vec![4]),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn assert_fits_the_line(params: &[f32], tolerance: f32) {
    assert!((params[0] - 2.).abs() < tolerance, "{params:?}");
    assert!((params[1] - 0.5).abs() < tolerance, "{params:?}");
}

fn assert_ranks_agree(results: &[(sgd::TrainingSummary, Vec<f32>)]) {
    let (_, first) = &results[0];
    for (_, params) in results {
        assert_eq!(params, first);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn single_rank_training_fits_the_data() {
    let results = train_ranks(config(ParallelizationMethod::None, 10), 1, SAMPLES, None).await;
    let (summary, params) = &results[0];

    assert_eq!(summary.epochs_run, 10);
    assert!(summary.final_criterion < initial_criterion(SAMPLES) / 10.);
    assert_eq!(summary.final_learn_rate, 0.05);
    assert_fits_the_line(params, 0.05);
}

#[tokio::test(flavor = "multi_thread")]
async fn gradient_aggregation_keeps_ranks_in_lockstep() {
    let config = config(ParallelizationMethod::GradientAggregation, 10);
    let results = train_ranks(config, 2, SAMPLES, None).await;

    assert_ranks_agree(&results);
    for (summary, _) in &results {
        assert_eq!(summary.epochs_run, 10);
        assert!(summary.final_criterion < initial_criterion(SAMPLES) / 10.);
    }
    assert_fits_the_line(&results[0].1, 0.05);
}

#[tokio::test(flavor = "multi_thread")]
async fn buffered_aggregation_applies_every_round() {
    let mut config = config(ParallelizationMethod::GradientAggregation, 10);
    config.parallel.buffered_async_gradient_aggregation = true;

    let results = train_ranks(config, 2, SAMPLES, None).await;

    assert_ranks_agree(&results);
    assert!(results[0].0.final_criterion < initial_criterion(SAMPLES) / 10.);
    assert_fits_the_line(&results[0].1, 0.1);
}

#[tokio::test(flavor = "multi_thread")]
async fn uneven_shards_still_finish_the_epoch() {
    let mut config = config(ParallelizationMethod::GradientAggregation, 3);
    config.minibatch_size = Schedule::constant(3);

    // 3, 3 and 4 samples, one per minibatch
    let results = train_ranks(config, 3, 10, None).await;

    assert_ranks_agree(&results);
    assert!(results.iter().all(|(s, _)| s.epochs_run == 3));
}

#[tokio::test(flavor = "multi_thread")]
async fn ranks_out_of_data_add_nothing_to_the_epoch_totals() {
    let mut config = config(ParallelizationMethod::GradientAggregation, 1);
    config.minibatch_size = Schedule::constant(3);
    config.learning_rate = RateSchedule::per_sample(vec![0.]);

    // only the last rank has a fourth minibatch
    let results = train_ranks(config, 3, 10, None).await;

    for (summary, params) in &results {
        assert_eq!(summary.total_samples, 10);
        assert!((summary.final_criterion - initial_criterion(10)).abs() < 1e-9);
        assert_eq!(params, &[0., 0.]);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn half_precision_gradients_train_the_master_weights() {
    let mut config = config(ParallelizationMethod::GradientAggregation, 10);
    config.mixed_precision_loss_scale = 128.;

    let results = train_lines(config, 2, SAMPLES, None, || Line::half(128.)).await;

    assert_ranks_agree(&results);
    assert_eq!(results[0].0.total_samples, 10 * SAMPLES as u64);
    assert!(results[0].0.final_criterion < initial_criterion(SAMPLES) / 10.);
    assert_fits_the_line(&results[0].1, 0.05);
}

#[tokio::test(flavor = "multi_thread")]
async fn half_precision_working_copy_follows_model_averaging() {
    let mut config = config(ParallelizationMethod::ModelAveraging, 10);
    config.mixed_precision_loss_scale = 64.;

    let results = train_lines(config, 2, SAMPLES, None, || Line::half(64.)).await;

    assert_ranks_agree(&results);
    assert_fits_the_line(&results[0].1, 0.05);
}

#[tokio::test(flavor = "multi_thread")]
async fn model_averaging_ends_every_epoch_in_agreement() {
    let config = config(ParallelizationMethod::ModelAveraging, 10);
    let results = train_ranks(config, 2, SAMPLES, None).await;

    assert_ranks_agree(&results);
    assert!(results[0].0.final_criterion < initial_criterion(SAMPLES) / 10.);
    assert_fits_the_line(&results[0].1, 0.05);
}

#[tokio::test(flavor = "multi_thread")]
async fn block_momentum_ends_every_epoch_in_agreement() {
    let config = config(ParallelizationMethod::BlockMomentum, 10);
    let results = train_ranks(config, 2, SAMPLES, None).await;

    assert_ranks_agree(&results);
    assert!(results[0].0.final_criterion < initial_criterion(SAMPLES) / 10.);
}

#[tokio::test(flavor = "multi_thread")]
async fn async_sgd_pulls_the_same_model_everywhere() {
    let ranks = 2;
    let store = AsyncContext::new(
        &[DeviceBuffer::zeros(2)],
        ranks,
        NonZeroUsize::new(1).unwrap(),
    );

    let config = config(ParallelizationMethod::AsyncSgd, 10);
    let results = train_ranks(config, ranks, SAMPLES, Some(store.clone())).await;

    assert_ranks_agree(&results);
    assert!(results[0].0.final_criterion < initial_criterion(SAMPLES) / 10.);
    assert!(store.updates() > 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn async_sgd_needs_a_store() {
    let transport = LocalCluster::new(1).remove(0);
    let config = config(ParallelizationMethod::AsyncSgd, 1);
    let mut driver = EpochDriver::new(config, transport, Line::new(), Samples::line(8)).unwrap();

    assert!(matches!(driver.train().await, Err(SgdErr::InvalidConfig(_))));
}

#[test]
fn invalid_configs_are_rejected_before_training() {
    let transport = LocalCluster::new(1).remove(0);
    let config = config(ParallelizationMethod::None, 0);

    let driver = EpochDriver::new(config, transport, Line::new(), Samples::line(8));
    assert!(matches!(driver, Err(SgdErr::InvalidConfig(_))));
}

#[tokio::test(flavor = "multi_thread")]
async fn learning_rate_search_never_exceeds_the_curve() {
    let mut config = config(ParallelizationMethod::None, 3);
    config.learning_rate_search = LearnRateSearchConfig {
        algorithm: LearningRateSearch::SearchBeforeEpoch,
        num_best_search_epoch: 2,
        search_samples: 16,
        ..Default::default()
    };

    let transport = LocalCluster::new(1).remove(0);
    let mut driver = EpochDriver::new(config, transport, Line::new(), Samples::line(SAMPLES)).unwrap();
    let summary = driver.train().await.unwrap();

    let rate = driver.learn_rate().unwrap();
    assert!(rate > 0. && rate <= 0.05);
    assert!(summary.final_criterion < initial_criterion(SAMPLES));
}

fn checkpointed(dir: &std::path::Path, epochs: usize) -> SgdConfig {
    SgdConfig {
        checkpoint: CheckpointConfig {
            dir: Some(dir.to_path_buf()),
            ..Default::default()
        },
        ..config(ParallelizationMethod::None, epochs)
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn training_resumes_from_the_latest_checkpoint() {
    let dir = tempfile::tempdir().unwrap();

    let results = train_ranks(checkpointed(dir.path(), 2), 1, SAMPLES, None).await;
    let trained = results[0].1.clone();
    assert!(dir.path().join("model.1.ckp").exists());
    assert!(!dir.path().join("model.0.ckp").exists());

    // nothing left to train, the model comes back from disk
    let transport = LocalCluster::new(1).remove(0);
    let config = checkpointed(dir.path(), 2);
    let mut driver = EpochDriver::new(config, transport, Line::new(), Samples::line(SAMPLES)).unwrap();
    let summary = driver.train().await.unwrap();
    assert_eq!(summary.epochs_run, 0);
    assert_eq!(driver.engine().parameters()[0].to_vec(), trained);

    let results = train_ranks(checkpointed(dir.path(), 3), 1, SAMPLES, None).await;
    assert_eq!(results[0].0.epochs_run, 1);
    assert!(dir.path().join("model.2.ckp").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn only_the_main_rank_writes_checkpoints() {
    let dirs = [tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap()];
    let mut tasks = JoinSet::new();

    for (transport, dir) in LocalCluster::new(2).into_iter().zip(&dirs) {
        let config = config(ParallelizationMethod::GradientAggregation, 1);
        let manager = CheckpointManager::new(dir.path(), "model", true);

        tasks.spawn(async move {
            let mut driver = EpochDriver::new(config, transport, Line::new(), Samples::line(16))
                .unwrap()
                .with_checkpoints(manager);
            driver.train().await.unwrap();
            driver.is_main()
        });
    }

    let mains = tasks.join_all().await;
    assert_eq!(mains.iter().filter(|&&m| m).count(), 1);
    assert!(dirs[0].path().join("model.0.ckp").exists());
    assert!(!dirs[1].path().join("model.0.ckp").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn resumed_adjustment_compares_with_the_checkpointed_criterion() {
    let dir = tempfile::tempdir().unwrap();
    let manager = CheckpointManager::new(dir.path(), "model", true);

    // a diverged epoch, saved without the controller's state
    let record = CheckpointRecord {
        epoch: 0,
        learn_rate_per_sample: 0.05,
        minibatch_size: 8,
        prev_criterion: f64::NAN,
        parameters: vec![vec![0.; 2]],
        smoothed_gradients: vec![vec![0.; 2]],
        smoothed_counts: vec![0.],
        ..Default::default()
    };
    manager.save(0, &record).unwrap();

    let mut config = checkpointed(dir.path(), 2);
    config.learning_rate_search = LearnRateSearchConfig {
        algorithm: LearningRateSearch::AdjustAfterEpoch,
        increase_learn_rate_if_improve_more_than: Some(0.1),
        load_best_model: false,
        ..Default::default()
    };

    let results = train_ranks(config, 1, SAMPLES, None).await;
    let summary = &results[0].0;

    assert_eq!(summary.epochs_run, 1);
    assert!((summary.final_learn_rate - 0.05 * 1.382).abs() < 1e-12);
}

#[tokio::test(flavor = "multi_thread")]
async fn regressing_epoch_is_rolled_back_with_a_smaller_rate() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = checkpointed(dir.path(), 2);
    config.checkpoint.keep_checkpoint_files = true;
    config.learning_rate = RateSchedule::per_sample(vec![5.0]);
    config.learning_rate_search = LearnRateSearchConfig {
        algorithm: LearningRateSearch::AdjustAfterEpoch,
        load_best_model: true,
        ..Default::default()
    };

    let transport = LocalCluster::new(1).remove(0);
    let mut driver = EpochDriver::new(config, transport, Line::new(), Samples::line(SAMPLES)).unwrap();
    let summary = driver.train().await.unwrap();

    assert!((summary.final_learn_rate - 5.0 * 0.618).abs() < 1e-9);

    let manager = CheckpointManager::new(dir.path(), "model", true);
    let first = manager.try_load(0).unwrap().unwrap();
    assert_eq!(driver.engine().parameters()[0].to_vec(), first.parameters[0]);
}
