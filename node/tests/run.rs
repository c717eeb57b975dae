use node::config::NodeConfig;
use sgd::config::{
    CheckpointConfig, ParallelConfig, ParallelizationMethod, RateSchedule, Schedule, SgdConfig,
};

fn config(method: ParallelizationMethod, ranks: usize) -> NodeConfig {
    NodeConfig {
        ranks,
        samples: 512,
        validation_samples: 128,
        noise_std: 0.,
        sgd: SgdConfig {
            max_epochs: 4,
            minibatch_size: Schedule::constant(32),
            learning_rate: RateSchedule::per_sample(vec![0.02]),
            parallel: ParallelConfig {
                method,
                model_aggregation_block_size: Some(128),
                n_sync_samples_per_worker: Schedule::constant(vec![32]),
                ..Default::default()
            },
            ..Default::default()
        },
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn every_method_trains_every_rank() {
    let methods = [
        ParallelizationMethod::None,
        ParallelizationMethod::GradientAggregation,
        ParallelizationMethod::ModelAveraging,
        ParallelizationMethod::BlockMomentum,
        ParallelizationMethod::AsyncSgd,
    ];

    for method in methods {
        let summaries = node::run(config(method, 3)).await.unwrap();

        assert_eq!(summaries.len(), 3, "{method:?}");
        for summary in &summaries {
            assert_eq!(summary.epochs_run, 4, "{method:?}");
            assert!(summary.final_criterion.is_finite(), "{method:?}");
            assert_eq!(summary, &summaries[0], "{method:?}");
        }

        let best = summaries[0].best_epochs.get("criterion").unwrap();
        assert!(best.epoch_index.is_some(), "{method:?}");
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn checkpoints_land_in_the_configured_dir() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(ParallelizationMethod::GradientAggregation, 2);
    cfg.sgd.checkpoint = CheckpointConfig {
        dir: Some(dir.path().to_path_buf()),
        model_name: "line".into(),
        keep_checkpoint_files: true,
    };

    node::run(cfg.clone()).await.unwrap();
    for epoch in 0..4 {
        assert!(dir.path().join(format!("line.{epoch}.ckp")).exists());
    }

    // a second run resumes after the last epoch
    let summaries = node::run(cfg).await.unwrap();
    assert!(summaries.iter().all(|s| s.epochs_run == 0));
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_configs_fail_the_run() {
    let mut cfg = config(ParallelizationMethod::ModelParallel, 2);
    assert!(node::run(cfg.clone()).await.is_err());

    cfg.sgd.parallel.method = ParallelizationMethod::None;
    cfg.ranks = 0;
    assert!(node::run(cfg).await.is_err());
}
