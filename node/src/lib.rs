//! Trains a synthetic linear regression on a cluster of in-process ranks.

pub mod config;
pub mod data;
pub mod linear;

use std::{io, num::NonZeroUsize, sync::Arc};

use comms::{LocalCluster, Transport};
use log::info;
use sgd::{
    EpochDriver, SgdErr, TrainingSummary, asgd::AsyncContext,
    config::ParallelizationMethod, engine::ComputationEngine,
};
use tokio::task::JoinSet;

use crate::{
    config::NodeConfig,
    data::{DataLoader, InMemoryDataset},
    linear::LinearRegression,
};

/// Trains every rank to completion.
///
/// # Returns
/// Every rank's summary ordered by rank, or the first error any rank hit.
pub async fn run(config: NodeConfig) -> io::Result<Vec<TrainingSummary>> {
    config.validate()?;

    let seed = config.sgd.seed;
    let dataset = Arc::new(InMemoryDataset::synthetic(
        config.samples,
        config.slope,
        config.intercept,
        config.noise_std,
        seed,
    )?);
    let validation = InMemoryDataset::synthetic(
        config.validation_samples,
        config.slope,
        config.intercept,
        config.noise_std,
        seed.wrapping_add(1),
    )?;
    let validation_batches = validation.batches(config.validation_samples.max(1));

    let store = match config.sgd.parallel.method {
        ParallelizationMethod::AsyncSgd => {
            let initial = LinearRegression::new(config.init_std, seed)?;
            let shard_size = NonZeroUsize::new(config.store_shard_size).ok_or_else(|| {
                SgdErr::InvalidConfig("the store shard size must be positive".into())
            })?;
            Some(AsyncContext::new(initial.parameters(), config.ranks, shard_size))
        }
        _ => None,
    };

    info!(
        ranks = config.ranks,
        samples = config.samples,
        method:? = config.sgd.parallel.method;
        "starting training"
    );

    let mut tasks = JoinSet::new();
    for transport in LocalCluster::new(config.ranks) {
        let sgd = config.sgd.clone();
        let engine = LinearRegression::new(config.init_std, seed)?;
        let loader = DataLoader::new(Arc::clone(&dataset), seed);
        let validation = validation_batches.clone();
        let store = store.clone();

        tasks.spawn(async move {
            let rank = transport.current_rank();
            let mut driver =
                EpochDriver::new(sgd, transport, engine, loader)?.with_validation(validation);
            if let Some(ctx) = store {
                driver = driver.with_parameter_server(ctx);
            }

            let summary = driver.train().await?;
            let (w, b) = driver.engine().line();
            info!(rank = rank, w = w, b = b; "rank finished");

            Ok::<_, SgdErr>((rank, summary))
        });
    }

    let mut summaries = Vec::with_capacity(config.ranks);
    while let Some(res) = tasks.join_next().await {
        summaries.push(res.map_err(io::Error::other)??);
    }

    summaries.sort_by_key(|(rank, _)| *rank);
    Ok(summaries.into_iter().map(|(_, s)| s).collect())
}
