use std::{env, fs, io};

use log::info;
use node::config::NodeConfig;

#[tokio::main]
async fn main() -> io::Result<()> {
    env_logger::init();

    let path = env::args().nth(1).ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "usage: node <config.json>")
    })?;
    let config: NodeConfig = serde_json::from_str(&fs::read_to_string(&path)?)?;
    info!("loaded configuration from {path}");

    let summaries = node::run(config).await?;
    if let Some(summary) = summaries.first() {
        info!(
            epochs = summary.epochs_run,
            criterion = summary.final_criterion,
            rate = summary.final_learn_rate;
            "training finished"
        );

        for (metric, best) in summary.best_epochs.iter() {
            info!(
                metric = metric,
                value = best.criterion_min_value,
                epoch:? = best.epoch_index;
                "best epoch"
            );
        }
    }

    Ok(())
}
