//! Orchestration core of a distributed minibatch SGD trainer.
//!
//! The `EpochDriver` composes the learning rate and minibatch size controllers,
//! the parallelization strategy selected for each epoch (gradient aggregation,
//! model averaging, block momentum or asynchronous SGD), the weight update
//! engine and the checkpoint manager.

pub mod aggregation;
pub mod asgd;
pub mod checkpoint;
pub mod config;
mod distributed;
pub mod driver;
pub mod engine;
mod error;
pub mod gradient;
pub mod header;
pub mod learning_rate;
pub mod minibatch;
pub mod sync;
pub mod update;

pub use distributed::Distributed;
pub use driver::{EpochDriver, TrainingSummary};
pub use error::{Result, SgdErr};
