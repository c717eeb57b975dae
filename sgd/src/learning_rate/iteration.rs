use serde::{Deserialize, Serialize};

use crate::{Result, SgdErr};

/// The shape of a per-iteration learning rate decay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustType {
    /// Constant `base`.
    #[default]
    None,
    /// `base * (1 - iter / max_iter) ^ power`
    Poly,
    /// `base * (1 + gamma * iter) ^ -power`
    Inv,
    /// `base * gamma ^ iter`
    Exp,
    /// `base * gamma ^ floor(iter / step)`
    Step,
}

/// Per-minibatch learning rate policy, overriding the epoch curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IterationPolicy {
    pub adjust_type: AdjustType,
    /// Per sample.
    pub base: f64,
    pub gamma: f64,
    pub power: f64,
    pub step: usize,
    /// Training stops once this many minibatches were processed.
    pub max_iter: usize,
}

impl Default for IterationPolicy {
    fn default() -> Self {
        Self {
            adjust_type: AdjustType::None,
            base: 0.01,
            gamma: 1.,
            power: 1.,
            step: 1,
            max_iter: usize::MAX,
        }
    }
}

impl IterationPolicy {
    pub fn validate(&self) -> Result<()> {
        let ok = self.base > 0.
            && self.max_iter > 0
            && match self.adjust_type {
                AdjustType::None => true,
                AdjustType::Poly => self.power >= 0. && self.max_iter < usize::MAX,
                AdjustType::Inv => self.gamma >= 0. && self.power >= 0.,
                AdjustType::Exp => self.gamma > 0.,
                AdjustType::Step => self.gamma > 0. && self.step > 0,
            };

        if !ok {
            return Err(SgdErr::InvalidConfig(format!(
                "invalid {:?} iteration policy",
                self.adjust_type
            )));
        }

        Ok(())
    }

    /// Returns the per-sample learning rate at iteration `iter`.
    pub fn rate_at(&self, iter: usize) -> f64 {
        let i = iter as f64;
        match self.adjust_type {
            AdjustType::None => self.base,
            AdjustType::Poly => {
                let progress = (i / self.max_iter as f64).min(1.);
                self.base * (1. - progress).powf(self.power)
            }
            AdjustType::Inv => self.base * (1. + self.gamma * i).powf(-self.power),
            AdjustType::Exp => self.base * self.gamma.powf(i),
            AdjustType::Step => self.base * self.gamma.powi((iter / self.step) as i32),
        }
    }
}

/// Walks an `IterationPolicy` one minibatch at a time.
#[derive(Debug, Clone, PartialEq)]
pub struct IterationSchedule {
    policy: IterationPolicy,
    iter: usize,
}

impl IterationSchedule {
    pub fn new(policy: IterationPolicy) -> Self {
        Self { policy, iter: 0 }
    }

    /// Resumes the schedule at `iter`, used when restoring a checkpoint.
    pub fn resume(policy: IterationPolicy, iter: usize) -> Self {
        Self { policy, iter }
    }

    /// Returns the rate of the current iteration and moves to the next one.
    pub fn advance(&mut self) -> f64 {
        let rate = self.policy.rate_at(self.iter);
        self.iter = self.iter.saturating_add(1);
        rate
    }

    pub fn iteration(&self) -> usize {
        self.iter
    }

    /// Returns `true` once `max_iter` minibatches were processed.
    pub fn reach_max_iter(&self) -> bool {
        self.iter >= self.policy.max_iter
    }
}
