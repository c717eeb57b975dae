use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::{Result, checkpoint::bits, config::LearnRateSearchConfig};

/// How the learning rate of an epoch is chosen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearningRateSearch {
    /// The configured curve, verbatim.
    #[default]
    None,
    /// Probe candidate rates on a held-out slice before the epoch.
    SearchBeforeEpoch,
    /// Scale the rate after the epoch depending on how much the criterion improved.
    AdjustAfterEpoch,
}

/// What `after_epoch` did to the rate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Adjustment {
    Kept,
    Increased,
    Decreased {
        /// The criterion got worse (or NaN), the epoch's model should be dropped.
        regressed: bool,
    },
}

/// A rate that was reduced, and when.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reduction {
    pub epoch: usize,
    #[serde(with = "bits::exact")]
    pub rate: f64,
}

/// Everything the controller needs to resume after a restart.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LearnRateState {
    #[serde(with = "bits::exact_opt")]
    pub current: Option<f64>,
    #[serde(with = "bits::exact_opt")]
    pub prev_criterion: Option<f64>,
    pub reductions: Vec<Reduction>,
    #[serde(with = "bits::exact_vec")]
    pub recent_rates: Vec<f64>,
    pub searched_epochs: usize,
    pub search_exhausted: bool,
}

/// Chooses the per-sample learning rate epoch after epoch.
#[derive(Debug, Clone)]
pub struct LearningRateController {
    config: LearnRateSearchConfig,
    state: LearnRateState,
}

impl LearningRateController {
    pub fn new(config: LearnRateSearchConfig) -> Self {
        Self {
            config,
            state: LearnRateState::default(),
        }
    }

    pub fn mode(&self) -> LearningRateSearch {
        self.config.algorithm
    }

    /// Returns the rate currently in effect.
    pub fn current(&self) -> Option<f64> {
        self.state.current
    }

    pub fn search_exhausted(&self) -> bool {
        self.state.search_exhausted
    }

    pub fn state(&self) -> &LearnRateState {
        &self.state
    }

    pub fn restore(&mut self, state: LearnRateState) {
        self.state = state;
    }

    /// Picks the rate of an epoch.
    ///
    /// # Arguments
    /// * `epoch` - The epoch about to start.
    /// * `curve_rate` - The configured per-sample rate of this epoch.
    /// * `probe` - Trains a copy of the model on a fixed slice at the given rate
    ///   and returns the criterion, only called while searching.
    ///
    /// # Returns
    /// The per-sample rate to train `epoch` with.
    pub fn rate_for_epoch<F>(&mut self, epoch: usize, curve_rate: f64, probe: F) -> Result<f64>
    where
        F: FnMut(f64) -> Result<f64>,
    {
        let rate = match self.config.algorithm {
            LearningRateSearch::None => curve_rate,
            LearningRateSearch::AdjustAfterEpoch => self.state.current.unwrap_or(curve_rate),
            LearningRateSearch::SearchBeforeEpoch if self.state.search_exhausted => {
                self.state.current.unwrap_or(curve_rate)
            }
            LearningRateSearch::SearchBeforeEpoch => {
                let rate = self.search(curve_rate, probe)?;

                self.state.searched_epochs += 1;
                if self.state.searched_epochs >= self.config.num_best_search_epoch {
                    self.state.search_exhausted = true;
                    info!(epoch = epoch, rate = rate; "learning rate search exhausted, keeping the last rate");
                }

                rate
            }
        };

        let rate = match self.config.algorithm {
            LearningRateSearch::None => rate,
            _ => rate.max(self.config.min_learn_rate),
        };
        self.state.current = Some(rate);
        self.state.recent_rates.push(rate);
        let excess = self
            .state
            .recent_rates
            .len()
            .saturating_sub(self.config.num_prev_learn_rates);
        self.state.recent_rates.drain(..excess);

        Ok(rate)
    }

    /// Geometric descent from the largest recent rate while the criterion
    /// improves, followed by one refinement between the best rate and the next
    /// smaller one.
    fn search<F>(&self, curve_rate: f64, mut probe: F) -> Result<f64>
    where
        F: FnMut(f64) -> Result<f64>,
    {
        let dec = self.config.learn_rate_decrease_factor;
        let floor = self.config.min_learn_rate;
        let budget = self.config.max_iter;

        let start = self
            .state
            .recent_rates
            .iter()
            .copied()
            .fold(curve_rate, f64::max);

        let mut best_rate = start;
        let mut best = probe(start)?;
        let mut probes = 1;
        debug!(rate = start, criterion = best; "probed learning rate");

        while probes < budget {
            let next = (best_rate * dec).max(floor);
            if next >= best_rate {
                break;
            }

            let criterion = probe(next)?;
            probes += 1;
            debug!(rate = next, criterion = criterion; "probed learning rate");

            if !improves(criterion, best) {
                break;
            }
            best = criterion;
            best_rate = next;
        }

        if probes < budget {
            let mid = (best_rate * dec.sqrt()).max(floor);
            if mid < best_rate {
                let criterion = probe(mid)?;
                debug!(rate = mid, criterion = criterion; "probed learning rate");
                if improves(criterion, best) {
                    best_rate = mid;
                }
            }
        }

        Ok(best_rate)
    }

    /// Adjusts the rate after `epoch` finished with `criterion`.
    ///
    /// Does nothing unless the controller runs in `AdjustAfterEpoch` mode and
    /// `epoch` falls on the adjustment interval.
    ///
    /// # Arguments
    /// * `epoch` - The epoch that just finished.
    /// * `criterion` - Its average training criterion.
    ///
    /// # Returns
    /// What happened to the rate.
    pub fn after_epoch(&mut self, epoch: usize, criterion: f64) -> Adjustment {
        if self.config.algorithm != LearningRateSearch::AdjustAfterEpoch {
            self.state.prev_criterion = Some(criterion);
            return Adjustment::Kept;
        }

        let window = self.config.num_prev_learn_rates;
        self.state
            .reductions
            .retain(|r| epoch.saturating_sub(r.epoch) < window);

        let Some(prev) = self.state.prev_criterion else {
            self.state.prev_criterion = Some(criterion);
            return Adjustment::Kept;
        };

        if (epoch + 1) % self.config.learn_rate_adjust_interval != 0 {
            return Adjustment::Kept;
        }

        let Some(rate) = self.state.current else {
            self.state.prev_criterion = Some(criterion);
            return Adjustment::Kept;
        };

        let regressed = criterion.is_nan() || criterion > prev;
        let improvement = if !prev.is_finite() {
            f64::INFINITY
        } else if prev == 0. {
            prev - criterion
        } else {
            (prev - criterion) / prev.abs()
        };

        let adjustment = if regressed
            || improvement < self.config.reduce_learn_rate_if_improve_less_than
        {
            let reduced = (rate * self.config.learn_rate_decrease_factor)
                .max(self.config.min_learn_rate);
            self.state.reductions.push(Reduction { epoch, rate });
            self.state.current = Some(reduced);
            info!(epoch = epoch, from = rate, to = reduced, regressed = regressed; "reduced learning rate");
            Adjustment::Decreased { regressed }
        } else if self
            .config
            .increase_learn_rate_if_improve_more_than
            .is_some_and(|threshold| improvement > threshold)
        {
            let ceiling = self
                .state
                .reductions
                .iter()
                .map(|r| r.rate)
                .fold(f64::INFINITY, f64::min);
            let increased = (rate * self.config.learn_rate_increase_factor).min(ceiling);
            self.state.reductions.clear();

            if increased > rate {
                self.state.current = Some(increased);
                info!(epoch = epoch, from = rate, to = increased; "increased learning rate");
                Adjustment::Increased
            } else {
                Adjustment::Kept
            }
        } else {
            self.state.reductions.clear();
            Adjustment::Kept
        };

        if !(regressed && self.config.load_best_model) {
            self.state.prev_criterion = Some(criterion);
        }

        adjustment
    }
}

/// NaN never improves on anything, anything improves on NaN.
fn improves(criterion: f64, best: f64) -> bool {
    !criterion.is_nan() && (best.is_nan() || criterion < best)
}
