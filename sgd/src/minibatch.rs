use log::{debug, info};

use crate::{Result, SgdErr, config::MinibatchTuningConfig};

/// Returns the candidate sizes of a search: doubling from `min`, always ending at `max`.
pub fn candidates(min: usize, max: usize) -> Vec<usize> {
    let mut sizes = Vec::new();
    let mut size = min;

    while size < max {
        sizes.push(size);
        size = size.saturating_mul(2);
    }
    sizes.push(max);

    sizes
}

/// Picks the largest minibatch size whose criterion doesn't regress past the smallest one's.
///
/// Candidates are probed from the smallest up and the search stops at the
/// first regression. A NaN criterion counts as a regression.
///
/// # Arguments
/// * `min` - The smallest size, also the baseline.
/// * `max` - The largest size.
/// * `tolerance` - The accepted relative regression from the baseline.
/// * `probe` - Trains a copy of the model on a fixed slice at the given size
///   and returns the criterion.
///
/// # Returns
/// A size in `[min, max]`, or `min` if every larger candidate regresses.
pub fn search_best<F>(min: usize, max: usize, tolerance: f64, mut probe: F) -> Result<usize>
where
    F: FnMut(usize) -> Result<f64>,
{
    if min == 0 || min > max {
        return Err(SgdErr::InvalidConfig(format!(
            "invalid minibatch search bounds [{min}, {max}]"
        )));
    }

    let baseline = probe(min)?;
    debug!(size = min, criterion = baseline; "probed minibatch size");

    let limit = baseline + tolerance * baseline.abs();
    let mut best = min;

    for size in candidates(min, max).into_iter().skip(1) {
        let criterion = probe(size)?;
        debug!(size = size, criterion = criterion; "probed minibatch size");

        // NaN fails the comparison
        if !(criterion <= limit) {
            break;
        }
        best = size;
    }

    Ok(best.clamp(min, max))
}

/// Chooses the minibatch size of every epoch, searching it every few epochs.
#[derive(Debug, Clone)]
pub struct MinibatchSizeController {
    config: MinibatchTuningConfig,
    chosen: Option<usize>,
}

impl MinibatchSizeController {
    pub fn new(config: MinibatchTuningConfig) -> Self {
        Self {
            config,
            chosen: None,
        }
    }

    /// Returns `true` if the size is searched before `epoch`.
    pub fn should_tune(&self, epoch: usize) -> bool {
        self.config.frequency > 0 && epoch % self.config.frequency == 0
    }

    /// Returns the last searched size.
    pub fn chosen(&self) -> Option<usize> {
        self.chosen
    }

    /// Restores the size found before a restart.
    pub fn restore(&mut self, chosen: Option<usize>) {
        self.chosen = chosen;
    }

    /// Returns the minibatch size of `epoch`.
    ///
    /// # Arguments
    /// * `epoch` - The epoch about to start.
    /// * `configured` - The scheduled size, also the lower bound if none is configured.
    /// * `probe` - Forwarded to `search_best` on tuning epochs.
    ///
    /// # Returns
    /// The searched size on tuning epochs, the last searched one otherwise, or
    /// `configured` if there never was a search.
    pub fn size_for_epoch<F>(&mut self, epoch: usize, configured: usize, probe: F) -> Result<usize>
    where
        F: FnMut(usize) -> Result<f64>,
    {
        if !self.should_tune(epoch) {
            return Ok(self.chosen.unwrap_or(configured));
        }

        let min = self.config.min.unwrap_or(configured);
        let max = self.config.max.max(min);
        let size = search_best(min, max, self.config.error_margin, probe)?;

        info!(epoch = epoch, size = size; "tuned minibatch size");
        self.chosen = Some(size);
        Ok(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidates_double_up_to_max() {
        assert_eq!(candidates(64, 512), [64, 128, 256, 512]);
        assert_eq!(candidates(64, 300), [64, 128, 256, 300]);
        assert_eq!(candidates(64, 64), [64]);
    }

    #[test]
    fn picks_the_largest_size_within_tolerance() {
        let size = search_best(64, 1024, 0.05, |mb| {
            Ok(match mb {
                64 => 1.0,
                128 => 1.01,
                256 => 1.04,
                _ => 2.0,
            })
        })
        .unwrap();

        assert_eq!(size, 256);
    }

    #[test]
    fn returns_min_when_everything_regresses() {
        let size = search_best(32, 4096, 0.01, |mb| Ok(mb as f64)).unwrap();
        assert_eq!(size, 32);

        let size = search_best(32, 4096, 0.01, |mb| Ok(if mb == 32 { 1. } else { f64::NAN }))
            .unwrap();
        assert_eq!(size, 32);
    }

    #[test]
    fn result_stays_within_bounds() {
        for max in [40, 100, 1000] {
            let size = search_best(40, max, 10., |_| Ok(0.5)).unwrap();
            assert!((40..=max).contains(&size));
            assert_eq!(size, max);
        }
    }

    #[test]
    fn invalid_bounds_are_rejected() {
        assert!(search_best(0, 10, 0., |_| Ok(0.)).is_err());
        assert!(search_best(20, 10, 0., |_| Ok(0.)).is_err());
    }

    #[test]
    fn only_tunes_on_frequency_epochs() {
        let mut c = MinibatchSizeController::new(MinibatchTuningConfig {
            frequency: 2,
            min: Some(16),
            max: 64,
            error_margin: 0.,
            ..Default::default()
        });

        assert_eq!(c.size_for_epoch(0, 16, |_| Ok(1.)).unwrap(), 64);
        let size = c
            .size_for_epoch(1, 16, |_| unreachable!("not a tuning epoch"))
            .unwrap();
        assert_eq!(size, 64);
        assert!(c.should_tune(2));
    }

    #[test]
    fn disabled_tuning_keeps_the_schedule() {
        let mut c = MinibatchSizeController::new(MinibatchTuningConfig::default());
        assert_eq!(c.size_for_epoch(0, 256, |_| unreachable!()).unwrap(), 256);
    }
}
