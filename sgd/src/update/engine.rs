use half::f16;
use log::debug;
use rand::{Rng, SeedableRng, rngs::StdRng};
use rand_distr::Normal;

use super::{ClippingMode, GradientUpdateConfig, GradientUpdateType, clip};
use crate::{Result, SgdErr, config::SgdConfig};

const FLOOR: f32 = 1e-16;

/// Per-minibatch inputs of a weight update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UpdateArgs {
    pub learn_rate_per_sample: f64,
    pub momentum_per_sample: f64,
    /// Samples the gradient was summed over.
    pub minibatch_samples: usize,
    pub l1: f64,
    pub l2: f64,
    /// Keep the step size comparable across ranks that processed different amounts of samples.
    pub need_average_multiplier: bool,
    pub use_nesterov: bool,
    pub disable_unit_gain: bool,
}

impl UpdateArgs {
    fn minibatch_momentum(&self) -> f32 {
        if self.momentum_per_sample == 0. {
            0.
        } else {
            self.momentum_per_sample.powf(self.minibatch_samples as f64) as f32
        }
    }

    fn unit_gain(&self, momentum: f32) -> f32 {
        if self.disable_unit_gain { 1. } else { 1. - momentum }
    }
}

/// Applies an update rule, clipping, regularization and loss scaling to one parameter at a time.
#[derive(Debug, Clone)]
pub struct WeightUpdateEngine {
    rule: GradientUpdateConfig,
    clipping_threshold_per_sample: Option<f64>,
    clipping_mode: ClippingMode,
    noise: Option<Normal<f32>>,
    loss_scale: f32,
    rng: StdRng,
}

impl WeightUpdateEngine {
    /// Creates a new `WeightUpdateEngine`.
    ///
    /// # Arguments
    /// * `rule` - The update rule and its hyper-parameters.
    /// * `clipping_threshold_per_sample` - Gradients are clipped to this times the minibatch size.
    /// * `clipping_mode` - Whether elements or the norm get clipped.
    /// * `noise_std` - Standard deviation of the gaussian noise added to gradients, `0` disables it.
    /// * `loss_scale` - The static factor the loss was multiplied by before a half precision backward pass.
    /// * `seed` - Seed of the noise generator, equal on every rank so they stay in lockstep.
    ///
    /// # Returns
    /// A new `WeightUpdateEngine`, or an error if `noise_std` is not a valid deviation.
    pub fn new(
        rule: GradientUpdateConfig,
        clipping_threshold_per_sample: Option<f64>,
        clipping_mode: ClippingMode,
        noise_std: f64,
        loss_scale: f64,
        seed: u64,
    ) -> Result<Self> {
        let noise = if noise_std > 0. {
            let dist = Normal::new(0., noise_std as f32)
                .map_err(|e| SgdErr::InvalidConfig(format!("gradient noise: {e}")))?;
            Some(dist)
        } else {
            None
        };

        Ok(Self {
            rule,
            clipping_threshold_per_sample,
            clipping_mode,
            noise,
            loss_scale: loss_scale as f32,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    /// Builds the engine described by a trainer configuration.
    pub fn from_config(config: &SgdConfig) -> Result<Self> {
        Self::new(
            config.gradient_update,
            config.clipping_threshold_per_sample,
            config.clipping_mode,
            config.gaussian_noise_inject_std,
            config.mixed_precision_loss_scale,
            config.seed,
        )
    }

    pub fn rule(&self) -> &GradientUpdateConfig {
        &self.rule
    }

    /// Returns the length of the smoothed state a parameter of `n` elements needs.
    pub fn state_len(&self, n: usize) -> usize {
        self.rule.state_len(n)
    }

    /// Updates `params` in place out of the gradient `grad`.
    ///
    /// `grad` is used as scratch space and holds the rescaled gradient afterwards.
    ///
    /// # Arguments
    /// * `params` - The parameter values.
    /// * `grad` - The local or aggregated gradient, summed over the minibatch.
    /// * `smoothed` - The rule's smoothed state, `state_len(params.len())` elements.
    /// * `smoothed_count` - The rule's smoothed sample count.
    /// * `args` - The minibatch's rates and options.
    ///
    /// # Returns
    /// A `SizeMismatch` error if the buffers don't match `params`.
    pub fn update(
        &mut self,
        params: &mut [f32],
        grad: &mut [f32],
        smoothed: &mut [f32],
        smoothed_count: &mut f64,
        args: &UpdateArgs,
    ) -> Result<()> {
        let n = params.len();
        if grad.len() != n {
            return Err(SgdErr::SizeMismatch {
                what: "gradient",
                got: grad.len(),
                expected: n,
            });
        }

        let state_len = self.state_len(n);
        if smoothed.len() != state_len {
            return Err(SgdErr::SizeMismatch {
                what: "smoothed gradient state",
                got: smoothed.len(),
                expected: state_len,
            });
        }

        if args.minibatch_samples == 0 {
            return Ok(());
        }

        self.prepare_gradient(params, grad, args);

        match self.rule.kind {
            GradientUpdateType::None => momentum_sgd(params, grad, smoothed, args),
            GradientUpdateType::AdaGrad => ada_grad(params, grad, smoothed, args),
            GradientUpdateType::RmsProp => self.rms_prop(params, grad, smoothed, args),
            GradientUpdateType::FsAdaGrad => {
                self.fs_ada_grad(params, grad, smoothed, smoothed_count, args)
            }
        }

        if args.l1 > 0. {
            let t = (args.learn_rate_per_sample * args.minibatch_samples as f64 * args.l1) as f32;
            params
                .iter_mut()
                .for_each(|w| *w = w.signum() * (w.abs() - t).max(0.));
        }

        Ok(())
    }

    /// Updates narrow precision parameters through a single precision master copy.
    ///
    /// # Arguments
    /// * `params` - The narrow parameters, overwritten with the rounded master copy.
    /// * `master` - The single precision master parameters.
    /// * `grad` - The narrow, loss-scaled gradient.
    /// * `smoothed` - The rule's smoothed state.
    /// * `smoothed_count` - The rule's smoothed sample count.
    /// * `args` - The minibatch's rates and options.
    pub fn update_mixed(
        &mut self,
        params: &mut [f16],
        master: &mut [f32],
        grad: &[f16],
        smoothed: &mut [f32],
        smoothed_count: &mut f64,
        args: &UpdateArgs,
    ) -> Result<()> {
        if params.len() != master.len() {
            return Err(SgdErr::SizeMismatch {
                what: "master parameters",
                got: master.len(),
                expected: params.len(),
            });
        }

        let inv = 1. / self.loss_scale;
        let mut wide: Vec<f32> = grad.iter().map(|g| g.to_f32() * inv).collect();
        self.update(master, &mut wide, smoothed, smoothed_count, args)?;

        params
            .iter_mut()
            .zip(master.iter())
            .for_each(|(p, m)| *p = f16::from_f32(*m));

        Ok(())
    }

    fn prepare_gradient(&mut self, params: &[f32], grad: &mut [f32], args: &UpdateArgs) {
        if let Some(noise) = self.noise {
            grad.iter_mut()
                .for_each(|g| *g += self.rng.sample(noise));
        }

        if let Some(per_sample) = self.clipping_threshold_per_sample {
            let threshold = per_sample * args.minibatch_samples as f64;
            if clip(grad, threshold, self.clipping_mode) {
                debug!(threshold = threshold; "gradient clipped");
            }
        }

        if args.l2 > 0. {
            let scale = (args.l2 * args.minibatch_samples as f64) as f32;
            grad.iter_mut()
                .zip(params)
                .for_each(|(g, w)| *g += scale * w);
        }
    }

    fn rms_prop(&self, params: &mut [f32], grad: &mut [f32], state: &mut [f32], args: &UpdateArgs) {
        let n = params.len();
        let s = &self.rule.rms_prop;
        let (gamma, inc, dec, max, min) = (
            s.gamma as f32,
            s.inc as f32,
            s.dec as f32,
            s.max as f32,
            s.min as f32,
        );

        let (avars, rest) = state.split_at_mut(n);
        let (signs, steps) = rest.split_at_mut(n);
        let mut multipliers = 0.;

        for i in 0..n {
            let g = grad[i];
            let sign = g.signum() * (g != 0.) as u8 as f32;

            if steps[i] == 0. {
                avars[i] = g * g;
                steps[i] = 1.;
            } else {
                avars[i] = gamma * avars[i] + (1. - gamma) * g * g;
                match sign * signs[i] {
                    p if p > 0. => steps[i] = (steps[i] * inc).min(max),
                    p if p < 0. => steps[i] = (steps[i] * dec).max(min),
                    _ => {}
                }
            }
            signs[i] = sign;

            let scale = steps[i] / avars[i].sqrt().max(FLOOR);
            grad[i] = g * scale;
            multipliers += scale as f64;
        }

        let lr = scaled_learn_rate(args, multipliers / n.max(1) as f64);
        params
            .iter_mut()
            .zip(grad.iter())
            .for_each(|(w, g)| *w -= lr * g);
    }

    fn fs_ada_grad(
        &self,
        params: &mut [f32],
        grad: &mut [f32],
        state: &mut [f32],
        smoothed_count: &mut f64,
        args: &UpdateArgs,
    ) {
        let n = params.len();
        let s = &self.rule.fs_ada_grad;

        let var_momentum = (-(args.minibatch_samples as f64) / s.variance_time_constant).exp();
        *smoothed_count = var_momentum * *smoothed_count + (1. - var_momentum);
        let target = (s.target_ada_grad_av_denom * smoothed_count.sqrt()) as f32;

        let var_gain = (1. - var_momentum) as f32;
        let var_momentum = var_momentum as f32;
        let mean_momentum = args.minibatch_momentum();
        let unit_gain = args.unit_gain(mean_momentum);
        let lr = args.learn_rate_per_sample as f32;

        let (denoms, velocity) = state.split_at_mut(n);
        for i in 0..n {
            let g = grad[i];
            denoms[i] = var_momentum * denoms[i] + var_gain * g * g;

            let denom = denoms[i].sqrt();
            let scaled = if denom > 0. { g * target / denom } else { g };

            velocity[i] = mean_momentum * velocity[i] + unit_gain * scaled;
            params[i] -= lr * velocity[i];
        }
    }
}

fn scaled_learn_rate(args: &UpdateArgs, average_multiplier: f64) -> f32 {
    if args.need_average_multiplier && average_multiplier > 0. {
        (args.learn_rate_per_sample / average_multiplier) as f32
    } else {
        args.learn_rate_per_sample as f32
    }
}

fn momentum_sgd(params: &mut [f32], grad: &[f32], velocity: &mut [f32], args: &UpdateArgs) {
    let momentum = args.minibatch_momentum();
    let unit_gain = args.unit_gain(momentum);
    let lr = args.learn_rate_per_sample as f32;

    for ((w, g), v) in params.iter_mut().zip(grad).zip(velocity.iter_mut()) {
        *v = momentum * *v + unit_gain * g;

        let step = if args.use_nesterov {
            momentum * *v + unit_gain * g
        } else {
            *v
        };

        *w -= lr * step;
    }
}

fn ada_grad(params: &mut [f32], grad: &mut [f32], acc: &mut [f32], args: &UpdateArgs) {
    let mut multipliers = 0.;
    let mut counted = 0usize;

    for (g, a) in grad.iter_mut().zip(acc.iter_mut()) {
        *a += *g * *g;
        if *a > 0. {
            let scale = 1. / a.sqrt().max(FLOOR);
            *g *= scale;
            multipliers += scale as f64;
            counted += 1;
        }
    }

    let average = if counted > 0 {
        multipliers / counted as f64
    } else {
        0.
    };

    let lr = scaled_learn_rate(args, average);
    params
        .iter_mut()
        .zip(grad.iter())
        .for_each(|(w, g)| *w -= lr * g);
}
