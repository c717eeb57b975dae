use serde::{Deserialize, Serialize};

/// How a gradient exceeding the clipping threshold is brought back into range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClippingMode {
    /// Clamps every element into `[-threshold, threshold]`.
    #[default]
    Element,
    /// Rescales the whole tensor so its L2 norm doesn't exceed the threshold.
    Norm,
}

/// Clips `grad` in place.
///
/// # Arguments
/// * `grad` - The gradient to clip.
/// * `threshold` - The clipping threshold for the whole minibatch.
/// * `mode` - Whether to clip elements or the norm.
///
/// # Returns
/// `true` if any value was changed.
pub fn clip(grad: &mut [f32], threshold: f64, mode: ClippingMode) -> bool {
    match mode {
        ClippingMode::Element => {
            let t = threshold as f32;
            let mut clipped = false;

            for g in grad.iter_mut() {
                let c = g.clamp(-t, t);
                clipped |= c != *g;
                *g = c;
            }

            clipped
        }
        ClippingMode::Norm => {
            let norm = grad
                .iter()
                .map(|&g| (g as f64) * (g as f64))
                .sum::<f64>()
                .sqrt();

            if norm <= threshold {
                return false;
            }

            let scale = (threshold / norm) as f32;
            grad.iter_mut().for_each(|g| *g *= scale);
            true
        }
    }
}
