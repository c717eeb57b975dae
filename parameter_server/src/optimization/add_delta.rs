use super::Optimizer;

/// Accumulate-and-apply conflict policy: every pushed delta is added to the parameters.
#[derive(Debug, Clone, Copy)]
pub struct AddDelta {
    scale: f32,
}

impl AddDelta {
    /// Creates a new `AddDelta` optimizer.
    ///
    /// # Arguments
    /// * `scale` - Multiplies the accumulated deltas before adding them.
    ///
    /// # Returns
    /// A new `AddDelta` instance.
    pub fn new(scale: f32) -> Self {
        Self { scale }
    }
}

impl Default for AddDelta {
    fn default() -> Self {
        Self::new(1.0)
    }
}

impl Optimizer for AddDelta {
    fn update_params(&mut self, acc: &[f32], params: &mut [f32]) {
        let scale = self.scale;

        params
            .iter_mut()
            .zip(acc)
            .for_each(|(p, d)| *p += scale * d);
    }
}
