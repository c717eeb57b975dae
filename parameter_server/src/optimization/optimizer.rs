/// Defines how the deltas accumulated in a shard are folded into its parameters.
///
/// The shard guarantees `acc` and `params` have the same length.
pub trait Optimizer {
    /// Applies the accumulated deltas to the parameters.
    ///
    /// # Arguments
    /// * `acc` - The deltas accumulated since the last update.
    /// * `params` - The parameters to update.
    fn update_params(&mut self, acc: &[f32], params: &mut [f32]);
}
