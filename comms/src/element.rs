use half::f16;

/// Trait to generalize over the floating point element types a collective can reduce.
///
/// Reductions are carried out in `f64` regardless of the element width, every
/// element only needs to know how to widen and narrow itself.
pub trait Element: bytemuck::Pod + Default + Send + Sync + 'static {
    /// The size in bytes of a single element.
    const BYTES: usize = size_of::<Self>();

    /// Widens the element to `f64`.
    fn to_f64(self) -> f64;

    /// Narrows an `f64` back into this element type.
    fn from_f64(value: f64) -> Self;
}

impl Element for f16 {
    fn to_f64(self) -> f64 {
        f16::to_f64(self)
    }

    fn from_f64(value: f64) -> Self {
        f16::from_f64(value)
    }
}

impl Element for f32 {
    fn to_f64(self) -> f64 {
        self as f64
    }

    fn from_f64(value: f64) -> Self {
        value as f32
    }
}

impl Element for f64 {
    fn to_f64(self) -> f64 {
        self
    }

    fn from_f64(value: f64) -> Self {
        value
    }
}
