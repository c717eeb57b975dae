use comms::Element;

/// Decides whether a buffer is reduced at full precision or through a lossy
/// `bits`-wide encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuantizationPolicy {
    bits: u32,
    pack_threshold_bytes: usize,
    zero_threshold: bool,
}

impl QuantizationPolicy {
    /// Creates a new `QuantizationPolicy`.
    ///
    /// # Arguments
    /// * `bits` - Bits per element, `32` or more disables quantization.
    /// * `pack_threshold_bytes` - Buffers smaller than this stay at full precision.
    /// * `zero_threshold` - 1-bit only: split at zero instead of at the buffer's mean.
    ///
    /// # Returns
    /// A new `QuantizationPolicy` instance.
    pub fn new(bits: u32, pack_threshold_bytes: usize, zero_threshold: bool) -> Self {
        Self {
            bits,
            pack_threshold_bytes,
            zero_threshold,
        }
    }

    /// A policy that never quantizes.
    pub fn full_precision() -> Self {
        Self::new(32, 0, true)
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    /// Returns a copy of this policy using `bits` bits per element.
    pub fn with_bits(self, bits: u32) -> Self {
        Self { bits, ..self }
    }

    /// Returns `true` if a buffer of `len` elements of `elem_bytes` bytes gets quantized.
    pub fn applies_to(&self, len: usize, elem_bytes: usize) -> bool {
        self.bits < 32 && len * elem_bytes >= self.pack_threshold_bytes
    }

    /// Replaces `values` with their quantized reconstruction.
    ///
    /// When a residual is given it is added to `values` before quantizing and
    /// afterwards holds the quantization error, to be fed back next round.
    ///
    /// # Arguments
    /// * `values` - The buffer to quantize in place.
    /// * `residual` - The error carried over from previous rounds, same length as `values`.
    ///
    /// # Returns
    /// `true` if the buffer was quantized.
    pub fn quantize<E: Element>(&self, values: &mut [E], residual: Option<&mut [f64]>) -> bool {
        let quantized = self.applies_to(values.len(), E::BYTES);

        let Some(residual) = residual else {
            if quantized {
                let wide: Vec<f64> = values.iter().map(|v| v.to_f64()).collect();
                let q = self.encode(&wide);
                values
                    .iter_mut()
                    .zip(q)
                    .for_each(|(v, q)| *v = E::from_f64(q));
            }
            return quantized;
        };

        let wide: Vec<f64> = values
            .iter()
            .zip(residual.iter())
            .map(|(v, r)| v.to_f64() + r)
            .collect();

        let q = if quantized {
            self.encode(&wide)
        } else {
            wide.clone()
        };

        for ((v, r), (w, q)) in values.iter_mut().zip(residual.iter_mut()).zip(wide.iter().zip(q)) {
            *v = E::from_f64(q);
            *r = w - v.to_f64();
        }

        quantized
    }

    fn encode(&self, values: &[f64]) -> Vec<f64> {
        if self.bits == 1 {
            one_bit(values, self.zero_threshold)
        } else {
            uniform(values, self.bits)
        }
    }
}

/// Every element becomes the mean of the elements on its side of the threshold.
fn one_bit(values: &[f64], zero_threshold: bool) -> Vec<f64> {
    let threshold = if zero_threshold || values.is_empty() {
        0.
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    };

    let (mut above, mut n_above, mut below, mut n_below) = (0., 0usize, 0., 0usize);
    for &v in values {
        if v >= threshold {
            above += v;
            n_above += 1;
        } else {
            below += v;
            n_below += 1;
        }
    }

    let above = above / n_above.max(1) as f64;
    let below = below / n_below.max(1) as f64;

    values
        .iter()
        .map(|&v| if v >= threshold { above } else { below })
        .collect()
}

/// Rounds every element to one of `2^bits` evenly spaced levels spanning `[-max|v|, max|v|]`.
fn uniform(values: &[f64], bits: u32) -> Vec<f64> {
    let range = values.iter().fold(0f64, |acc, v| acc.max(v.abs()));
    if range == 0. || !range.is_finite() {
        return values.to_vec();
    }

    let steps = ((1u64 << bits) - 1) as f64;
    let step = 2. * range / steps;

    values
        .iter()
        .map(|&v| (((v + range) / step).round() * step - range).clamp(-range, range))
        .collect()
}
