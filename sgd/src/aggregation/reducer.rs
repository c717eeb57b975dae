use comms::{Element, Transport};
use half::f16;
use log::debug;
use serde::{Deserialize, Serialize};

use super::QuantizationPolicy;
use crate::{
    Result, SgdErr,
    gradient::{DeviceBuffer, GradientLayout, GradientPackage},
    header::AggregationHeader,
};

/// How the gradients of the contributing ranks are combined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReduceOp {
    #[default]
    Sum,
    /// Sum divided by the amount of ranks that contributed a package.
    Mean,
}

/// One quantization policy per precision bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(super) struct BucketPolicies {
    pub half: QuantizationPolicy,
    pub single: QuantizationPolicy,
    pub double: QuantizationPolicy,
}

impl BucketPolicies {
    pub fn uniform(policy: QuantizationPolicy) -> Self {
        Self {
            half: policy,
            single: policy,
            double: policy,
        }
    }

    /// Double precision buffers are never quantized.
    pub fn mixed(policy: QuantizationPolicy) -> Self {
        Self {
            double: QuantizationPolicy::full_precision(),
            ..Self::uniform(policy)
        }
    }

    pub fn set_bits(&mut self, bits: u32) {
        self.half = self.half.with_bits(bits);
        self.single = self.single.with_bits(bits);
        if self.double.bits() < 32 {
            self.double = self.double.with_bits(bits);
        }
    }
}

/// Quantization error carried over between rounds, per buffer.
#[derive(Debug, Clone, Default)]
pub(super) struct Residuals {
    half: Vec<Vec<f64>>,
    single: Vec<Vec<f64>>,
    double: Vec<Vec<f64>>,
}

impl Residuals {
    pub fn zeros(layout: &GradientLayout) -> Self {
        let zeros = |lens: &[usize]| lens.iter().map(|&n| vec![0.; n]).collect();
        Self {
            half: zeros(&layout.half),
            single: zeros(&layout.single),
            double: zeros(&layout.double),
        }
    }
}

/// Owned copies of a package's buffers, used when the reduction outlives the borrow.
#[derive(Debug, Clone, Default)]
pub(super) struct OwnedGradients {
    half: Vec<Vec<f16>>,
    single: Vec<Vec<f32>>,
    double: Vec<Vec<f64>>,
}

impl OwnedGradients {
    pub fn copy_from(package: &mut GradientPackage<'_>) -> Self {
        Self {
            half: package.half_mut().iter().map(|b| b.to_vec()).collect(),
            single: package.single_mut().iter().map(|b| b.to_vec()).collect(),
            double: package.double_mut().iter().map(|b| b.to_vec()).collect(),
        }
    }

    /// Copies the buffers back into `package`, which must have the same layout or be empty.
    pub fn write_into(&self, package: &mut GradientPackage<'_>) {
        fn write<E: Element>(dst: &mut [&mut DeviceBuffer<E>], src: &[Vec<E>]) {
            for (d, s) in dst.iter_mut().zip(src) {
                d.copy_from_slice(s);
            }
        }

        write(package.half_mut(), &self.half);
        write(package.single_mut(), &self.single);
        write(package.double_mut(), &self.double);
    }
}

/// A completed reduction round.
#[derive(Debug)]
pub(super) struct Round {
    pub grads: OwnedGradients,
    pub header: AggregationHeader,
    pub contributors: usize,
    pub residuals: Option<Residuals>,
}

/// The collective logic every aggregator shares: header reduction, layout
/// agreement and per-buffer reduction.
#[derive(Debug, Clone)]
pub(super) struct Reducer<T> {
    pub transport: T,
    op: ReduceOp,
    layout: GradientLayout,
}

impl<T: Transport + Sync> Reducer<T> {
    pub fn new(transport: T, layout: GradientLayout, op: ReduceOp) -> Self {
        Self {
            transport,
            op,
            layout,
        }
    }

    pub fn layout(&self) -> &GradientLayout {
        &self.layout
    }

    /// Identifies the expected layout, summed across ranks it must equal `ranks` times itself.
    fn fingerprint(&self) -> f64 {
        self.layout.elements() as f64 + self.layout.buffers() as f64 * 4_294_967_296.
    }

    /// Reduces the header of every rank.
    ///
    /// # Arguments
    /// * `header` - This rank's totals, overwritten with the global ones if anybody contributed.
    /// * `package` - This rank's package, only its layout is read.
    ///
    /// # Returns
    /// The amount of ranks that contributed a non empty package, or a
    /// `RankDisagreement` error on every rank if any package doesn't match the layout.
    pub async fn reduce_header(
        &self,
        header: &mut AggregationHeader,
        package: &GradientPackage<'_>,
    ) -> Result<usize> {
        let contributed = !package.is_empty();
        let mismatch = contributed && package.layout() != self.layout;
        self.reduce_header_flags(header, contributed, mismatch).await
    }

    pub async fn reduce_header_flags(
        &self,
        header: &mut AggregationHeader,
        contributed: bool,
        mismatch: bool,
    ) -> Result<usize> {
        let fingerprint = self.fingerprint();
        let mut wire = header.to_wire(contributed, mismatch, fingerprint);
        self.transport.all_reduce(&mut wire).await?;

        let info = AggregationHeader::round_info(&wire);
        let expected = fingerprint * self.transport.rank_count() as f64;
        if info.mismatches > 0 || info.fingerprint != expected {
            return Err(SgdErr::RankDisagreement("gradient package layout"));
        }

        if info.contributors > 0 {
            header.load_wire(&wire);
        }

        debug!(
            rank = self.transport.current_rank(),
            contributors = info.contributors,
            samples = header.num_samples;
            "reduced aggregation header"
        );

        Ok(info.contributors)
    }

    /// Reduces every buffer of a borrowed package in place.
    ///
    /// Ranks with an empty package contribute zeros.
    pub async fn reduce_package(
        &self,
        package: &mut GradientPackage<'_>,
        policies: &BucketPolicies,
        residuals: Option<&mut Residuals>,
        contributors: usize,
        widen_half: bool,
    ) -> Result<()> {
        let (rh, rs, rd) = split_residuals(residuals);

        let half = package.half_mut().iter_mut().map(|b| &mut ***b).collect();
        self.reduce_half(half, &policies.half, rh, contributors, widen_half)
            .await?;

        let single = package.single_mut().iter_mut().map(|b| &mut ***b).collect();
        self.reduce_bucket(single, &self.layout.single, &policies.single, rs, contributors)
            .await?;

        let double = package.double_mut().iter_mut().map(|b| &mut ***b).collect();
        self.reduce_bucket(double, &self.layout.double, &policies.double, rd, contributors)
            .await
    }

    /// Runs a whole round over owned buffers, consuming the reducer.
    pub async fn reduce_round(
        self,
        mut grads: OwnedGradients,
        mut header: AggregationHeader,
        contributed: bool,
        mismatch: bool,
        policies: BucketPolicies,
        mut residuals: Option<Residuals>,
    ) -> Result<Round> {
        let contributors = self
            .reduce_header_flags(&mut header, contributed, mismatch)
            .await?;

        if contributors > 0 {
            let (rh, rs, rd) = split_residuals(residuals.as_mut());

            let half = grads.half.iter_mut().map(|v| v.as_mut_slice()).collect();
            self.reduce_half(half, &policies.half, rh, contributors, true)
                .await?;

            let single = grads.single.iter_mut().map(|v| v.as_mut_slice()).collect();
            self.reduce_bucket(single, &self.layout.single, &policies.single, rs, contributors)
                .await?;

            let double = grads.double.iter_mut().map(|v| v.as_mut_slice()).collect();
            self.reduce_bucket(double, &self.layout.double, &policies.double, rd, contributors)
                .await?;
        }

        Ok(Round {
            grads,
            header,
            contributors,
            residuals,
        })
    }

    async fn reduce_half(
        &self,
        bufs: Vec<&mut [f16]>,
        policy: &QuantizationPolicy,
        residuals: Option<&mut [Vec<f64>]>,
        contributors: usize,
        widen: bool,
    ) -> Result<()> {
        if !widen {
            return self
                .reduce_bucket(bufs, &self.layout.half, policy, residuals, contributors)
                .await;
        }

        let mut wide: Vec<Vec<f32>> = bufs
            .iter()
            .map(|b| b.iter().map(|v| v.to_f32()).collect())
            .collect();

        let views = wide.iter_mut().map(|v| v.as_mut_slice()).collect();
        self.reduce_bucket(views, &self.layout.half, policy, residuals, contributors)
            .await?;

        for (dst, src) in bufs.into_iter().zip(&wide) {
            dst.iter_mut()
                .zip(src)
                .for_each(|(d, s)| *d = f16::from_f32(*s));
        }

        Ok(())
    }

    /// Reduces the buffers of one precision, in layout order.
    async fn reduce_bucket<E: Element>(
        &self,
        mut bufs: Vec<&mut [E]>,
        lens: &[usize],
        policy: &QuantizationPolicy,
        mut residuals: Option<&mut [Vec<f64>]>,
        contributors: usize,
    ) -> Result<()> {
        for (i, &len) in lens.iter().enumerate() {
            let mut scratch = Vec::new();
            let values: &mut [E] = match bufs.get_mut(i) {
                Some(b) => b,
                None => {
                    scratch.resize(len, E::default());
                    &mut scratch
                }
            };

            let residual = residuals.as_deref_mut().map(|r| r[i].as_mut_slice());
            policy.quantize(values, residual);
            self.transport.all_reduce(values).await?;

            if self.op == ReduceOp::Mean && contributors > 1 {
                let n = contributors as f64;
                values
                    .iter_mut()
                    .for_each(|v| *v = E::from_f64(v.to_f64() / n));
            }
        }

        Ok(())
    }
}

type ResidualSplit<'a> = (
    Option<&'a mut [Vec<f64>]>,
    Option<&'a mut [Vec<f64>]>,
    Option<&'a mut [Vec<f64>]>,
);

fn split_residuals(residuals: Option<&mut Residuals>) -> ResidualSplit<'_> {
    match residuals {
        Some(r) => (
            Some(r.half.as_mut_slice()),
            Some(r.single.as_mut_slice()),
            Some(r.double.as_mut_slice()),
        ),
        None => (None, None, None),
    }
}
