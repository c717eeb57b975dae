use std::ops::{Deref, DerefMut};

use comms::Element;
use half::f16;

use crate::{Result, SgdErr};

/// Identifier of the compute device a buffer lives on.
pub type DeviceId = i32;

/// The device id of host memory.
pub const CPU_DEVICE: DeviceId = -1;

/// A dense, device-resident buffer of numeric elements.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceBuffer<E: Element> {
    device: DeviceId,
    data: Vec<E>,
}

impl<E: Element> DeviceBuffer<E> {
    /// Creates a new `DeviceBuffer`.
    ///
    /// # Arguments
    /// * `device` - The device holding the data.
    /// * `data` - The buffer's contents.
    ///
    /// # Returns
    /// A new `DeviceBuffer` instance.
    pub fn new(device: DeviceId, data: Vec<E>) -> Self {
        Self { device, data }
    }

    /// Creates a zero filled host buffer of `len` elements.
    pub fn zeros(len: usize) -> Self {
        Self::new(CPU_DEVICE, vec![E::default(); len])
    }

    /// Returns the device holding this buffer.
    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Consumes the buffer and returns its contents.
    pub fn into_vec(self) -> Vec<E> {
        self.data
    }
}

impl<E: Element> From<Vec<E>> for DeviceBuffer<E> {
    fn from(data: Vec<E>) -> Self {
        Self::new(CPU_DEVICE, data)
    }
}

impl<E: Element> Deref for DeviceBuffer<E> {
    type Target = [E];

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl<E: Element> DerefMut for DeviceBuffer<E> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.data
    }
}

/// The numeric precision of a gradient buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Precision {
    Half,
    Single,
    Double,
}

/// A borrowed gradient buffer tagged with its precision.
#[derive(Debug)]
pub enum GradientRef<'a> {
    Half(&'a mut DeviceBuffer<f16>),
    Single(&'a mut DeviceBuffer<f32>),
    Double(&'a mut DeviceBuffer<f64>),
}

impl GradientRef<'_> {
    fn device(&self) -> DeviceId {
        match self {
            GradientRef::Half(b) => b.device(),
            GradientRef::Single(b) => b.device(),
            GradientRef::Double(b) => b.device(),
        }
    }
}

impl<'a> From<&'a mut DeviceBuffer<f16>> for GradientRef<'a> {
    fn from(value: &'a mut DeviceBuffer<f16>) -> Self {
        Self::Half(value)
    }
}

impl<'a> From<&'a mut DeviceBuffer<f32>> for GradientRef<'a> {
    fn from(value: &'a mut DeviceBuffer<f32>) -> Self {
        Self::Single(value)
    }
}

impl<'a> From<&'a mut DeviceBuffer<f64>> for GradientRef<'a> {
    fn from(value: &'a mut DeviceBuffer<f64>) -> Self {
        Self::Double(value)
    }
}

/// The shape of a gradient package: the length of every buffer, per precision,
/// in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GradientLayout {
    pub half: Vec<usize>,
    pub single: Vec<usize>,
    pub double: Vec<usize>,
}

impl GradientLayout {
    /// Creates the layout of a single precision package.
    pub fn single(lens: impl IntoIterator<Item = usize>) -> Self {
        Self {
            single: lens.into_iter().collect(),
            ..Default::default()
        }
    }

    /// Returns the amount of buffers.
    pub fn buffers(&self) -> usize {
        self.half.len() + self.single.len() + self.double.len()
    }

    /// Returns the total amount of elements.
    pub fn elements(&self) -> usize {
        self.half.iter().chain(&self.single).chain(&self.double).sum()
    }

    /// Returns the precisions holding at least one buffer.
    pub fn precisions(&self) -> Vec<Precision> {
        [
            (Precision::Half, &self.half),
            (Precision::Single, &self.single),
            (Precision::Double, &self.double),
        ]
        .into_iter()
        .filter(|(_, lens)| !lens.is_empty())
        .map(|(p, _)| p)
        .collect()
    }
}

/// A collection of borrowed gradient buffers, one bucket per precision.
///
/// Every buffer of a package lives on the same device, the buffers stay owned
/// by the computation engine.
#[derive(Debug, Default)]
pub struct GradientPackage<'a> {
    half: Vec<&'a mut DeviceBuffer<f16>>,
    single: Vec<&'a mut DeviceBuffer<f32>>,
    double: Vec<&'a mut DeviceBuffer<f64>>,
}

impl<'a> GradientPackage<'a> {
    /// Creates an empty `GradientPackage`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a single precision package out of a slice of buffers.
    ///
    /// # Arguments
    /// * `buffers` - The gradients, one per trainable parameter.
    ///
    /// # Returns
    /// The package, or an error if the buffers live on different devices.
    pub fn from_single(buffers: &'a mut [DeviceBuffer<f32>]) -> Result<Self> {
        let mut package = Self::new();
        for buffer in buffers {
            package.push(buffer)?;
        }

        Ok(package)
    }

    /// Adds a buffer to the bucket of its precision.
    ///
    /// # Arguments
    /// * `grad` - The buffer to add.
    ///
    /// # Returns
    /// A `DeviceMismatch` error if `grad` lives on a different device than the buffers
    /// already in the package.
    pub fn push(&mut self, grad: impl Into<GradientRef<'a>>) -> Result<()> {
        let grad = grad.into();

        if let Ok(expected) = self.device() {
            let got = grad.device();
            if got != expected {
                return Err(SgdErr::DeviceMismatch { expected, got });
            }
        }

        match grad {
            GradientRef::Half(b) => self.half.push(b),
            GradientRef::Single(b) => self.single.push(b),
            GradientRef::Double(b) => self.double.push(b),
        }

        Ok(())
    }

    /// Returns the device of the package's buffers.
    ///
    /// # Returns
    /// An `EmptyPackage` error if the package holds no buffers.
    pub fn device(&self) -> Result<DeviceId> {
        self.half
            .first()
            .map(|b| b.device())
            .or_else(|| self.single.first().map(|b| b.device()))
            .or_else(|| self.double.first().map(|b| b.device()))
            .ok_or(SgdErr::EmptyPackage)
    }

    /// Returns the total amount of buffers.
    pub fn len(&self) -> usize {
        self.half.len() + self.single.len() + self.double.len()
    }

    /// Returns `true` if the package holds no buffers.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the package's shape.
    pub fn layout(&self) -> GradientLayout {
        GradientLayout {
            half: self.half.iter().map(|b| b.len()).collect(),
            single: self.single.iter().map(|b| b.len()).collect(),
            double: self.double.iter().map(|b| b.len()).collect(),
        }
    }

    pub fn half_mut(&mut self) -> &mut [&'a mut DeviceBuffer<f16>] {
        &mut self.half
    }

    pub fn single_mut(&mut self) -> &mut [&'a mut DeviceBuffer<f32>] {
        &mut self.single
    }

    pub fn double_mut(&mut self) -> &mut [&'a mut DeviceBuffer<f64>] {
        &mut self.double
    }
}

/// The gradients an engine's backward pass leaves behind.
///
/// Half precision engines back-propagate through a rounded working copy of
/// the parameters and produce loss-scaled gradients. Their single precision
/// parameters are the master weights.
#[derive(Debug)]
pub enum Gradients<'a> {
    /// One gradient per parameter buffer.
    Single(&'a mut [DeviceBuffer<f32>]),
    Half {
        working: &'a mut [DeviceBuffer<f16>],
        grads: &'a mut [DeviceBuffer<f16>],
    },
}

impl Gradients<'_> {
    /// Returns the length of every gradient buffer.
    pub fn lens(&self) -> Vec<usize> {
        match self {
            Gradients::Single(grads) => grads.iter().map(|g| g.len()).collect(),
            Gradients::Half { grads, .. } => grads.iter().map(|g| g.len()).collect(),
        }
    }

    /// Returns the shape of the packages built out of these gradients.
    pub fn layout(&self) -> GradientLayout {
        match self {
            Gradients::Single(_) => GradientLayout::single(self.lens()),
            Gradients::Half { .. } => GradientLayout {
                half: self.lens(),
                ..Default::default()
            },
        }
    }

    pub fn fill_zero(&mut self) {
        match self {
            Gradients::Single(grads) => grads.iter_mut().for_each(|g| g.fill(0.)),
            Gradients::Half { grads, .. } => grads.iter_mut().for_each(|g| g.fill(f16::ZERO)),
        }
    }

    /// Borrows every gradient buffer into a package.
    ///
    /// # Returns
    /// The package, or an error if the buffers live on different devices.
    pub fn package(&mut self) -> Result<GradientPackage<'_>> {
        match self {
            Gradients::Single(grads) => GradientPackage::from_single(grads),
            Gradients::Half { grads, .. } => {
                let mut package = GradientPackage::new();
                for grad in grads.iter_mut() {
                    package.push(grad)?;
                }
                Ok(package)
            }
        }
    }

    /// Rounds `master` into the half precision working copy, if there is one.
    ///
    /// # Arguments
    /// * `master` - The single precision parameters.
    pub fn refresh_working(&mut self, master: &[DeviceBuffer<f32>]) {
        let Gradients::Half { working, .. } = self else {
            return;
        };

        for (w, m) in working.iter_mut().zip(master) {
            w.iter_mut()
                .zip(m.iter())
                .for_each(|(w, m)| *w = f16::from_f32(*m));
        }
    }
}
