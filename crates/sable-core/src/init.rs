// Init — Value initializers for TensorStorage
//
// Values are generated on the host with `rand::thread_rng()` and written
// through `TensorStorage::load`, which uploads when the storage lives on an
// accelerator. Only logical elements are written; padding stays zero.
//
// Sampling is f32 throughout: the uniform draw is `rng.gen::<f32>()` mapped
// affinely onto [low, high), the normal draw is `StandardNormal` scaled by
// std and shifted by mean.

use rand::Rng;
use rand_distr::StandardNormal;

use crate::error::{Error, Result};
use crate::storage::TensorStorage;

/// How to fill a freshly created storage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Init {
    Zeros,
    Ones,
    Constant(f32),
    Uniform { low: f32, high: f32 },
    Normal { mean: f32, std: f32 },
    /// U(-a, a) with a = sqrt(6 / (fan_in + fan_out)), fans taken from the
    /// two innermost dimensions.
    XavierUniform,
}

impl Init {
    /// Write the initial values into `storage`.
    pub fn apply(&self, storage: &TensorStorage) -> Result<()> {
        match *self {
            Init::Zeros => zeros(storage),
            Init::Ones => ones(storage),
            Init::Constant(value) => constant(storage, value),
            Init::Uniform { low, high } => uniform(storage, low, high),
            Init::Normal { mean, std } => normal(storage, mean, std),
            Init::XavierUniform => {
                let (fan_in, fan_out) = (storage.shape().rows(), storage.shape().cols());
                let a = (6.0 / (fan_in + fan_out) as f32).sqrt();
                uniform(storage, -a, a)
            }
        }
    }
}

pub fn zeros(storage: &TensorStorage) -> Result<()> {
    storage.fill(0.0)
}

pub fn ones(storage: &TensorStorage) -> Result<()> {
    storage.fill(1.0)
}

pub fn constant(storage: &TensorStorage, value: f32) -> Result<()> {
    storage.fill(value)
}

/// Uniform samples in `[low, high)`.
pub fn uniform(storage: &TensorStorage, low: f32, high: f32) -> Result<()> {
    if !(low < high) {
        return Err(Error::invalid_argument(format!(
            "uniform range [{low}, {high}) is empty"
        )));
    }
    let n = storage.layout().logical_len();
    let mut rng = rand::thread_rng();
    let range = high - low;
    let values: Vec<f32> = (0..n).map(|_| rng.gen::<f32>() * range + low).collect();
    storage.load(&values)
}

/// Normal samples with the given mean and standard deviation.
pub fn normal(storage: &TensorStorage, mean: f32, std: f32) -> Result<()> {
    if !(std >= 0.0) || !std.is_finite() {
        return Err(Error::invalid_argument(format!(
            "standard deviation {std} must be finite and non-negative"
        )));
    }
    let n = storage.layout().logical_len();
    let mut rng = rand::thread_rng();
    let values: Vec<f32> = (0..n)
        .map(|_| rng.sample::<f32, _>(StandardNormal) * std + mean)
        .collect();
    storage.load(&values)
}
