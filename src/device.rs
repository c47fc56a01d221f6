//! Execution context and device dispatch.
//!
//! Every graph element picks its operation variant from an [`ExecutionContext`] at
//! construction time. Leaf code never reads a hidden global: the thread-local default is only
//! consulted by [`ExecutionContext::default`].
use ndarray::{ArrayD, Ix2, Zip};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::cell::{RefCell, RefMut};
use std::rc::Rc;
use std::str::FromStr;

use crate::graph::{ConfigurationError, ShapeError};

pub const DEVICE_ENV: &str = "RENOM_DEVICE";
pub const SEED_ENV: &str = "RENOM_SEED";

#[derive(
    Debug, Clone, Copy, Hash, Ord, PartialOrd, Eq, PartialEq, Serialize, Deserialize,
)]
pub enum Device {
    Cpu,
    Accelerator(u32),
}

impl core::fmt::Display for Device {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Accelerator(idx) => write!(f, "accelerator:{idx}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceMode {
    Cpu,
    Accelerator { devices: u32 },
}

impl DeviceMode {
    pub fn devices(&self) -> Vec<Device> {
        match self {
            DeviceMode::Cpu => vec![Device::Cpu],
            DeviceMode::Accelerator { devices } => {
                (0..*devices).map(Device::Accelerator).collect()
            }
        }
    }

    pub fn is_accelerated(&self) -> bool {
        matches!(self, DeviceMode::Accelerator { .. })
    }
}

impl core::fmt::Display for DeviceMode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            DeviceMode::Cpu => write!(f, "cpu"),
            DeviceMode::Accelerator { devices } => write!(f, "accelerator:{devices}"),
        }
    }
}

impl FromStr for DeviceMode {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        match s.split_once(':') {
            None if s == "cpu" => Ok(DeviceMode::Cpu),
            None if s == "accelerator" || s == "cuda" => Ok(DeviceMode::Accelerator { devices: 1 }),
            Some(("accelerator" | "cuda", count)) => match count.parse::<u32>() {
                Ok(devices) if devices > 0 => Ok(DeviceMode::Accelerator { devices }),
                _ => Err(ConfigurationError::InvalidDeviceMode(s.clone())),
            },
            _ => Err(ConfigurationError::InvalidDeviceMode(s)),
        }
    }
}

thread_local! {
    static DEFAULT_CONTEXT: RefCell<Option<ExecutionContext>> = const { RefCell::new(None) };
}

/// Device mode plus the seeded random source used by initializers, dropout and shuffling.
///
/// Cloning shares the random source.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    mode: DeviceMode,
    rng: Rc<RefCell<StdRng>>,
}

impl ExecutionContext {
    pub fn new(mode: DeviceMode, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            mode,
            rng: Rc::new(RefCell::new(rng)),
        }
    }

    pub fn cpu() -> Self {
        Self::new(DeviceMode::Cpu, None)
    }

    pub fn accelerator(devices: u32) -> Self {
        Self::new(DeviceMode::Accelerator { devices: devices.max(1) }, None)
    }

    pub fn with_seed(self, seed: u64) -> Self {
        *self.rng.borrow_mut() = StdRng::seed_from_u64(seed);
        self
    }

    /// Reads `RENOM_DEVICE` (`cpu`, `accelerator`, `accelerator:N`) and `RENOM_SEED`.
    pub fn from_env() -> Result<Self, ConfigurationError> {
        let mode = match std::env::var(DEVICE_ENV) {
            Ok(value) => value.parse()?,
            Err(_) => DeviceMode::Cpu,
        };
        let seed = match std::env::var(SEED_ENV) {
            Ok(value) => Some(
                value
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| ConfigurationError::InvalidSeed(value.clone()))?,
            ),
            Err(_) => None,
        };
        log::debug!("Execution context from environment: mode={mode} seed={seed:?}");
        Ok(Self::new(mode, seed))
    }

    pub fn mode(&self) -> DeviceMode {
        self.mode
    }

    pub fn devices(&self) -> Vec<Device> {
        self.mode.devices()
    }

    pub fn rng(&self) -> RefMut<'_, StdRng> {
        self.rng.borrow_mut()
    }

    /// Derives an independent generator, used by components that keep their own stream.
    pub fn fork_rng(&self) -> StdRng {
        StdRng::from_rng(&mut *self.rng.borrow_mut()).unwrap_or_else(|_| StdRng::from_entropy())
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        DEFAULT_CONTEXT.with(|ctx| {
            ctx.borrow_mut()
                .get_or_insert_with(|| {
                    ExecutionContext::from_env().unwrap_or_else(|err| {
                        log::warn!("Ignoring invalid device configuration: {err}");
                        ExecutionContext::cpu()
                    })
                })
                .clone()
        })
    }
}

pub fn set_default_context(ctx: ExecutionContext) {
    DEFAULT_CONTEXT.with(|default| *default.borrow_mut() = Some(ctx));
}

/// Per-device compute handle. The accelerator variant runs kernels data-parallel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComputeHandle {
    device: Device,
}

impl ComputeHandle {
    pub fn device(&self) -> Device {
        self.device
    }

    fn parallel(&self) -> bool {
        matches!(self.device, Device::Accelerator(_))
    }

    pub fn map(&self, x: &ArrayD<f32>, f: impl Fn(f32) -> f32 + Sync + Send) -> ArrayD<f32> {
        let mut out = x.clone();
        if self.parallel() {
            out.par_mapv_inplace(f);
        } else {
            out.mapv_inplace(f);
        }
        out
    }

    /// Element-wise combination of two same-shaped arrays.
    pub fn zip_map(
        &self,
        op: &str,
        a: &ArrayD<f32>,
        b: &ArrayD<f32>,
        f: impl Fn(f32, f32) -> f32 + Sync + Send,
    ) -> Result<ArrayD<f32>, ShapeError> {
        if a.shape() != b.shape() {
            return Err(ShapeError::IncompatibleShapes {
                op: op.to_string(),
                lhs: a.shape().to_vec(),
                rhs: b.shape().to_vec(),
            });
        }
        let mut out = ArrayD::zeros(a.raw_dim());
        let zip = Zip::from(&mut out).and(a).and(b);
        if self.parallel() {
            zip.par_for_each(|o, &x, &y| *o = f(x, y));
        } else {
            zip.for_each(|o, &x, &y| *o = f(x, y));
        }
        Ok(out)
    }

    /// `a · b`, optionally transposing either side first.
    pub fn matmul(
        &self,
        op: &str,
        a: &ArrayD<f32>,
        transpose_a: bool,
        b: &ArrayD<f32>,
        transpose_b: bool,
    ) -> Result<ArrayD<f32>, ShapeError> {
        let lhs = a
            .view()
            .into_dimensionality::<Ix2>()
            .map_err(|_| ShapeError::UnexpectedRank {
                op: op.to_string(),
                expected: 2,
                shape: a.shape().to_vec(),
            })?;
        let rhs = b
            .view()
            .into_dimensionality::<Ix2>()
            .map_err(|_| ShapeError::UnexpectedRank {
                op: op.to_string(),
                expected: 2,
                shape: b.shape().to_vec(),
            })?;
        let lhs = if transpose_a { lhs.reversed_axes() } else { lhs };
        let rhs = if transpose_b { rhs.reversed_axes() } else { rhs };
        if lhs.ncols() != rhs.nrows() {
            return Err(ShapeError::IncompatibleShapes {
                op: op.to_string(),
                lhs: lhs.shape().to_vec(),
                rhs: rhs.shape().to_vec(),
            });
        }
        Ok(lhs.dot(&rhs).into_dyn())
    }
}

/// Yields one compute handle per device, in device order.
pub fn handles(devices: &[Device]) -> impl Iterator<Item = (Device, ComputeHandle)> + '_ {
    devices
        .iter()
        .map(|&device| (device, ComputeHandle { device }))
}
