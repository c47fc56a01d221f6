//! Parameter update rules.
//!
//! An [`Optimizer`] is a plain hyperparameter record that can be tagged onto a parameter or
//! parsed from a name. The running state lives in [`OptimizerState`], one per device buffer,
//! owned by the update operation that applies it.
use ndarray::{ArrayD, Zip};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::graph::ConfigurationError;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Optimizer {
    Sgd {
        learning_rate: f32,
        momentum: f32,
    },
    Adagrad {
        learning_rate: f32,
        epsilon: f32,
    },
    Adadelta {
        decay_rate: f32,
        epsilon: f32,
    },
    Adamax {
        learning_rate: f32,
        beta1: f32,
        beta2: f32,
        epsilon: f32,
    },
    Rmsprop {
        learning_rate: f32,
        decay_rate: f32,
        epsilon: f32,
    },
    Adam {
        learning_rate: f32,
        beta1: f32,
        beta2: f32,
        epsilon: f32,
    },
}

impl Default for Optimizer {
    fn default() -> Self {
        Optimizer::sgd(0.1, 0.4)
    }
}

impl Optimizer {
    pub fn sgd(learning_rate: f32, momentum: f32) -> Self {
        Optimizer::Sgd {
            learning_rate,
            momentum,
        }
    }

    pub fn adagrad() -> Self {
        Optimizer::Adagrad {
            learning_rate: 0.01,
            epsilon: 1e-8,
        }
    }

    pub fn adadelta() -> Self {
        Optimizer::Adadelta {
            decay_rate: 0.95,
            epsilon: 1e-8,
        }
    }

    pub fn adamax() -> Self {
        Optimizer::Adamax {
            learning_rate: 0.001,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }

    pub fn rmsprop() -> Self {
        Optimizer::Rmsprop {
            learning_rate: 0.001,
            decay_rate: 0.9,
            epsilon: 1e-8,
        }
    }

    pub fn adam() -> Self {
        Optimizer::Adam {
            learning_rate: 0.001,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let check = |name: &str, value: f32, ok: bool| {
            if ok && value.is_finite() {
                Ok(())
            } else {
                Err(ConfigurationError::InvalidHyperparameter {
                    name: name.to_string(),
                    value,
                })
            }
        };
        match *self {
            Optimizer::Sgd {
                learning_rate,
                momentum,
            } => {
                check("learning_rate", learning_rate, learning_rate > 0.0)?;
                check("momentum", momentum, (0.0..1.0).contains(&momentum))
            }
            Optimizer::Adagrad {
                learning_rate,
                epsilon,
            } => {
                check("learning_rate", learning_rate, learning_rate > 0.0)?;
                check("epsilon", epsilon, epsilon > 0.0)
            }
            Optimizer::Adadelta {
                decay_rate,
                epsilon,
            }
            | Optimizer::Rmsprop {
                decay_rate,
                epsilon,
                ..
            } => {
                check("decay_rate", decay_rate, (0.0..1.0).contains(&decay_rate))?;
                check("epsilon", epsilon, epsilon > 0.0)
            }
            Optimizer::Adamax {
                learning_rate,
                beta1,
                beta2,
                epsilon,
            }
            | Optimizer::Adam {
                learning_rate,
                beta1,
                beta2,
                epsilon,
            } => {
                check("learning_rate", learning_rate, learning_rate > 0.0)?;
                check("beta1", beta1, (0.0..1.0).contains(&beta1))?;
                check("beta2", beta2, (0.0..1.0).contains(&beta2))?;
                check("epsilon", epsilon, epsilon > 0.0)
            }
        }
    }

    /// Returns the amount to subtract from the parameter for `grad`.
    pub fn delta(&self, state: &mut OptimizerState, grad: &ArrayD<f32>) -> ArrayD<f32> {
        state.step += 1;
        let t = state.step as i32;
        let first = state
            .first
            .get_or_insert_with(|| ArrayD::zeros(grad.raw_dim()));
        if first.shape() != grad.shape() {
            *first = ArrayD::zeros(grad.raw_dim());
        }
        let second = state
            .second
            .get_or_insert_with(|| ArrayD::zeros(grad.raw_dim()));
        if second.shape() != grad.shape() {
            *second = ArrayD::zeros(grad.raw_dim());
        }
        match *self {
            Optimizer::Sgd {
                learning_rate,
                momentum,
            } => {
                Zip::from(&mut *first)
                    .and(grad)
                    .for_each(|v, &g| *v = momentum * *v + learning_rate * g);
                first.clone()
            }
            Optimizer::Adagrad {
                learning_rate,
                epsilon,
            } => {
                Zip::from(&mut *first).and(grad).for_each(|r, &g| *r += g * g);
                Zip::from(&*first)
                    .and(grad)
                    .map_collect(|&r, &g| learning_rate * g / (r.sqrt() + epsilon))
            }
            Optimizer::Adadelta {
                decay_rate,
                epsilon,
            } => {
                // first: running squared gradient, second: running squared update
                let mut out = ArrayD::zeros(grad.raw_dim());
                Zip::from(&mut out)
                    .and(&mut *first)
                    .and(&mut *second)
                    .and(grad)
                    .for_each(|o, eg, edx, &g| {
                        *eg = decay_rate * *eg + (1.0 - decay_rate) * g * g;
                        let dx = ((*edx + epsilon).sqrt() / (*eg + epsilon).sqrt()) * g;
                        *edx = decay_rate * *edx + (1.0 - decay_rate) * dx * dx;
                        *o = dx;
                    });
                out
            }
            Optimizer::Adamax {
                learning_rate,
                beta1,
                beta2,
                epsilon,
            } => {
                let mut out = ArrayD::zeros(grad.raw_dim());
                let correction = 1.0 - beta1.powi(t);
                Zip::from(&mut out)
                    .and(&mut *first)
                    .and(&mut *second)
                    .and(grad)
                    .for_each(|o, m, u, &g| {
                        *m = beta1 * *m + (1.0 - beta1) * g;
                        *u = (beta2 * *u).max(g.abs());
                        *o = learning_rate / correction * *m / (*u + epsilon);
                    });
                out
            }
            Optimizer::Rmsprop {
                learning_rate,
                decay_rate,
                epsilon,
            } => {
                Zip::from(&mut *first)
                    .and(grad)
                    .for_each(|r, &g| *r = decay_rate * *r + (1.0 - decay_rate) * g * g);
                Zip::from(&*first)
                    .and(grad)
                    .map_collect(|&r, &g| learning_rate * g / (r.sqrt() + epsilon))
            }
            Optimizer::Adam {
                learning_rate,
                beta1,
                beta2,
                epsilon,
            } => {
                let mut out = ArrayD::zeros(grad.raw_dim());
                let mc = 1.0 - beta1.powi(t);
                let vc = 1.0 - beta2.powi(t);
                Zip::from(&mut out)
                    .and(&mut *first)
                    .and(&mut *second)
                    .and(grad)
                    .for_each(|o, m, v, &g| {
                        *m = beta1 * *m + (1.0 - beta1) * g;
                        *v = beta2 * *v + (1.0 - beta2) * g * g;
                        *o = learning_rate * (*m / mc) / ((*v / vc).sqrt() + epsilon);
                    });
                out
            }
        }
    }
}

impl FromStr for Optimizer {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sgd" => Ok(Optimizer::default()),
            "adagrad" => Ok(Optimizer::adagrad()),
            "adadelta" => Ok(Optimizer::adadelta()),
            "adamax" => Ok(Optimizer::adamax()),
            "rmsprop" => Ok(Optimizer::rmsprop()),
            "adam" => Ok(Optimizer::adam()),
            _ => Err(ConfigurationError::UnknownOptimizer(s.to_string())),
        }
    }
}

/// Running moments for one device buffer.
#[derive(Debug, Clone, Default)]
pub struct OptimizerState {
    step: u32,
    first: Option<ArrayD<f32>>,
    second: Option<ArrayD<f32>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum WeightDecay {
    L2(f32),
}

impl Default for WeightDecay {
    fn default() -> Self {
        WeightDecay::L2(0.0005)
    }
}

impl WeightDecay {
    /// Adds the decay term for `param` onto `grad`.
    pub fn apply(&self, param: &ArrayD<f32>, grad: &mut ArrayD<f32>) {
        match *self {
            WeightDecay::L2(coefficient) => {
                Zip::from(grad)
                    .and(param)
                    .for_each(|g, &p| *g += coefficient * p);
            }
        }
    }
}

impl FromStr for WeightDecay {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "l2" => Ok(WeightDecay::default()),
            _ => Err(ConfigurationError::UnknownDecay(s.to_string())),
        }
    }
}
