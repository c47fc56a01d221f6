use ndarray::{ArrayD, IxDyn};
use rand::Rng;
use rand::distributions::Uniform;
use rand_distr::Normal;
use serde::{Deserialize, Serialize};

use crate::graph::ConfigurationError;

/// How a freshly allocated parameter is filled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Initializer {
    Constant(f32),
    GlorotNormal,
    GlorotUniform,
    /// Zero-mean normal with `std = sqrt(2 / fan_in)`, suited to ReLU layers.
    HeNormal,
    Gaussian { mean: f32, std: f32 },
    Uniform { min: f32, max: f32 },
}

impl Default for Initializer {
    fn default() -> Self {
        Initializer::GlorotNormal
    }
}

fn fans(shape: &[usize]) -> (f32, f32) {
    match shape {
        [] => (1.0, 1.0),
        [n] => (*n as f32, *n as f32),
        [fan_in, fan_out, rest @ ..] => {
            let receptive: usize = rest.iter().product();
            ((fan_in * receptive) as f32, (fan_out * receptive) as f32)
        }
    }
}

impl Initializer {
    pub fn fill(
        &self,
        shape: &[usize],
        rng: &mut impl Rng,
    ) -> Result<ArrayD<f32>, ConfigurationError> {
        let dim = IxDyn(shape);
        let (fan_in, fan_out) = fans(shape);
        let invalid = |name: &str, value: f32| ConfigurationError::InvalidHyperparameter {
            name: name.to_string(),
            value,
        };
        Ok(match self {
            Initializer::Constant(value) => ArrayD::from_elem(dim, *value),
            Initializer::GlorotNormal => {
                let std = (2.0 / (fan_in + fan_out)).sqrt();
                let dist = Normal::new(0.0, std).map_err(|_| invalid("std", std))?;
                ArrayD::from_shape_fn(dim, |_| rng.sample(dist))
            }
            Initializer::GlorotUniform => {
                let limit = (6.0 / (fan_in + fan_out)).sqrt();
                let dist = Uniform::new_inclusive(-limit, limit);
                ArrayD::from_shape_fn(dim, |_| rng.sample(dist))
            }
            Initializer::HeNormal => {
                let std = (2.0 / fan_in).sqrt();
                let dist = Normal::new(0.0, std).map_err(|_| invalid("std", std))?;
                ArrayD::from_shape_fn(dim, |_| rng.sample(dist))
            }
            Initializer::Gaussian { mean, std } => {
                let dist = Normal::new(*mean, *std).map_err(|_| invalid("std", *std))?;
                ArrayD::from_shape_fn(dim, |_| rng.sample(dist))
            }
            Initializer::Uniform { min, max } => {
                if !(min < max) {
                    return Err(invalid("max", *max));
                }
                let dist = Uniform::new(*min, *max);
                ArrayD::from_shape_fn(dim, |_| rng.sample(dist))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn std_dev(values: &ArrayD<f32>) -> f32 {
        let mean = values.mean().unwrap_or(0.0);
        (values.mapv(|v| (v - mean) * (v - mean)).sum() / values.len() as f32).sqrt()
    }

    #[test]
    fn test_he_normal_scales_with_fan_in() {
        let mut rng = StdRng::seed_from_u64(7);
        let values = Initializer::HeNormal.fill(&[200, 100], &mut rng).unwrap();
        assert_eq!(values.shape(), &[200, 100]);
        let expected = (2.0f32 / 200.0).sqrt();
        assert!((std_dev(&values) - expected).abs() < 0.1 * expected);

        let glorot = Initializer::GlorotNormal.fill(&[200, 100], &mut rng).unwrap();
        assert!(std_dev(&glorot) < std_dev(&values));
    }

    #[test]
    fn test_invalid_uniform_range_is_rejected() {
        let mut rng = StdRng::seed_from_u64(7);
        assert!(matches!(
            Initializer::Uniform { min: 1.0, max: 1.0 }.fill(&[2], &mut rng),
            Err(ConfigurationError::InvalidHyperparameter { .. })
        ));
    }
}
