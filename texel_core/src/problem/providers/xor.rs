//! Two-bit XOR as a four-input, two-output problem.
//!
//! The input layer holds a one-hot code of the bit pair `(a, b)` in four
//! lanes of a single pixel; the two outputs are `a xor b` and its
//! complement. Small enough to train in a handful of minibatches, which makes
//! it the smoke test of the whole pipeline.

use rand::Rng;
use serde_json::json;

use crate::error::{ConfigurationError, SampleGenerationError};
use crate::problem::{option, GenerationContext, Provider, Sample, SampleMetadata, SuccessCriterion};

pub const NAME: &str = "xorLike";

#[derive(Debug, Clone, PartialEq)]
pub struct XorLike {
    random: bool,
    clamp: bool,
}

impl XorLike {
    pub fn new(random: bool, clamp: bool) -> Self {
        Self { random, clamp }
    }

    pub fn from_options(options: &toml::Table) -> Result<Self, ConfigurationError> {
        Ok(Self::new(
            option(options, NAME, "random", false)?,
            option(options, NAME, "clamp", false)?,
        ))
    }

    /// Inputs and targets of pattern `code = 2a + b`.
    pub fn pattern(code: usize) -> ([f32; 4], [f32; 2]) {
        let (a, b) = (code >> 1 & 1, code & 1);
        let mut input = [0.0; 4];
        input[code & 3] = 1.0;
        let xor = (a ^ b) as f32;
        (input, [xor, 1.0 - xor])
    }
}

impl Provider for XorLike {
    fn name(&self) -> &str {
        NAME
    }

    fn input_side(&self) -> usize {
        1
    }

    fn output_side(&self) -> usize {
        1
    }

    fn output_neurons(&self) -> usize {
        2
    }

    fn generate_sample(
        &self,
        ctx: &mut GenerationContext<'_>,
        is_test: bool,
    ) -> Result<Sample, SampleGenerationError> {
        let code = if self.random && !is_test {
            ctx.rng.gen_range(0..4)
        } else {
            ctx.index % 4
        };
        let (input, target) = Self::pattern(code);
        let mut sample = Sample::allocate(ctx.compute, 1, 1)?;
        sample.input.upload(&input)?;
        sample.expected.upload(&target)?;
        sample.delta_mask.upload(&[1.0, 1.0])?;
        if self.clamp {
            sample.clamp_mask.upload(&[1.0, 1.0])?;
        }
        sample.metadata = SampleMetadata {
            label: Some(code),
            negative: false,
        };
        Ok(sample)
    }

    fn success_criterion(&self) -> SuccessCriterion {
        SuccessCriterion::Threshold { threshold: 0.5 }
    }

    fn export_metadata(&self) -> serde_json::Value {
        json!({
            "provider": NAME,
            "inputs": ["00", "01", "10", "11"],
            "outputs": ["xor", "xnor"],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::substrate::ComputeContext;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_patterns() {
        assert_eq!(XorLike::pattern(0), ([1.0, 0.0, 0.0, 0.0], [0.0, 1.0]));
        assert_eq!(XorLike::pattern(1), ([0.0, 1.0, 0.0, 0.0], [1.0, 0.0]));
        assert_eq!(XorLike::pattern(2), ([0.0, 0.0, 1.0, 0.0], [1.0, 0.0]));
        assert_eq!(XorLike::pattern(3), ([0.0, 0.0, 0.0, 1.0], [0.0, 1.0]));
    }

    #[test]
    fn test_cycles_deterministically() {
        let compute = ComputeContext::new("test").unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        let provider = XorLike::new(false, false);
        let labels: Vec<_> = (0..6)
            .map(|index| {
                let mut ctx = GenerationContext {
                    compute: &compute,
                    rng: &mut rng,
                    background: None,
                    index,
                };
                provider
                    .generate_sample(&mut ctx, false)
                    .unwrap()
                    .metadata
                    .label
                    .unwrap()
            })
            .collect();
        assert_eq!(labels, vec![0, 1, 2, 3, 0, 1]);
    }

    #[test]
    fn test_options_are_typed() {
        let mut options = toml::Table::new();
        options.insert("random".into(), toml::Value::String("yes".into()));
        assert!(matches!(
            XorLike::from_options(&options),
            Err(ConfigurationError::InvalidProviderOptions { .. })
        ));
    }
}
