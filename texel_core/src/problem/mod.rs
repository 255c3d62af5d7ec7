//! Training problems: sample providers, the sample pool and backgrounds.
//!
//! A [`Provider`] synthesises samples on demand. Providers are created by
//! name through a [`ProviderRegistry`] that the trainer receives explicitly,
//! so applications can register their own alongside the built-ins.

pub mod background;
pub mod pool;
pub mod providers;

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

pub use background::{BackgroundKind, BackgroundSource};
pub use pool::SamplePool;

use crate::error::{ConfigurationError, SampleGenerationError};
use crate::substrate::{expect_side, Buffer, BufferSpec, ComputeContext};

/// Descriptive data carried alongside a sample.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SampleMetadata {
    /// Class index for classification problems.
    pub label: Option<usize>,
    /// The sample shows nothing the network should detect.
    pub negative: bool,
}

/// One training or test example.
#[derive(Debug, Clone)]
pub struct Sample {
    pub input: Buffer,
    pub expected: Buffer,
    /// 1 where the output slot contributes to delta and error.
    pub delta_mask: Buffer,
    /// 1 where the expected value is a one-sided target.
    pub clamp_mask: Buffer,
    pub metadata: SampleMetadata,
}

impl Sample {
    /// Allocates zeroed buffers for a sample.
    pub fn allocate(
        ctx: &ComputeContext,
        input_side: usize,
        output_side: usize,
    ) -> Result<Self, SampleGenerationError> {
        let output = BufferSpec::new(output_side);
        Ok(Self {
            input: ctx.device.allocate(BufferSpec::new(input_side).interpolated())?,
            expected: ctx.device.allocate(output)?,
            delta_mask: ctx.device.allocate(output)?,
            clamp_mask: ctx.device.allocate(output)?,
            metadata: SampleMetadata::default(),
        })
    }
}

/// How a test output is judged correct.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum SuccessCriterion {
    /// The highest masked output must sit where the highest expected value
    /// is. With an all-zero target every masked output must stay below 0.5.
    Argmax,
    /// Every masked output must fall on the same side of `threshold` as its
    /// expected value.
    Threshold { threshold: f32 },
}

impl SuccessCriterion {
    pub fn is_success(&self, output: &[f32], expected: &[f32], mask: &[f32]) -> bool {
        let masked = || {
            (0..output.len().min(expected.len()).min(mask.len())).filter(|&slot| mask[slot] > 0.0)
        };
        match *self {
            SuccessCriterion::Threshold { threshold } => {
                masked().all(|slot| (output[slot] >= threshold) == (expected[slot] >= threshold))
            }
            SuccessCriterion::Argmax => {
                let target = masked().fold(None, |best: Option<usize>, slot| match best {
                    Some(b) if expected[b] >= expected[slot] => Some(b),
                    _ => Some(slot),
                });
                let Some(target) = target else {
                    return true;
                };
                if expected[target] <= 0.0 {
                    return masked().all(|slot| output[slot] < 0.5);
                }
                let predicted = masked().fold(target, |best, slot| {
                    if output[slot] > output[best] {
                        slot
                    } else {
                        best
                    }
                });
                predicted == target
            }
        }
    }
}

/// Everything a provider may use while generating one sample.
pub struct GenerationContext<'a> {
    pub compute: &'a ComputeContext,
    pub rng: &'a mut StdRng,
    /// Procedural background for this sample, if the problem has one.
    pub background: Option<&'a Buffer>,
    /// Position of the sample in the training stream or test set.
    pub index: usize,
}

/// A source of samples.
pub trait Provider: Send {
    fn name(&self) -> &str;

    fn input_side(&self) -> usize;

    fn output_side(&self) -> usize;

    /// Output slots that carry targets.
    fn output_neurons(&self) -> usize;

    /// One-time setup against the compute context (kernel compilation).
    fn prepare(&mut self, _ctx: &ComputeContext) -> Result<(), SampleGenerationError> {
        Ok(())
    }

    fn generate_sample(
        &self,
        ctx: &mut GenerationContext<'_>,
        is_test: bool,
    ) -> Result<Sample, SampleGenerationError>;

    fn success_criterion(&self) -> SuccessCriterion;

    /// Metadata copied into exported models (class names and the like).
    fn export_metadata(&self) -> serde_json::Value;
}

/// Builds a provider from its `[problem.options]` table.
pub type ProviderFactory =
    Box<dyn Fn(&toml::Table) -> Result<Box<dyn Provider>, ConfigurationError> + Send + Sync>;

/// Name → factory map of available providers.
pub struct ProviderRegistry {
    factories: BTreeMap<String, ProviderFactory>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ProviderRegistry {
    /// A registry with no providers.
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// A registry with the built-in providers.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register(providers::xor::NAME, |options| {
            Ok(Box::new(providers::XorLike::from_options(options)?))
        });
        registry.register(providers::glyph::NAME, |options| {
            Ok(Box::new(providers::Glyphs::from_options(options)?))
        });
        registry
    }

    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&toml::Table) -> Result<Box<dyn Provider>, ConfigurationError> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Box::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub fn create(
        &self,
        name: &str,
        options: &toml::Table,
    ) -> Result<Box<dyn Provider>, ConfigurationError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| ConfigurationError::UnknownProvider(name.to_string()))?;
        factory(options)
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// Pool parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub size: usize,
    pub max_uses: usize,
}

/// A provider wired to its pool, backgrounds and random streams.
pub struct Problem {
    provider: Box<dyn Provider>,
    pool: Option<SamplePool>,
    backgrounds: Option<BackgroundSource>,
    background: Option<Buffer>,
    rng: StdRng,
    draws: usize,
    test_samples: usize,
    test_seed: u64,
}

impl std::fmt::Debug for Problem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Problem")
            .field("provider", &self.provider.name())
            .field("draws", &self.draws)
            .field("test_samples", &self.test_samples)
            .finish()
    }
}

impl Problem {
    pub fn new(
        provider: Box<dyn Provider>,
        pool: Option<PoolConfig>,
        backgrounds: Option<BackgroundKind>,
        test_samples: usize,
        seed: u64,
        test_seed: u64,
    ) -> Self {
        let side = provider.input_side();
        Self {
            provider,
            pool: pool.map(|config| SamplePool::new(config.size, config.max_uses)),
            backgrounds: backgrounds.map(|kind| BackgroundSource::new(kind, side)),
            background: None,
            rng: StdRng::seed_from_u64(seed),
            draws: 0,
            test_samples,
            test_seed,
        }
    }

    pub fn provider(&self) -> &dyn Provider {
        self.provider.as_ref()
    }

    pub fn test_samples(&self) -> usize {
        self.test_samples
    }

    pub fn draws(&self) -> usize {
        self.draws
    }

    /// Compiles provider kernels and allocates the background buffer.
    pub fn prepare(&mut self, ctx: &ComputeContext) -> Result<(), SampleGenerationError> {
        self.provider.prepare(ctx)?;
        if self.backgrounds.is_some() {
            self.background = Some(
                ctx.device
                    .allocate(BufferSpec::new(self.provider.input_side()).interpolated())?,
            );
        }
        Ok(())
    }

    /// Restarts the training stream from `seed` and empties the pool.
    pub fn reset(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
        self.draws = 0;
        if let Some(pool) = &mut self.pool {
            pool.clear();
        }
    }

    /// Next training sample, pooled when a pool is configured.
    pub fn next_sample(&mut self, ctx: &ComputeContext) -> Result<Sample, SampleGenerationError> {
        let index = self.draws;
        self.draws += 1;
        let Self {
            provider,
            pool,
            backgrounds,
            background,
            rng,
            ..
        } = self;
        let mut generate = |rng: &mut StdRng| {
            generate_one(
                ctx,
                provider.as_ref(),
                backgrounds.as_ref(),
                background.as_mut(),
                rng,
                index,
                false,
            )
        };
        match pool {
            Some(pool) => pool.draw(rng, &mut generate),
            None => generate(rng),
        }
    }

    /// The held-out set, regenerated from the fixed test seed on every call.
    pub fn test_set(&mut self, ctx: &ComputeContext) -> Result<Vec<Sample>, SampleGenerationError> {
        let mut rng = StdRng::seed_from_u64(self.test_seed);
        (0..self.test_samples)
            .map(|index| {
                generate_one(
                    ctx,
                    self.provider.as_ref(),
                    self.backgrounds.as_ref(),
                    self.background.as_mut(),
                    &mut rng,
                    index,
                    true,
                )
            })
            .collect()
    }
}

fn generate_one(
    ctx: &ComputeContext,
    provider: &dyn Provider,
    backgrounds: Option<&BackgroundSource>,
    background: Option<&mut Buffer>,
    rng: &mut StdRng,
    index: usize,
    is_test: bool,
) -> Result<Sample, SampleGenerationError> {
    let background = match (backgrounds, background) {
        (Some(source), Some(buffer)) => {
            source.render(ctx, rng, buffer)?;
            Some(&*buffer)
        }
        _ => None,
    };
    let mut generation = GenerationContext {
        compute: ctx,
        rng,
        background,
        index,
    };
    let sample = provider.generate_sample(&mut generation, is_test)?;
    check_shape(provider, &sample)?;
    Ok(sample)
}

fn check_shape(provider: &dyn Provider, sample: &Sample) -> Result<(), SampleGenerationError> {
    let shape = |buffer: &Buffer, expected: usize, name: &'static str| {
        expect_side(buffer, expected, name).map_err(|_| SampleGenerationError::Shape {
            provider: provider.name().to_string(),
            buffer: name,
            expected,
            got: buffer.side(),
        })
    };
    shape(&sample.input, provider.input_side(), "input")?;
    shape(&sample.expected, provider.output_side(), "expected")?;
    shape(&sample.delta_mask, provider.output_side(), "delta mask")?;
    shape(&sample.clamp_mask, provider.output_side(), "clamp mask")
}

/// Reads a typed option with a default.
pub(crate) fn option<T>(
    options: &toml::Table,
    provider: &str,
    key: &str,
    default: T,
) -> Result<T, ConfigurationError>
where
    T: serde::de::DeserializeOwned,
{
    match options.get(key) {
        None => Ok(default),
        Some(value) => value.clone().try_into().map_err(|err: toml::de::Error| {
            ConfigurationError::InvalidProviderOptions {
                provider: provider.to_string(),
                reason: format!("option '{key}': {}", err.message()),
            }
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_criterion() {
        let criterion = SuccessCriterion::Threshold { threshold: 0.5 };
        let mask = [1.0, 1.0, 0.0, 0.0];
        assert!(criterion.is_success(&[0.9, 0.1, 0.9, 0.9], &[1.0, 0.0, 0.0, 0.0], &mask));
        assert!(!criterion.is_success(&[0.4, 0.1, 0.0, 0.0], &[1.0, 0.0, 0.0, 0.0], &mask));
    }

    #[test]
    fn test_argmax_criterion() {
        let criterion = SuccessCriterion::Argmax;
        let mask = [1.0, 1.0, 1.0, 0.0];
        assert!(criterion.is_success(&[0.2, 0.3, 0.1, 9.0], &[0.0, 1.0, 0.0, 0.0], &mask));
        assert!(!criterion.is_success(&[0.4, 0.3, 0.1, 0.0], &[0.0, 1.0, 0.0, 0.0], &mask));
        // negatives: nothing may fire
        assert!(criterion.is_success(&[0.2, 0.3, 0.1, 0.0], &[0.0; 4], &mask));
        assert!(!criterion.is_success(&[0.2, 0.6, 0.1, 0.0], &[0.0; 4], &mask));
    }

    #[test]
    fn test_registry_rejects_unknown_provider() {
        let registry = ProviderRegistry::with_builtins();
        assert!(registry.contains("xorLike"));
        assert!(registry.contains("glyphs"));
        assert_eq!(
            registry.create("mnist", &toml::Table::new()).err(),
            Some(ConfigurationError::UnknownProvider("mnist".into()))
        );
    }

    #[test]
    fn test_test_set_is_reproducible() {
        let ctx = ComputeContext::new("test").unwrap();
        let registry = ProviderRegistry::with_builtins();
        let mut options = toml::Table::new();
        options.insert("size".into(), toml::Value::Integer(8));
        let provider = registry.create("glyphs", &options).unwrap();
        let mut problem = Problem::new(provider, None, Some(BackgroundKind::Noise), 3, 1, 99);
        problem.prepare(&ctx).unwrap();
        let first = problem.test_set(&ctx).unwrap();
        problem.next_sample(&ctx).unwrap();
        let second = problem.test_set(&ctx).unwrap();
        assert_eq!(first.len(), 3);
        for (a, b) in first.iter().zip(&second) {
            assert_eq!(a.input.to_vec(), b.input.to_vec());
            assert_eq!(a.expected.to_vec(), b.expected.to_vec());
        }
    }
}
