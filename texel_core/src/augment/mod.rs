//! Stochastic augmentation of training inputs.
//!
//! A pipeline is an ordered list of passes. For every sample each pass is
//! triggered independently with its own probability; a triggered pass reads
//! the current image and renders the next one, a skipped pass does nothing.
//! Test samples are never augmented.

mod passes;

use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

pub use passes::inverse_affine;
use passes::Pass;

use crate::error::{ConfigurationError, DeviceError};
use crate::problem::BackgroundKind;
use crate::substrate::{expect_side, Buffer, BufferSpec, ComputeContext, PingPong};

fn default_probability() -> f32 {
    1.0
}

fn default_scale() -> [f32; 2] {
    [1.0, 1.0]
}

fn default_zero_range() -> [f32; 2] {
    [0.0, 0.0]
}

fn default_fields() -> usize {
    4
}

fn default_radius() -> [f32; 2] {
    [0.1, 0.25]
}

/// What a pass does, with its random ranges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum AugmentationKind {
    /// Alpha-blend the image over a fresh random background.
    Composite {
        #[serde(default)]
        background: BackgroundKind,
    },
    /// Random scale, rotation (degrees), translation (fraction of the side)
    /// and horizontal flip.
    Affine {
        #[serde(default = "default_scale")]
        scale: [f32; 2],
        #[serde(default = "default_zero_range")]
        rotation: [f32; 2],
        #[serde(default)]
        translation: f32,
        #[serde(default)]
        flip: bool,
    },
    /// Gaussian blur with sigma (pixels) drawn from the range.
    Blur { sigma: [f32; 2] },
    /// Summed Gaussian displacement fields applied as a lookup offset.
    Elastic {
        #[serde(default = "default_fields")]
        fields: usize,
        /// Peak displacement per field, as a fraction of the side.
        magnitude: f32,
        #[serde(default = "default_radius")]
        radius: [f32; 2],
    },
    /// Hue rotation (fraction of a turn), gamma and luminosity deltas.
    ColorJitter {
        #[serde(default)]
        hue: f32,
        #[serde(default)]
        gamma: f32,
        #[serde(default)]
        luminosity: f32,
    },
}

impl AugmentationKind {
    pub fn name(&self) -> &'static str {
        match self {
            AugmentationKind::Composite { .. } => "composite",
            AugmentationKind::Affine { .. } => "affine",
            AugmentationKind::Blur { .. } => "blur",
            AugmentationKind::Elastic { .. } => "elastic",
            AugmentationKind::ColorJitter { .. } => "colorJitter",
        }
    }
}

/// One declared pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AugmentationSpec {
    #[serde(flatten)]
    pub kind: AugmentationKind,
    #[serde(default = "default_probability")]
    pub probability: f32,
}

impl AugmentationSpec {
    pub fn new(kind: AugmentationKind) -> Self {
        Self {
            kind,
            probability: 1.0,
        }
    }

    pub fn with_probability(mut self, probability: f32) -> Self {
        self.probability = probability;
        self
    }

    pub fn validate(&self, index: usize) -> Result<(), ConfigurationError> {
        let name = |field: &str| format!("augmentation[{index}].{field}");
        let range = |field: &str, r: [f32; 2], min: f32| {
            if r[0] < min || r[1] < r[0] || !r.iter().all(|v| v.is_finite()) {
                Err(ConfigurationError::parameter(
                    name(field),
                    format!("{r:?}"),
                    format!("{min} <= low <= high"),
                ))
            } else {
                Ok(())
            }
        };
        if !(0.0..=1.0).contains(&self.probability) {
            return Err(ConfigurationError::parameter(
                name("probability"),
                self.probability,
                "0 <= probability <= 1",
            ));
        }
        match &self.kind {
            AugmentationKind::Composite { .. } => Ok(()),
            AugmentationKind::Affine {
                scale,
                rotation,
                translation,
                ..
            } => {
                if scale[0] <= 0.0 {
                    return Err(ConfigurationError::parameter(
                        name("scale"),
                        format!("{scale:?}"),
                        "scale > 0",
                    ));
                }
                range("scale", *scale, 0.0)?;
                range("rotation", *rotation, f32::MIN)?;
                if !(0.0..=1.0).contains(translation) {
                    return Err(ConfigurationError::parameter(
                        name("translation"),
                        translation,
                        "0 <= translation <= 1",
                    ));
                }
                Ok(())
            }
            AugmentationKind::Blur { sigma } => range("sigma", *sigma, 0.0),
            AugmentationKind::Elastic {
                fields,
                magnitude,
                radius,
            } => {
                if *fields == 0 {
                    return Err(ConfigurationError::parameter(name("fields"), fields, "fields >= 1"));
                }
                if !(*magnitude >= 0.0) {
                    return Err(ConfigurationError::parameter(
                        name("magnitude"),
                        magnitude,
                        "magnitude >= 0",
                    ));
                }
                range("radius", *radius, f32::MIN_POSITIVE)
            }
            AugmentationKind::ColorJitter {
                hue,
                gamma,
                luminosity,
            } => {
                for (field, value) in [("hue", hue), ("gamma", gamma), ("luminosity", luminosity)] {
                    if !(*value >= 0.0) {
                        return Err(ConfigurationError::parameter(name(field), value, ">= 0"));
                    }
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug)]
struct Stage {
    probability: f32,
    name: &'static str,
    pass: Pass,
}

/// Compiled pipeline for inputs of one side.
#[derive(Debug)]
pub struct AugmentationPipeline {
    side: usize,
    stages: Vec<Stage>,
    images: PingPong,
}

impl AugmentationPipeline {
    pub fn new(ctx: &ComputeContext, specs: &[AugmentationSpec], side: usize) -> Result<Self, DeviceError> {
        let stages = specs
            .iter()
            .map(|spec| {
                Ok(Stage {
                    probability: spec.probability,
                    name: spec.kind.name(),
                    pass: Pass::build(ctx, &spec.kind, side)?,
                })
            })
            .collect::<Result<Vec<_>, DeviceError>>()?;
        Ok(Self {
            side,
            stages,
            images: PingPong::new(&ctx.device, BufferSpec::new(side).interpolated())?,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Augments `image` in place and returns the names of the passes that
    /// fired, in order.
    pub fn apply(
        &mut self,
        ctx: &ComputeContext,
        rng: &mut StdRng,
        image: &mut Buffer,
    ) -> Result<Vec<&'static str>, DeviceError> {
        expect_side(image, self.side, "augmentation input")?;
        let mut fired = Vec::new();
        for stage in &mut self.stages {
            if stage.probability < 1.0 && rng.gen::<f32>() >= stage.probability {
                continue;
            }
            if fired.is_empty() {
                ctx.copy(image, self.images.front_mut())?;
            }
            let (current, next) = self.images.split();
            stage.pass.apply(ctx, rng, current, next)?;
            self.images.swap();
            fired.push(stage.name);
        }
        if !fired.is_empty() {
            ctx.copy(self.images.front(), image)?;
            tracing::trace!(passes = ?fired, "augmented sample");
        }
        Ok(fired)
    }
}
