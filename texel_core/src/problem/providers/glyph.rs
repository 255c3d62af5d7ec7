//! Synthetic glyph classification.
//!
//! Each sample is one antialiased signed-distance glyph with a random
//! position, scale, rotation and colour, optionally composited over the
//! problem background. The target is a one-hot class vector; negative
//! samples show no glyph and expect every output to stay low.

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{ConfigurationError, SampleGenerationError};
use crate::layer::capacity;
use crate::problem::{option, GenerationContext, Provider, Sample, SampleMetadata, SuccessCriterion};
use crate::substrate::{BufferSpec, ComputeContext, Kernel, KernelSource, Uniforms, LANES};

pub const NAME: &str = "glyphs";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Shape {
    Circle,
    Square,
    Triangle,
    Cross,
    Ring,
}

impl Shape {
    pub const ALL: [Shape; 5] = [
        Shape::Circle,
        Shape::Square,
        Shape::Triangle,
        Shape::Cross,
        Shape::Ring,
    ];

    fn code(self) -> f32 {
        match self {
            Shape::Circle => 0.0,
            Shape::Square => 1.0,
            Shape::Triangle => 2.0,
            Shape::Cross => 3.0,
            Shape::Ring => 4.0,
        }
    }
}

fn box_distance(px: f32, py: f32, bx: f32, by: f32) -> f32 {
    let (dx, dy) = (px.abs() - bx, py.abs() - by);
    let outside = (dx.max(0.0).powi(2) + dy.max(0.0).powi(2)).sqrt();
    outside + dx.max(dy).min(0.0)
}

fn triangle_distance(px: f32, py: f32, r: f32) -> f32 {
    let k = 3f32.sqrt();
    let (mut x, mut y) = (px.abs() - r, py + r / k);
    if x + k * y > 0.0 {
        let (nx, ny) = ((x - k * y) / 2.0, (-k * x - y) / 2.0);
        x = nx;
        y = ny;
    }
    x -= x.clamp(-2.0 * r, 0.0);
    -(x * x + y * y).sqrt() * y.signum()
}

/// Signed distance of glyph `shape` at local position `(x, y)`; the glyph
/// spans roughly `[-1, 1]²`.
pub fn distance(shape: usize, x: f32, y: f32) -> f32 {
    match shape {
        0 => (x * x + y * y).sqrt() - 0.8,
        1 => box_distance(x, y, 0.7, 0.7),
        2 => triangle_distance(x, y, 0.85),
        3 => box_distance(x, y, 0.85, 0.22).min(box_distance(x, y, 0.22, 0.85)),
        _ => ((x * x + y * y).sqrt() - 0.6).abs() - 0.18,
    }
}

fn glyph_kernel() -> KernelSource {
    KernelSource::new("glyph", 0, &["shape", "placement", "color"], |frag| {
        let shape = frag.scalar(0) as usize;
        let placement = frag.vector(1);
        let color = frag.vector(2);
        let (cx, cy, half, angle) = (placement[0], placement[1], placement[2], placement[3]);
        let (u, v) = frag.uv();
        let (sin, cos) = angle.sin_cos();
        let (dx, dy) = ((u - cx) / half, (v - cy) / half);
        let (x, y) = (cos * dx + sin * dy, -sin * dx + cos * dy);
        let pixel = 1.0 / (frag.side() as f32 * half);
        let coverage = (0.5 - distance(shape, x, y) / pixel).clamp(0.0, 1.0);
        [color[0], color[1], color[2], coverage]
    })
}

#[derive(Debug, Clone, PartialEq)]
struct GlyphOptions {
    size: usize,
    shapes: Vec<Shape>,
    composite: bool,
    negatives: f32,
    clamp: bool,
    min_scale: f32,
    max_scale: f32,
    jitter: f32,
}

impl Default for GlyphOptions {
    fn default() -> Self {
        Self {
            size: 16,
            shapes: Shape::ALL.to_vec(),
            composite: true,
            negatives: 0.0,
            clamp: false,
            min_scale: 0.45,
            max_scale: 0.9,
            jitter: 0.15,
        }
    }
}

#[derive(Debug)]
pub struct Glyphs {
    options: GlyphOptions,
    output_side: usize,
    kernel: Option<Kernel>,
}

impl Glyphs {
    pub fn from_options(table: &toml::Table) -> Result<Self, ConfigurationError> {
        let defaults = GlyphOptions::default();
        let options = GlyphOptions {
            size: option(table, NAME, "size", defaults.size)?,
            shapes: option(table, NAME, "shapes", defaults.shapes)?,
            composite: option(table, NAME, "composite", defaults.composite)?,
            negatives: option(table, NAME, "negatives", defaults.negatives)?,
            clamp: option(table, NAME, "clamp", defaults.clamp)?,
            min_scale: option(table, NAME, "min_scale", defaults.min_scale)?,
            max_scale: option(table, NAME, "max_scale", defaults.max_scale)?,
            jitter: option(table, NAME, "jitter", defaults.jitter)?,
        };
        let invalid = |reason: &str| ConfigurationError::InvalidProviderOptions {
            provider: NAME.into(),
            reason: reason.into(),
        };
        if options.size < 4 {
            return Err(invalid("size must be at least 4"));
        }
        if options.shapes.is_empty() {
            return Err(invalid("at least one shape is required"));
        }
        if !(0.0..=1.0).contains(&options.negatives) {
            return Err(invalid("negatives must be a probability"));
        }
        if !(options.min_scale > 0.0 && options.min_scale <= options.max_scale) {
            return Err(invalid("scales must satisfy 0 < min_scale <= max_scale"));
        }
        let pixels = options.shapes.len().div_ceil(LANES);
        let mut output_side = 1;
        while output_side * output_side < pixels {
            output_side += 1;
        }
        Ok(Self {
            options,
            output_side,
            kernel: None,
        })
    }

    pub fn classes(&self) -> &[Shape] {
        &self.options.shapes
    }
}

impl Provider for Glyphs {
    fn name(&self) -> &str {
        NAME
    }

    fn input_side(&self) -> usize {
        self.options.size
    }

    fn output_side(&self) -> usize {
        self.output_side
    }

    fn output_neurons(&self) -> usize {
        self.options.shapes.len()
    }

    fn prepare(&mut self, ctx: &ComputeContext) -> Result<(), SampleGenerationError> {
        self.kernel = Some(ctx.device.compile(glyph_kernel())?);
        Ok(())
    }

    fn generate_sample(
        &self,
        ctx: &mut GenerationContext<'_>,
        _is_test: bool,
    ) -> Result<Sample, SampleGenerationError> {
        let kernel = self
            .kernel
            .as_ref()
            .ok_or_else(|| SampleGenerationError::Provider {
                provider: NAME.into(),
                reason: "generate_sample called before prepare".into(),
            })?;
        let compute = ctx.compute;
        let side = self.options.size;
        let classes = self.options.shapes.len();
        let mut sample = Sample::allocate(compute, side, self.output_side)?;
        let mut glyph = compute.device.allocate(BufferSpec::new(side))?;

        let negative = self.options.negatives > 0.0 && ctx.rng.gen::<f32>() < self.options.negatives;
        let label = if negative {
            None
        } else {
            let label = ctx.rng.gen_range(0..classes);
            let half = ctx.rng.gen_range(self.options.min_scale..=self.options.max_scale) / 2.0;
            let jitter = self.options.jitter;
            let placement = vec![
                0.5 + ctx.rng.gen_range(-jitter..=jitter),
                0.5 + ctx.rng.gen_range(-jitter..=jitter),
                half,
                ctx.rng.gen_range(0.0..std::f32::consts::TAU),
            ];
            let color = vec![
                ctx.rng.gen_range(0.5..=1.0),
                ctx.rng.gen_range(0.5..=1.0),
                ctx.rng.gen_range(0.5..=1.0),
                1.0,
            ];
            compute.device.run(
                kernel,
                &[],
                &mut glyph,
                &Uniforms::new()
                    .scalar("shape", self.options.shapes[label].code())
                    .vector("placement", placement)
                    .vector("color", color),
            )?;
            Some(label)
        };

        let black;
        let background = match ctx.background {
            Some(background) if self.options.composite => background,
            _ => {
                black = compute.device.allocate(BufferSpec::new(side))?;
                &black
            }
        };
        compute.device.run(
            &compute.kernels.composite,
            &[&glyph, background],
            &mut sample.input,
            &Uniforms::new(),
        )?;

        let mut expected = vec![0.0; capacity(self.output_side)];
        if let Some(label) = label {
            expected[label] = 1.0;
        }
        sample.expected.upload(&expected)?;
        let mask = vec![1.0; classes];
        sample.delta_mask.upload(&mask)?;
        if self.options.clamp {
            sample.clamp_mask.upload(&mask)?;
        }
        sample.metadata = SampleMetadata { label, negative };
        Ok(sample)
    }

    fn success_criterion(&self) -> SuccessCriterion {
        SuccessCriterion::Argmax
    }

    fn export_metadata(&self) -> serde_json::Value {
        json!({
            "provider": NAME,
            "classes": self.options.shapes,
            "inputSize": self.options.size,
            "negatives": self.options.negatives > 0.0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_distances_are_negative_inside() {
        for shape in 0..5 {
            let centre = distance(shape, 0.0, 0.0);
            let far = distance(shape, 3.0, 3.0);
            assert!(far > 0.0, "shape {shape}");
            if shape != 4 {
                assert!(centre < 0.0, "shape {shape}");
            } else {
                assert!(centre > 0.0, "ring is hollow");
                assert!(distance(shape, 0.6, 0.0) < 0.0);
            }
        }
    }

    #[test]
    fn test_output_side_fits_classes() {
        let glyphs = Glyphs::from_options(&toml::Table::new()).unwrap();
        assert_eq!(glyphs.output_neurons(), 5);
        assert_eq!(glyphs.output_side(), 2);

        let mut options = toml::Table::new();
        options.insert(
            "shapes".into(),
            toml::Value::Array(vec!["circle".into(), "cross".into()]),
        );
        let glyphs = Glyphs::from_options(&options).unwrap();
        assert_eq!(glyphs.classes(), &[Shape::Circle, Shape::Cross]);
        assert_eq!(glyphs.output_side(), 1);
    }

    #[test]
    fn test_sample_has_one_hot_target_and_visible_glyph() {
        let compute = ComputeContext::new("test").unwrap();
        let mut glyphs = Glyphs::from_options(&toml::Table::new()).unwrap();
        glyphs.prepare(&compute).unwrap();
        let mut rng = StdRng::seed_from_u64(11);
        let mut ctx = GenerationContext {
            compute: &compute,
            rng: &mut rng,
            background: None,
            index: 0,
        };
        let sample = glyphs.generate_sample(&mut ctx, false).unwrap();
        let label = sample.metadata.label.unwrap();
        let expected = sample.expected.to_vec();
        assert_eq!(expected.iter().sum::<f32>(), 1.0);
        assert_eq!(expected[label], 1.0);
        assert_eq!(sample.delta_mask.to_vec()[..5], [1.0; 5]);
        assert_eq!(sample.delta_mask.to_vec()[5], 0.0);
        let lit = sample.input.to_vec().chunks(4).filter(|t| t[0] > 0.25).count();
        assert!(lit > 8, "only {lit} glyph pixels");
    }

    #[test]
    fn test_negative_samples_expect_nothing() {
        let compute = ComputeContext::new("test").unwrap();
        let mut options = toml::Table::new();
        options.insert("negatives".into(), toml::Value::Float(1.0));
        let mut glyphs = Glyphs::from_options(&options).unwrap();
        glyphs.prepare(&compute).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        let mut ctx = GenerationContext {
            compute: &compute,
            rng: &mut rng,
            background: None,
            index: 0,
        };
        let sample = glyphs.generate_sample(&mut ctx, true).unwrap();
        assert!(sample.metadata.negative);
        assert!(sample.expected.to_vec().iter().all(|&v| v == 0.0));
        assert!(sample.input.to_vec().chunks(4).all(|t| t[0] == 0.0));
    }
}
