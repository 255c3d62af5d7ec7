//! Activation functions and their kernels.

use serde::{Deserialize, Serialize};

use crate::substrate::{slot_index, KernelSource, LANES};

const LEAKY_SLOPE: f32 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Activation {
    #[default]
    Linear,
    Relu,
    LeakyRelu,
    Sigmoid,
    Tanh,
    Elu,
}

impl Activation {
    pub fn name(self) -> &'static str {
        match self {
            Activation::Linear => "linear",
            Activation::Relu => "relu",
            Activation::LeakyRelu => "leakyRelu",
            Activation::Sigmoid => "sigmoid",
            Activation::Tanh => "tanh",
            Activation::Elu => "elu",
        }
    }

    #[inline]
    pub fn apply(self, x: f32) -> f32 {
        match self {
            Activation::Linear => x,
            Activation::Relu => x.max(0.0),
            Activation::LeakyRelu => {
                if x > 0.0 {
                    x
                } else {
                    LEAKY_SLOPE * x
                }
            }
            Activation::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            Activation::Tanh => x.tanh(),
            Activation::Elu => {
                if x > 0.0 {
                    x
                } else {
                    x.exp() - 1.0
                }
            }
        }
    }

    /// `f'(pre)`, using the already computed `out = f(pre)` where cheaper.
    #[inline]
    pub fn derivative(self, pre: f32, out: f32) -> f32 {
        match self {
            Activation::Linear => 1.0,
            Activation::Relu => {
                if pre > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Activation::LeakyRelu => {
                if pre > 0.0 {
                    1.0
                } else {
                    LEAKY_SLOPE
                }
            }
            Activation::Sigmoid => out * (1.0 - out),
            Activation::Tanh => 1.0 - out * out,
            Activation::Elu => {
                if pre > 0.0 {
                    1.0
                } else {
                    out + 1.0
                }
            }
        }
    }

    /// `f(pre)` for active slots, zero elsewhere. Uniform `active`.
    pub fn forward_kernel(self) -> KernelSource {
        KernelSource::new(format!("activate-{}", self.name()), 1, &["active"], move |frag| {
            let active = frag.scalar(0) as usize;
            let pre = frag.here(0);
            let mut out = [0.0; LANES];
            for lane in 0..LANES {
                if slot_index(frag.x, frag.y, lane, frag.side()) < active {
                    out[lane] = self.apply(pre[lane]);
                }
            }
            out
        })
    }

    /// `upstream ⊙ f'(pre)` for active slots. Inputs: upstream delta,
    /// pre-activation, output.
    pub fn derivative_kernel(self) -> KernelSource {
        KernelSource::new(
            format!("derivative-{}", self.name()),
            3,
            &["active"],
            move |frag| {
                let active = frag.scalar(0) as usize;
                let (up, pre, out) = (frag.here(0), frag.here(1), frag.here(2));
                let mut delta = [0.0; LANES];
                for lane in 0..LANES {
                    if slot_index(frag.x, frag.y, lane, frag.side()) < active {
                        delta[lane] = up[lane] * self.derivative(pre[lane], out[lane]);
                    }
                }
                delta
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [Activation; 6] = [
        Activation::Linear,
        Activation::Relu,
        Activation::LeakyRelu,
        Activation::Sigmoid,
        Activation::Tanh,
        Activation::Elu,
    ];

    #[test]
    fn test_derivatives_match_finite_differences() {
        let h = 1e-3;
        for activation in ALL {
            for &x in &[-1.3f32, -0.4, 0.35, 1.7] {
                let numeric = (activation.apply(x + h) - activation.apply(x - h)) / (2.0 * h);
                let analytic = activation.derivative(x, activation.apply(x));
                assert!(
                    (numeric - analytic).abs() < 1e-2,
                    "{}: {numeric} vs {analytic} at {x}",
                    activation.name()
                );
            }
        }
    }

    #[test]
    fn test_serde_names() {
        let parsed: Activation = serde_json::from_str("\"leakyRelu\"").unwrap();
        assert_eq!(parsed, Activation::LeakyRelu);
        assert_eq!(serde_json::to_string(&Activation::Elu).unwrap(), "\"elu\"");
    }
}
