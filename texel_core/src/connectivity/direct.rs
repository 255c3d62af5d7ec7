//! One weight per neuron: `out = bias + w ⊙ a`.

use super::{Geometry, WeightInit, Wiring};
use crate::substrate::{KernelSource, LANES};

pub(super) fn geometry(side: usize) -> Geometry {
    Geometry::new(side, side, side, 1)
}

pub(super) fn wiring() -> Wiring {
    let forward = KernelSource::new("direct-forward", 3, &[], |frag| {
        let (a, b, w) = (frag.here(0), frag.here(1), frag.here(2));
        let mut out = [0.0; LANES];
        for lane in 0..LANES {
            out[lane] = b[lane] + w[lane] * a[lane];
        }
        out
    });

    let backward = KernelSource::new("direct-backward", 2, &[], |frag| {
        let (d, w) = (frag.here(0), frag.here(1));
        [d[0] * w[0], d[1] * w[1], d[2] * w[2], d[3] * w[3]]
    });

    let gradient = KernelSource::new("direct-gradient", 3, &[], |frag| {
        let (d, a, mut g) = (frag.here(0), frag.here(1), frag.here(2));
        for lane in 0..LANES {
            g[lane] += d[lane] * a[lane];
        }
        g
    });

    Wiring::untabled(forward, backward, gradient, WeightInit::Constant(1.0))
}
