//! Full wiring: weight pixel `i·F² + q` joins destination neuron `i` to the
//! four lanes of source pixel `q`.

use super::addressing::{dot, index, pixel_xy, texel_at};
use super::{Geometry, WeightInit, Wiring};
use crate::error::DeviceError;
use crate::substrate::{BufferSpec, Device, KernelSource, LANES};

pub(super) fn geometry(from: usize, to: usize) -> Geometry {
    Geometry::new(from, to, 2 * from * to, LANES * from * from)
}

pub(super) fn wiring(device: &Device, geometry: Geometry, addressed: bool) -> Result<Wiring, DeviceError> {
    let Geometry { from, to, .. } = geometry;
    let sources = from * from;
    let dests = LANES * to * to;

    let forward = KernelSource::new("full-forward", 3, &[], move |frag| {
        let input = frag.input(0);
        let weights = frag.input(2);
        let mut out = frag.here(1);
        let base = frag.pixel() * LANES;
        for (lane, value) in out.iter_mut().enumerate() {
            let row = (base + lane) * sources;
            let mut sum = 0.0;
            for q in 0..sources {
                let (qx, qy) = pixel_xy(q, from);
                sum += dot(texel_at(weights, row + q), input.texel(qx, qy));
            }
            *value += sum;
        }
        out
    });

    let backward = KernelSource::new("full-backward", 2, &[], move |frag| {
        let delta = frag.input(0);
        let weights = frag.input(1);
        let q = frag.pixel();
        let mut up = [0.0; LANES];
        for i in 0..dests {
            let d = delta.get(i);
            if d == 0.0 {
                continue;
            }
            let w = texel_at(weights, i * sources + q);
            for lane in 0..LANES {
                up[lane] += d * w[lane];
            }
        }
        up
    });

    if !addressed {
        let gradient = KernelSource::new("full-gradient", 3, &[], move |frag| {
            let p = frag.pixel();
            let (i, q) = (p / sources, p % sources);
            let (qx, qy) = pixel_xy(q, from);
            let d = frag.input(0).get(i);
            let a = frag.fetch(1, qx, qy);
            let prev = frag.here(2);
            [
                prev[0] + d * a[0],
                prev[1] + d * a[1],
                prev[2] + d * a[2],
                prev[3] + d * a[3],
            ]
        });
        return Ok(Wiring::untabled(forward, backward, gradient, WeightInit::Xavier));
    }

    // Per weight pixel: (source x, source y, destination neuron).
    let side = geometry.weight_side;
    let mut values = Vec::with_capacity(side * side * LANES);
    for p in 0..side * side {
        let (qx, qy) = pixel_xy(p % sources, from);
        values.extend_from_slice(&[qx as f32, qy as f32, (p / sources) as f32, 0.0]);
    }
    let mut address = device.allocate(BufferSpec::new(side))?;
    address.upload(&values)?;

    let gradient = KernelSource::new("full-npot-gradient", 4, &[], |frag| {
        let entry = frag.here(3);
        let d = frag.input(0).get(index(entry[2]));
        let a = frag.fetch(1, index(entry[0]), index(entry[1]));
        let prev = frag.here(2);
        [
            prev[0] + d * a[0],
            prev[1] + d * a[1],
            prev[2] + d * a[2],
            prev[3] + d * a[3],
        ]
    });

    Ok(Wiring {
        forward,
        backward,
        gradient,
        tables: vec![address],
        forward_tables: Vec::new(),
        backward_tables: Vec::new(),
        gradient_tables: vec![0],
        init: WeightInit::Xavier,
    })
}
