//! Reuse pool for expensive samples.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use super::Sample;
use crate::error::SampleGenerationError;

#[derive(Debug)]
struct PoolSlot {
    sample: Sample,
    uses: usize,
}

/// Fixed-size cache of samples, each served up to `max_uses` times.
///
/// Slots are visited in a freshly shuffled order every cycle, so every slot
/// is picked once per `size` draws. A slot is regenerated on first use and
/// once its counter reaches `max_uses`.
#[derive(Debug)]
pub struct SamplePool {
    max_uses: usize,
    slots: Vec<Option<PoolSlot>>,
    order: Vec<usize>,
    cursor: usize,
    generated: usize,
}

impl SamplePool {
    pub fn new(size: usize, max_uses: usize) -> Self {
        let size = size.max(1);
        Self {
            max_uses: max_uses.max(1),
            slots: (0..size).map(|_| None).collect(),
            order: Vec::new(),
            cursor: 0,
            generated: 0,
        }
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Samples produced by the provider so far.
    pub fn generated(&self) -> usize {
        self.generated
    }

    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
        self.order.clear();
        self.cursor = 0;
    }

    /// Serves the next sample, calling `generate` when the picked slot is
    /// empty or used up. If the provider fails a pooled sample is served
    /// instead when one exists. Device errors are always returned.
    pub fn draw<F>(&mut self, rng: &mut StdRng, mut generate: F) -> Result<Sample, SampleGenerationError>
    where
        F: FnMut(&mut StdRng) -> Result<Sample, SampleGenerationError>,
    {
        if self.cursor >= self.order.len() {
            self.order = (0..self.slots.len()).collect();
            self.order.shuffle(rng);
            self.cursor = 0;
        }
        let mut index = self.order[self.cursor];
        self.cursor += 1;

        let stale = self.slots[index]
            .as_ref()
            .map_or(true, |slot| slot.uses >= self.max_uses);
        if stale {
            match generate(rng) {
                Ok(sample) => {
                    self.generated += 1;
                    self.slots[index] = Some(PoolSlot { sample, uses: 0 });
                }
                Err(err @ SampleGenerationError::Device(_)) => return Err(err),
                Err(err) => {
                    let fallback = if self.slots[index].is_some() {
                        Some(index)
                    } else {
                        self.slots.iter().position(Option::is_some)
                    };
                    let Some(fallback) = fallback else {
                        return Err(err);
                    };
                    tracing::warn!(error = %err, slot = fallback, "sample generation failed, reusing pooled sample");
                    index = fallback;
                }
            }
        }

        match self.slots[index].as_mut() {
            Some(slot) => {
                slot.uses += 1;
                Ok(slot.sample.clone())
            }
            None => Err(SampleGenerationError::Provider {
                provider: "pool".into(),
                reason: format!("slot {index} is empty"),
            }),
        }
    }
}
