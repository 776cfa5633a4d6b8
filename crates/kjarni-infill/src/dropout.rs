use ndarray::{Array, Dimension};
use rand::Rng;
use rand::rngs::StdRng;

/// Inverted dropout. Active only when a training RNG is supplied.
#[derive(Debug, Clone, Copy)]
pub struct Dropout {
    pub rate: f32,
}

impl Dropout {
    pub fn new(rate: f32) -> Self {
        Self { rate }
    }

    pub fn apply<D: Dimension>(&self, x: &mut Array<f32, D>, rng: Option<&mut StdRng>) {
        let Some(rng) = rng else { return };
        if self.rate <= 0.0 {
            return;
        }
        if self.rate >= 1.0 {
            x.fill(0.0);
            return;
        }
        let scale = 1.0 / (1.0 - self.rate);
        x.mapv_inplace(|v| {
            if rng.gen_range(0.0..1.0) < self.rate {
                0.0
            } else {
                v * scale
            }
        });
    }
}
