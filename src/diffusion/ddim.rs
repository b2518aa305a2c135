//! # Denoising Diffusion Implicit Models
//!
//! Deterministic (eta = 0) DDIM sampling with the scaled linear beta schedule
//! Stable Diffusion v1.5 was trained with, predicting the noise (epsilon).
//!
//! Denoising Diffusion Implicit Models, J. Song et al, 2020.
//! https://arxiv.org/abs/2010.02502
use tch::Tensor;

const TRAIN_TIMESTEPS: usize = 1000;
const BETA_START: f64 = 0.00085;
const BETA_END: f64 = 0.012;
const STEPS_OFFSET: usize = 1;

#[derive(Debug, Clone)]
pub struct DdimScheduler {
    timesteps: Vec<usize>,
    alphas_cumprod: Vec<f64>,
    step_ratio: usize,
}

impl DdimScheduler {
    /// A schedule of `inference_steps` steps, clamped to `1..=1000`.
    pub fn new(inference_steps: usize) -> Self {
        let steps = inference_steps.clamp(1, TRAIN_TIMESTEPS);
        let step_ratio = TRAIN_TIMESTEPS / steps;
        let timesteps = (0..steps).map(|s| s * step_ratio + STEPS_OFFSET).rev().collect();
        let (start, end) = (BETA_START.sqrt(), BETA_END.sqrt());
        let mut alpha_prod = 1.;
        let alphas_cumprod = (0..TRAIN_TIMESTEPS)
            .map(|i| {
                let beta = start + (end - start) * i as f64 / (TRAIN_TIMESTEPS - 1) as f64;
                alpha_prod *= 1. - beta * beta;
                alpha_prod
            })
            .collect();
        Self { timesteps, alphas_cumprod, step_ratio }
    }

    /// Timesteps in the order they are visited, from noisiest to cleanest.
    pub fn timesteps(&self) -> &[usize] {
        &self.timesteps
    }

    pub fn init_noise_sigma(&self) -> f64 {
        1.
    }

    fn alpha_prod(&self, timestep: usize) -> f64 {
        self.alphas_cumprod[timestep.min(TRAIN_TIMESTEPS - 1)]
    }

    /// Moves `sample` from `timestep` to the previous timestep given the
    /// predicted noise.
    pub fn step(&self, noise_pred: &Tensor, timestep: usize, sample: &Tensor) -> Tensor {
        let prev_timestep = timestep.saturating_sub(self.step_ratio);
        let alpha_prod_t = self.alpha_prod(timestep);
        let alpha_prod_prev = self.alpha_prod(prev_timestep);
        let pred_original = (sample - (1. - alpha_prod_t).sqrt() * noise_pred) / alpha_prod_t.sqrt();
        let direction = (1. - alpha_prod_prev).sqrt() * noise_pred;
        alpha_prod_prev.sqrt() * pred_original + direction
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timesteps_are_evenly_spaced() {
        let scheduler = DdimScheduler::new(20);
        let timesteps = scheduler.timesteps();
        assert_eq!(timesteps.len(), 20);
        assert_eq!(timesteps[0], 951);
        assert_eq!(timesteps[1], 901);
        assert_eq!(timesteps[19], 1);
        assert_eq!(DdimScheduler::new(0).timesteps(), [1]);
        assert_eq!(DdimScheduler::new(5000).timesteps().len(), 1000);
    }

    #[test]
    fn noise_schedule_is_decreasing() {
        let scheduler = DdimScheduler::new(10);
        let a = &scheduler.alphas_cumprod;
        assert!((a[0] - (1. - BETA_START)).abs() < 1e-9);
        assert!(a.windows(2).all(|w| w[1] < w[0]));
        assert!(a[999] > 0. && a[999] < 0.01);
    }

    #[test]
    fn step_without_noise_rescales() {
        let scheduler = DdimScheduler::new(20);
        let sample = Tensor::ones([1, 4, 2, 2], tch::kind::FLOAT_CPU);
        let noise = sample.zeros_like();
        let prev = scheduler.step(&noise, 951, &sample);
        let expected = (scheduler.alpha_prod(901) / scheduler.alpha_prod(951)).sqrt();
        let got = prev.double_value(&[0, 0, 0, 0]);
        assert!((got - expected).abs() < 1e-4, "{got} {expected}");
    }
}
