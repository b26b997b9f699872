use rand::Rng;
use rand_distr::{Distribution, Exp, Uniform};
use std::fmt::Debug;

#[derive(Debug, Clone, Copy)]
pub enum FloatDistribution {
    Uniform(Uniform<f64>),
    Exp(Exp<f64>),
    Constant(Constant<f64>),
}

impl FloatDistribution {
    pub fn uniform(low: f64, high: f64) -> Self {
        Self::Uniform(Uniform::new(low, high).unwrap())
    }
    /// An exponential distribution with the given mean.
    pub fn exp_mean(mean: f64) -> Self {
        Self::Exp(Exp::new(1.0 / mean).unwrap())
    }
    pub fn constant(value: f64) -> Self {
        Self::Constant(Constant::new(value))
    }
}

impl Distribution<f64> for FloatDistribution {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        match self {
            Self::Uniform(d) => d.sample(rng),
            Self::Exp(d) => d.sample(rng),
            Self::Constant(d) => d.sample(rng),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Constant<T>(T);
impl<T> Constant<T> {
    pub fn new(value: T) -> Self {
        Self(value)
    }
}

impl<T: Clone> Distribution<T> for Constant<T> {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> T {
        let _ = rng;
        self.0.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaChaRng;

    #[test]
    fn should_sample_uniform_within_bounds() {
        let mut rng = ChaChaRng::seed_from_u64(42);
        let d = FloatDistribution::uniform(10.0, 500.0);
        for _ in 0..1000 {
            let x = d.sample(&mut rng);
            assert!((10.0..500.0).contains(&x));
        }
    }

    #[test]
    fn should_sample_exp_with_requested_mean() {
        let mut rng = ChaChaRng::seed_from_u64(42);
        let d = FloatDistribution::exp_mean(2000.0);
        let total: f64 = (0..10_000).map(|_| d.sample(&mut rng)).sum();
        let mean = total / 10_000.0;
        assert!((mean - 2000.0).abs() < 100.0, "observed mean {mean}");
    }
}
