use std::time::Duration;

use rand::Rng;
use rand_distr::Distribution as _;

use crate::{
    clock::millis,
    config::{LinkClass, NodeConfiguration, NodeId, RawDelayConfig},
    probability::FloatDistribution,
};

/// Stochastic message-delivery latency between ordered node pairs.
///
/// The base latency of each ordered pair and the link speed (fast only when
/// both endpoints are fast) are fixed at construction; the queuing term is
/// redrawn for every message.
pub struct DelayModel {
    n: usize,
    base_latency_ms: Vec<f64>,
    link_speed: Vec<f64>,
    queue_factor: f64,
}

impl DelayModel {
    pub fn new(nodes: &[NodeConfiguration], config: &RawDelayConfig, rng: &mut impl Rng) -> Self {
        let n = nodes.len();
        let rho = FloatDistribution::uniform(config.low_rho_ms, config.high_rho_ms);
        let mut base_latency_ms = Vec::with_capacity(n * n);
        let mut link_speed = Vec::with_capacity(n * n);
        for from in nodes {
            for to in nodes {
                base_latency_ms.push(rho.sample(rng));
                let fast = from.link == LinkClass::Fast && to.link == LinkClass::Fast;
                link_speed.push(if fast {
                    config.fast_speed
                } else {
                    config.base_speed
                });
            }
        }
        Self {
            n,
            base_latency_ms,
            link_speed,
            queue_factor: config.queue_factor,
        }
    }

    pub fn delay(&self, from: NodeId, to: NodeId, weight: u64, rng: &mut impl Rng) -> Duration {
        let index = from.to_inner() * self.n + to.to_inner();
        let speed = self.link_speed[index];
        let queue = FloatDistribution::exp_mean(self.queue_factor / speed).sample(rng);
        millis(self.base_latency_ms[index] + queue + weight as f64 / speed)
    }

    #[cfg(test)]
    fn base_latency(&self, from: NodeId, to: NodeId) -> f64 {
        self.base_latency_ms[from.to_inner() * self.n + to.to_inner()]
    }
}
