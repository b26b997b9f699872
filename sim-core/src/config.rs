use std::{
    collections::{HashSet, VecDeque},
    fmt::Display,
    time::Duration,
};

use anyhow::{Result, anyhow, bail};
use serde::{Deserialize, Serialize};

use crate::clock::millis;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(usize);
impl Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}
impl NodeId {
    pub fn to_inner(self) -> usize {
        self.0
    }
    pub fn new(value: usize) -> Self {
        Self(value)
    }
}

/// Link class of a node. A network edge only counts as fast when both of its
/// endpoints are fast.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkClass {
    Fast,
    Slow,
}

/// CPU class of a node. High-CPU nodes carry ten hashing-power units, low-CPU
/// nodes one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CpuClass {
    High,
    Low,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttackerStrategy {
    Selfish,
    Stubborn,
}

const HIGH_CPU_UNITS: f64 = 10.0;
const LOW_CPU_UNITS: f64 = 1.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawConfig {
    pub seed: Option<u64>,
    /// Simulated time at which the run stops, in milliseconds.
    pub horizon_ms: f64,
    /// Mean inter-arrival time of generated transactions, per node.
    pub tx_interarrival_ms: f64,
    /// Mean block inter-arrival time for a node holding all hashing power.
    pub block_interval_ms: f64,
    /// Upper bound on the number of pool transactions pulled into a candidate.
    pub max_block_txns: usize,
    /// Nominal cap on transactions per block, enforced at admission time.
    pub block_size_cap: u64,
    pub coinbase_reward: f64,
    pub max_tx_amount: f64,
    #[serde(default)]
    pub delays: RawDelayConfig,
    pub nodes: Vec<RawNodeConfig>,
    pub links: Vec<RawLinkConfig>,
    pub attacker: Option<RawAttackerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawDelayConfig {
    pub low_rho_ms: f64,
    pub high_rho_ms: f64,
    pub base_speed: f64,
    pub fast_speed: f64,
    pub queue_factor: f64,
}

impl Default for RawDelayConfig {
    fn default() -> Self {
        Self {
            low_rho_ms: 10.0,
            high_rho_ms: 500.0,
            base_speed: 5.0,
            fast_speed: 100.0,
            queue_factor: 96.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawNodeConfig {
    pub link: LinkClass,
    pub cpu: CpuClass,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawLinkConfig {
    pub nodes: (usize, usize),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawAttackerConfig {
    /// Index of the attacker in the node list.
    pub node: usize,
    pub strategy: AttackerStrategy,
    /// Explicit hashing-power share in (0, 1). When absent the attacker is
    /// weighted by its CPU class like any other node.
    pub power: Option<f64>,
}

impl RawConfig {
    pub fn build(self) -> Result<SimConfiguration> {
        let mut nodes: Vec<NodeConfiguration> = self
            .nodes
            .iter()
            .enumerate()
            .map(|(index, raw)| NodeConfiguration {
                id: NodeId::new(index),
                link: raw.link,
                cpu: raw.cpu,
                strategy: None,
                hash_power: 0.0,
                peers: vec![],
            })
            .collect();

        let mut links = vec![];
        for link in &self.links {
            let (id1, id2) = link.nodes;
            if id1 >= nodes.len() || id2 >= nodes.len() {
                bail!("link ({id1}, {id2}) references a node that does not exist");
            }
            nodes[id1].peers.push(NodeId::new(id2));
            nodes[id2].peers.push(NodeId::new(id1));
            links.push(LinkConfiguration {
                nodes: (NodeId::new(id1), NodeId::new(id2)),
            });
        }

        if let Some(attacker) = &self.attacker {
            let node = nodes
                .get_mut(attacker.node)
                .ok_or_else(|| anyhow!("attacker node {} does not exist", attacker.node))?;
            node.strategy = Some(attacker.strategy);
            if let Some(power) = attacker.power {
                if !(0.0..1.0).contains(&power) || power == 0.0 {
                    bail!("attacker hashing power must lie in (0, 1), got {power}");
                }
            }
        }
        assign_hash_power(&mut nodes, self.attacker.as_ref());

        let config = SimConfiguration {
            seed: self.seed.unwrap_or_default(),
            horizon: millis(self.horizon_ms),
            tx_interarrival_ms: self.tx_interarrival_ms,
            block_interval_ms: self.block_interval_ms,
            max_block_txns: self.max_block_txns,
            block_size_cap: self.block_size_cap,
            coinbase_reward: self.coinbase_reward,
            max_tx_amount: self.max_tx_amount,
            delays: self.delays,
            nodes,
            links,
        };
        config.validate()?;
        Ok(config)
    }
}

/// One hashing-power unit per low-CPU node, ten per high-CPU node,
/// normalized to sum to one. An explicit attacker share is carved out first
/// and the honest units scaled into the remainder.
fn assign_hash_power(nodes: &mut [NodeConfiguration], attacker: Option<&RawAttackerConfig>) {
    let explicit = attacker.and_then(|a| a.power.map(|p| (a.node, p)));
    let honest_units: f64 = nodes
        .iter()
        .filter(|n| explicit.is_none_or(|(id, _)| n.id.to_inner() != id))
        .map(|n| cpu_units(n.cpu))
        .sum();
    let honest_share = explicit.map_or(1.0, |(_, p)| 1.0 - p);
    for node in nodes.iter_mut() {
        node.hash_power = match explicit {
            Some((id, power)) if node.id.to_inner() == id => power,
            _ => honest_share * cpu_units(node.cpu) / honest_units,
        };
    }
}

fn cpu_units(cpu: CpuClass) -> f64 {
    match cpu {
        CpuClass::High => HIGH_CPU_UNITS,
        CpuClass::Low => LOW_CPU_UNITS,
    }
}

#[derive(Debug, Clone)]
pub struct SimConfiguration {
    pub seed: u64,
    pub horizon: Duration,
    pub tx_interarrival_ms: f64,
    pub block_interval_ms: f64,
    pub max_block_txns: usize,
    pub block_size_cap: u64,
    pub coinbase_reward: f64,
    pub max_tx_amount: f64,
    pub delays: RawDelayConfig,
    pub nodes: Vec<NodeConfiguration>,
    pub links: Vec<LinkConfiguration>,
}

impl SimConfiguration {
    /// Fail-fast precondition checks; nothing here is recoverable once the
    /// clock starts.
    pub fn validate(&self) -> Result<()> {
        if self.nodes.len() < 2 {
            bail!("at least two nodes are required");
        }
        if self.max_block_txns == 0 {
            bail!("max_block_txns must be at least 1");
        }
        if self.tx_interarrival_ms <= 0.0 || self.block_interval_ms <= 0.0 {
            bail!("inter-arrival means must be positive");
        }
        if self.delays.low_rho_ms >= self.delays.high_rho_ms {
            bail!("delay config: low_rho_ms must be below high_rho_ms");
        }

        // The graph must be nonempty and fully connected,
        // and no node may be linked to itself.
        let mut connected_nodes = HashSet::new();
        let mut self_connected_nodes = vec![];
        let mut frontier = VecDeque::new();
        let first_node = self
            .nodes
            .first()
            .ok_or_else(|| anyhow!("graph must not be empty"))?;
        frontier.push_back(first_node);
        while let Some(node) = frontier.pop_front() {
            if connected_nodes.insert(node.id) {
                for peer_id in &node.peers {
                    if node.id == *peer_id {
                        self_connected_nodes.push(node.id);
                    }
                    let peer = self
                        .nodes
                        .get(peer_id.to_inner())
                        .ok_or_else(|| anyhow!("node {peer_id} not found"))?;
                    frontier.push_back(peer);
                }
            }
        }
        if !self_connected_nodes.is_empty() {
            bail!(
                "{} node(s) are connected to themselves",
                self_connected_nodes.len()
            );
        }
        if connected_nodes.len() < self.nodes.len() {
            bail!("graph must be fully connected");
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfiguration {
    pub id: NodeId,
    pub link: LinkClass,
    pub cpu: CpuClass,
    pub strategy: Option<AttackerStrategy>,
    pub hash_power: f64,
    pub peers: Vec<NodeId>,
}

#[derive(Debug, Clone)]
pub struct LinkConfiguration {
    pub nodes: (NodeId, NodeId),
}
