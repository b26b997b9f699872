use std::collections::{HashSet, VecDeque};

use anyhow::{Result, bail};
use powsim_core::config::{
    AttackerStrategy, CpuClass, LinkClass, RawAttackerConfig, RawConfig, RawDelayConfig,
    RawLinkConfig, RawNodeConfig,
};
use rand::{
    Rng,
    seq::{IndexedRandom as _, SliceRandom as _, index},
};
use rand_chacha::{ChaChaRng, rand_core::SeedableRng};
use serde::Deserialize;

/// A scenario file. Either `nodes`/`links` spell the network out
/// explicitly, or a `[topology]` section asks for a random one.
#[derive(Debug, Deserialize)]
pub struct Scenario {
    pub seed: Option<u64>,
    pub horizon_ms: f64,
    pub tx_interarrival_ms: f64,
    pub block_interval_ms: f64,
    pub max_block_txns: usize,
    pub block_size_cap: u64,
    pub coinbase_reward: f64,
    pub max_tx_amount: f64,
    #[serde(default)]
    pub delays: RawDelayConfig,
    #[serde(default)]
    pub nodes: Vec<RawNodeConfig>,
    #[serde(default)]
    pub links: Vec<RawLinkConfig>,
    pub topology: Option<TopologyArgs>,
    pub attacker: Option<ScenarioAttacker>,
}

#[derive(Debug, Deserialize)]
pub struct ScenarioAttacker {
    /// Required with an explicit node list; ignored with `[topology]`, where
    /// the attacker is appended after the honest nodes.
    pub node: Option<usize>,
    pub strategy: AttackerStrategy,
    pub power: Option<f64>,
    /// How many honest nodes a topology-generated attacker connects to.
    pub zeta: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct TopologyArgs {
    pub nodes: usize,
    /// Fraction of honest nodes put on slow links.
    pub slow_fraction: f64,
    /// Fraction of honest nodes given a low-CPU miner.
    pub low_cpu_fraction: f64,
    #[serde(default = "default_min_degree")]
    pub min_degree: usize,
    #[serde(default = "default_max_degree")]
    pub max_degree: usize,
}

fn default_min_degree() -> usize {
    4
}

fn default_max_degree() -> usize {
    8
}

const MAX_ATTEMPTS: usize = 100;

impl Scenario {
    pub fn into_raw(self) -> Result<RawConfig> {
        let (nodes, links, attacker) = match &self.topology {
            Some(topology) => {
                let mut rng = ChaChaRng::seed_from_u64(self.seed.unwrap_or_default());
                generate(topology, self.attacker, &mut rng)?
            }
            None => {
                let attacker = self
                    .attacker
                    .map(|attacker| {
                        let Some(node) = attacker.node else {
                            bail!("an explicit node list needs attacker.node");
                        };
                        Ok(RawAttackerConfig {
                            node,
                            strategy: attacker.strategy,
                            power: attacker.power,
                        })
                    })
                    .transpose()?;
                (self.nodes, self.links, attacker)
            }
        };
        Ok(RawConfig {
            seed: self.seed,
            horizon_ms: self.horizon_ms,
            tx_interarrival_ms: self.tx_interarrival_ms,
            block_interval_ms: self.block_interval_ms,
            max_block_txns: self.max_block_txns,
            block_size_cap: self.block_size_cap,
            coinbase_reward: self.coinbase_reward,
            max_tx_amount: self.max_tx_amount,
            delays: self.delays,
            nodes,
            links,
            attacker,
        })
    }
}

/// Build a random connected network: every honest node gets a degree drawn
/// from `min_degree..=max_degree`, with whole-graph retries when the random
/// pairing paints itself into a corner. The attacker, when present, joins
/// afterwards through `zeta` extra links and does not count against honest
/// degrees.
fn generate(
    args: &TopologyArgs,
    attacker: Option<ScenarioAttacker>,
    rng: &mut ChaChaRng,
) -> Result<(Vec<RawNodeConfig>, Vec<RawLinkConfig>, Option<RawAttackerConfig>)> {
    if args.nodes < 2 {
        bail!("a generated topology needs at least two nodes");
    }
    if args.min_degree == 0 || args.max_degree < args.min_degree {
        bail!(
            "degree range {}..={} is unusable",
            args.min_degree,
            args.max_degree
        );
    }
    for fraction in [args.slow_fraction, args.low_cpu_fraction] {
        if !(0.0..=1.0).contains(&fraction) {
            bail!("node class fractions must lie in [0, 1]");
        }
    }

    let n = args.nodes;
    let mut nodes = node_classes(args, rng);
    let mut links = None;
    for _ in 0..MAX_ATTEMPTS {
        if let Some(edges) = try_links(args, rng) {
            links = Some(edges);
            break;
        }
    }
    let Some(mut links) = links else {
        bail!(
            "no connected graph with degrees {}..={} found in {MAX_ATTEMPTS} attempts",
            args.min_degree,
            args.max_degree
        );
    };

    let attacker = attacker.map(|attacker| {
        let zeta = attacker.zeta.unwrap_or(args.min_degree).clamp(1, n);
        // entry points are drawn from the fast nodes when enough exist
        let mut candidates: Vec<usize> = (0..n)
            .filter(|&id| nodes[id].link == LinkClass::Fast)
            .collect();
        if candidates.len() < zeta {
            candidates = (0..n).collect();
        }
        nodes.push(RawNodeConfig {
            link: LinkClass::Fast,
            cpu: CpuClass::High,
        });
        for chosen in index::sample(rng, candidates.len(), zeta) {
            links.push((candidates[chosen], n));
        }
        RawAttackerConfig {
            node: n,
            strategy: attacker.strategy,
            power: attacker.power,
        }
    });

    let links = links
        .into_iter()
        .map(|nodes| RawLinkConfig { nodes })
        .collect();
    Ok((nodes, links, attacker))
}

fn node_classes(args: &TopologyArgs, rng: &mut ChaChaRng) -> Vec<RawNodeConfig> {
    let n = args.nodes;
    let mut shuffled: Vec<usize> = (0..n).collect();
    shuffled.shuffle(rng);
    let slow: HashSet<usize> = shuffled
        .iter()
        .take((args.slow_fraction * n as f64) as usize)
        .copied()
        .collect();
    shuffled.shuffle(rng);
    let low_cpu: HashSet<usize> = shuffled
        .iter()
        .take((args.low_cpu_fraction * n as f64) as usize)
        .copied()
        .collect();
    (0..n)
        .map(|id| RawNodeConfig {
            link: if slow.contains(&id) {
                LinkClass::Slow
            } else {
                LinkClass::Fast
            },
            cpu: if low_cpu.contains(&id) {
                CpuClass::Low
            } else {
                CpuClass::High
            },
        })
        .collect()
}

fn try_links(args: &TopologyArgs, rng: &mut ChaChaRng) -> Option<Vec<(usize, usize)>> {
    let n = args.nodes;
    let max_degree = args.max_degree.min(n - 1);
    let min_degree = args.min_degree.min(max_degree);
    let targets: Vec<usize> = (0..n)
        .map(|_| rng.random_range(min_degree..=max_degree))
        .collect();

    let mut edges: HashSet<(usize, usize)> = HashSet::new();
    let mut degree = vec![0usize; n];
    loop {
        let open: Vec<usize> = (0..n).filter(|&id| degree[id] < targets[id]).collect();
        if open.is_empty() {
            break;
        }
        let candidates: Vec<(usize, usize)> = open
            .iter()
            .flat_map(|&a| {
                open.iter()
                    .filter(move |&&b| b > a)
                    .map(move |&b| (a, b))
                    .filter(|pair| !edges.contains(pair))
            })
            .collect();
        // nodes still under target but nothing left to pair them with
        let (a, b) = *candidates.choose(rng)?;
        edges.insert((a, b));
        degree[a] += 1;
        degree[b] += 1;
    }

    let edges: Vec<(usize, usize)> = edges.into_iter().collect();
    connected(n, &edges).then_some(edges)
}

fn connected(n: usize, edges: &[(usize, usize)]) -> bool {
    let mut adjacency = vec![vec![]; n];
    for &(a, b) in edges {
        adjacency[a].push(b);
        adjacency[b].push(a);
    }
    let mut seen = HashSet::from([0]);
    let mut frontier = VecDeque::from([0]);
    while let Some(node) = frontier.pop_front() {
        for &peer in &adjacency[node] {
            if seen.insert(peer) {
                frontier.push_back(peer);
            }
        }
    }
    seen.len() == n
}
