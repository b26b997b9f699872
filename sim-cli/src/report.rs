use std::{
    collections::HashSet,
    fmt::Write as _,
    fs::{self, OpenOptions},
    io::Write as _,
    path::Path,
};

use anyhow::Result;
use itertools::Itertools as _;
use powsim_core::{
    config::NodeId,
    sim::{Peer, Simulation},
};
use serde::Serialize;
use tracing::info;

#[derive(Serialize)]
pub struct RunSummary {
    total_blocks_mined: u64,
    nodes: Vec<NodeSummary>,
    attacker: Option<AttackerSummary>,
}

#[derive(Serialize)]
struct NodeSummary {
    node: NodeId,
    chain_height: u64,
    pending_txns: usize,
    /// Blocks on this node's adopted chain, per miner.
    adopted_per_miner: Vec<u64>,
}

#[derive(Serialize)]
struct AttackerSummary {
    node: NodeId,
    mined: u64,
    adopted: u64,
    still_withheld: usize,
    mpu_adversary: f64,
    mpu_overall: f64,
}

pub fn summarize(sim: &Simulation) -> RunSummary {
    let nodes = sim
        .peers()
        .iter()
        .map(|peer| {
            let stats = peer.chain_stats();
            NodeSummary {
                node: peer.id(),
                chain_height: stats.height,
                pending_txns: peer.pending_txns(),
                adopted_per_miner: stats.mined_per_node,
            }
        })
        .collect();
    RunSummary {
        total_blocks_mined: sim.blocks_mined(),
        nodes,
        attacker: attacker_summary(sim),
    }
}

/// Attacker utilization, measured from an honest observer's adopted chain.
fn attacker_summary(sim: &Simulation) -> Option<AttackerSummary> {
    let attacker = sim
        .peers()
        .iter()
        .find(|peer| peer.strategy().withholds())?;
    let observer = sim
        .peers()
        .iter()
        .find(|peer| !peer.strategy().withholds())?;
    let adopted = observer.chain_stats().mined_per_node[attacker.id().to_inner()];
    let mpu_adversary = if attacker.blocks_mined() == 0 {
        0.0
    } else {
        adopted as f64 / attacker.blocks_mined() as f64
    };
    Some(AttackerSummary {
        node: attacker.id(),
        mined: attacker.blocks_mined(),
        adopted,
        still_withheld: attacker.withheld().blocks.len(),
        mpu_adversary,
        mpu_overall: sim.mpu_overall(observer.id()),
    })
}

pub fn log_summary(summary: &RunSummary) {
    info!(blocks_mined = summary.total_blocks_mined, "run finished");
    for node in &summary.nodes {
        let per_miner = node
            .adopted_per_miner
            .iter()
            .enumerate()
            .map(|(miner, count)| format!("{miner}:{count}"))
            .join(" ");
        info!(
            node = %node.node,
            height = node.chain_height,
            pending_txns = node.pending_txns,
            %per_miner,
            "chain view"
        );
    }
    if let Some(attacker) = &summary.attacker {
        info!(
            attacker = %attacker.node,
            mined = attacker.mined,
            adopted = attacker.adopted,
            still_withheld = attacker.still_withheld,
            mpu_adversary = attacker.mpu_adversary,
            mpu_overall = attacker.mpu_overall,
            "attacker summary"
        );
    }
}

/// Append the summary as the final line of the event stream file.
pub fn append_summary(summary: &RunSummary, path: &Path) -> Result<()> {
    let mut file = OpenOptions::new().append(true).open(path)?;
    serde_json::to_writer(&mut file, summary)?;
    file.write_all(b"\n")?;
    Ok(())
}

/// Write one Graphviz file per peer showing every block that peer recorded:
/// edges run child to parent, and blocks on the adopted chain are filled in.
pub fn write_trees(sim: &Simulation, dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)?;
    for peer in sim.peers() {
        let path = dir.join(format!("node_{}.dot", peer.id()));
        fs::write(&path, render_tree(peer)?)?;
    }
    info!(dir = %dir.display(), "block trees written");
    Ok(())
}

fn render_tree(peer: &Peer) -> Result<String> {
    let main_chain: HashSet<_> = peer.main_chain().into_iter().collect();
    let mut dot = String::new();
    writeln!(dot, "digraph node_{} {{", peer.id())?;
    writeln!(dot, "  rankdir=RL;")?;
    writeln!(dot, "  node [shape=box];")?;
    for block in peer
        .known_blocks()
        .sorted_by_key(|block| peer.height_of(block.id))
    {
        let height = peer.height_of(block.id).unwrap_or_default();
        let arrival = peer
            .arrival_of(block.id)
            .map(|at| at.as_millis_f64())
            .unwrap_or_default();
        let miner = block
            .miner
            .map(|id| id.to_string())
            .unwrap_or_else(|| "genesis".into());
        let fill = if main_chain.contains(&block.id) || block.parent.is_none() {
            " style=filled fillcolor=lightblue"
        } else {
            ""
        };
        writeln!(
            dot,
            "  \"{}\" [label=\"h={height} by {miner}\\n{arrival:.1}ms\"{fill}];",
            block.id
        )?;
        if let Some(parent) = block.parent {
            writeln!(dot, "  \"{}\" -> \"{parent}\";", block.id)?;
        }
    }
    writeln!(dot, "}}")?;
    Ok(dot)
}
