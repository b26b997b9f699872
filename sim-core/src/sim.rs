use std::{sync::Arc, time::Duration};

use anyhow::Result;
use rand::RngCore;
use rand_chacha::{ChaChaRng, rand_core::SeedableRng};
use tracing::info;

use crate::{
    clock::Timestamp,
    config::{NodeId, SimConfiguration},
    events::EventTracker,
    model::{Block, Transaction},
    network::DelayModel,
};

mod event_queue;
mod peer;
mod strategy;
#[cfg(test)]
mod tests;

use event_queue::EventQueue;
pub use peer::{ChainStats, Peer, WithheldSnapshot};
pub use strategy::{MinerStrategy, ReleaseAction};

#[derive(Clone, Debug)]
pub enum SimulationMessage {
    Tx(Arc<Transaction>),
    Block(Arc<Block>),
}

impl SimulationMessage {
    pub fn weight(&self) -> u64 {
        match self {
            Self::Tx(_) => 1,
            Self::Block(block) => block.weight(),
        }
    }
}

#[derive(Debug)]
pub enum SimulationEvent {
    /// A node's transaction-generation activity fires.
    GenerateTx(NodeId),
    /// A node's proof-of-work wait completes. The attempt counter detects
    /// cancellation: a stale counter means the chain head changed while the
    /// wait was in flight.
    FinishMining(NodeId, u64),
    /// Delayed delivery of a gossiped payload.
    Message {
        from: NodeId,
        to: NodeId,
        msg: SimulationMessage,
    },
}

/// Network-wide counters owned by the engine. Peers never see this; the
/// engine updates it from the results their handlers return.
#[derive(Debug, Default)]
pub struct SimContext {
    pub blocks_mined: u64,
}

/// What a peer handler wants the engine to do next: deliver messages over
/// delayed links and schedule future wakeups for the peer's own activities.
#[derive(Default)]
pub(crate) struct EventResult {
    messages: Vec<(NodeId, SimulationMessage)>,
    wakeups: Vec<(Duration, SimulationEvent)>,
    mined: Option<Arc<Block>>,
}

impl EventResult {
    pub fn send_to(&mut self, to: NodeId, msg: SimulationMessage) {
        self.messages.push((to, msg));
    }

    pub fn wake_after(&mut self, after: Duration, event: SimulationEvent) {
        self.wakeups.push((after, event));
    }
}

pub struct Simulation {
    config: Arc<SimConfiguration>,
    delays: DelayModel,
    queue: EventQueue,
    peers: Vec<Peer>,
    ctx: SimContext,
    rng: ChaChaRng,
}

impl Simulation {
    pub fn new(config: SimConfiguration, tracker: EventTracker) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let mut rng = ChaChaRng::seed_from_u64(config.seed);
        let delays = DelayModel::new(&config.nodes, &config.delays, &mut rng);
        let genesis = Arc::new(Block::genesis());

        let peers: Vec<Peer> = config
            .nodes
            .iter()
            .map(|node_config| {
                Peer::new(
                    node_config,
                    config.clone(),
                    genesis.clone(),
                    tracker.clone(),
                    ChaChaRng::seed_from_u64(rng.next_u64()),
                )
            })
            .collect();

        let mut sim = Self {
            config,
            delays,
            queue: EventQueue::new(),
            peers,
            ctx: SimContext::default(),
            rng,
        };
        let start = Timestamp::zero();
        for index in 0..sim.peers.len() {
            let result = sim.peers[index].start(start);
            sim.apply(start, NodeId::new(index), result);
        }
        Ok(sim)
    }

    /// Drive the event clock forward until the configured horizon. Events
    /// scheduled at or beyond the horizon are never executed.
    pub fn run(&mut self) {
        let horizon = Timestamp::zero() + self.config.horizon;
        let mut executed = 0u64;
        while let Some((now, event)) = self.queue.pop() {
            if now >= horizon {
                break;
            }
            executed += 1;
            let (actor, result) = match event {
                SimulationEvent::GenerateTx(id) => {
                    (id, self.peers[id.to_inner()].handle_generate_tx(now))
                }
                SimulationEvent::FinishMining(id, attempt) => (
                    id,
                    self.peers[id.to_inner()].handle_finish_mining(now, attempt),
                ),
                SimulationEvent::Message { from, to, msg } => {
                    let peer = &mut self.peers[to.to_inner()];
                    let result = match msg {
                        SimulationMessage::Tx(tx) => peer.handle_receive_tx(now, from, tx),
                        SimulationMessage::Block(block) => {
                            peer.handle_receive_block(now, from, block)
                        }
                    };
                    (to, result)
                }
            };
            self.apply(now, actor, result);
        }
        info!(
            events = executed,
            blocks = self.ctx.blocks_mined,
            "simulation horizon reached"
        );
    }

    fn apply(&mut self, now: Timestamp, from: NodeId, result: EventResult) {
        if result.mined.is_some() {
            self.ctx.blocks_mined += 1;
        }
        for (to, msg) in result.messages {
            let delay = self.delays.delay(from, to, msg.weight(), &mut self.rng);
            self.queue
                .schedule(now + delay, SimulationEvent::Message { from, to, msg });
        }
        for (after, event) in result.wakeups {
            self.queue.schedule(now + after, event);
        }
    }

    pub fn config(&self) -> &SimConfiguration {
        &self.config
    }

    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }

    /// Total blocks mined network-wide, withheld ones included, genesis
    /// excluded.
    pub fn blocks_mined(&self) -> u64 {
        self.ctx.blocks_mined
    }

    /// MPU-overall as seen from one peer: the height of its adopted chain
    /// over the total number of blocks mined network-wide.
    pub fn mpu_overall(&self, node: NodeId) -> f64 {
        if self.ctx.blocks_mined == 0 {
            return 0.0;
        }
        self.peers[node.to_inner()].chain_height() as f64 / self.ctx.blocks_mined as f64
    }
}
