use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    sync::Arc,
};

use rand::Rng;
use rand_chacha::ChaChaRng;
use rand_distr::Distribution as _;
use tracing::debug;

use crate::{
    clock::{Timestamp, millis},
    config::{NodeConfiguration, NodeId, SimConfiguration},
    events::{BlockRejectReason, EventTracker},
    model::{Block, BlockId, CandidateBlock, Transaction, TransactionId},
    probability::FloatDistribution,
};

use super::{EventResult, MinerStrategy, ReleaseAction, SimulationEvent, SimulationMessage};

/// The attacker's private state at a moment in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WithheldSnapshot {
    pub lead: u64,
    pub blocks: Vec<BlockId>,
}

/// Per-miner breakdown of one peer's adopted chain.
#[derive(Debug, Clone)]
pub struct ChainStats {
    pub height: u64,
    /// Blocks on the adopted chain, indexed by miner.
    pub mined_per_node: Vec<u64>,
}

/// One participant in the network. Peers own their entire view of the world:
/// a block tree with per-block heights and arrival times, the live balances
/// along the adopted chain, and a pool of pending transactions. They interact
/// with the rest of the network only through the [`EventResult`]s their
/// handlers return.
pub struct Peer {
    id: NodeId,
    config: Arc<SimConfiguration>,
    rng: ChaChaRng,
    neighbors: Vec<NodeId>,
    strategy: MinerStrategy,
    tracker: EventTracker,
    tx_interarrival: FloatDistribution,
    mining_delay: FloatDistribution,

    // ledger state along the adopted chain
    balances: Vec<f64>,
    blocks: HashMap<BlockId, Arc<Block>>,
    heights: HashMap<BlockId, u64>,
    arrivals: HashMap<BlockId, Timestamp>,
    chain_head: BlockId,
    chain_height: u64,
    mempool: BTreeMap<TransactionId, Arc<Transaction>>,

    // per-link gossip bookkeeping
    sent_txs: HashSet<(NodeId, TransactionId)>,
    sent_blocks: HashSet<(NodeId, BlockId)>,

    // mining state
    candidate: Option<CandidateBlock>,
    mining_attempt: u64,
    blocks_mined: u64,

    // withholding state; all zero/empty for honest peers
    withheld: VecDeque<Arc<Block>>,
    lead: u64,
    public_height: u64,
    public_advanced: bool,
}

impl Peer {
    pub(crate) fn new(
        node_config: &NodeConfiguration,
        config: Arc<SimConfiguration>,
        genesis: Arc<Block>,
        tracker: EventTracker,
        rng: ChaChaRng,
    ) -> Self {
        let node_count = config.nodes.len();
        let tx_interarrival = FloatDistribution::exp_mean(config.tx_interarrival_ms);
        // a miner holding a `hash_power` share of the network finds blocks
        // proportionally faster than the network-wide interval
        let mining_delay =
            FloatDistribution::exp_mean(config.block_interval_ms / node_config.hash_power);
        Self {
            id: node_config.id,
            config,
            rng,
            neighbors: node_config.peers.clone(),
            strategy: node_config.strategy.into(),
            tracker,
            tx_interarrival,
            mining_delay,
            balances: vec![0.0; node_count],
            blocks: HashMap::from([(genesis.id, genesis.clone())]),
            heights: HashMap::from([(genesis.id, 0)]),
            arrivals: HashMap::from([(genesis.id, Timestamp::zero())]),
            chain_head: genesis.id,
            chain_height: 0,
            mempool: BTreeMap::new(),
            sent_txs: HashSet::new(),
            sent_blocks: HashSet::new(),
            candidate: None,
            mining_attempt: 0,
            blocks_mined: 0,
            withheld: VecDeque::new(),
            lead: 0,
            public_height: 0,
            public_advanced: false,
        }
    }

    pub(crate) fn start(&mut self, now: Timestamp) -> EventResult {
        let mut result = EventResult::default();
        self.schedule_next_tx(now, &mut result);
        self.begin_mining(now, &mut result);
        result
    }

    pub(crate) fn handle_generate_tx(&mut self, now: Timestamp) -> EventResult {
        let mut result = EventResult::default();
        let tx = Arc::new(Transaction::new(
            Some(self.id),
            self.choose_receiver(),
            self.rng.random_range(0.0..self.config.max_tx_amount),
            now,
        ));
        self.tracker.track_transaction_generated(&tx, now);
        self.mempool.insert(tx.id, tx.clone());
        self.flood_transaction(&tx, now, &mut result);
        self.schedule_next_tx(now, &mut result);
        result
    }

    pub(crate) fn handle_receive_tx(
        &mut self,
        now: Timestamp,
        from: NodeId,
        tx: Arc<Transaction>,
    ) -> EventResult {
        let mut result = EventResult::default();
        self.tracker
            .track_transaction_received(tx.id, from, self.id, now);
        // the pool does not remember what was already mined; a transaction
        // arriving again after inclusion goes right back in and may be mined
        // twice on competing branches
        self.mempool.insert(tx.id, tx.clone());
        self.sent_txs.insert((from, tx.id));
        self.flood_transaction(&tx, now, &mut result);
        result
    }

    pub(crate) fn handle_receive_block(
        &mut self,
        now: Timestamp,
        from: NodeId,
        block: Arc<Block>,
    ) -> EventResult {
        let mut result = EventResult::default();
        self.tracker.track_block_received(block.id, from, self.id, now);
        self.sent_blocks.insert((from, block.id));
        if self.blocks.contains_key(&block.id) {
            return result;
        }
        let Some(parent) = block.parent else {
            return result;
        };
        let Some(parent_height) = self.heights.get(&parent).copied() else {
            // orphans are dropped outright, never buffered for later
            self.tracker
                .track_block_rejected(block.id, self.id, BlockRejectReason::UnknownParent, now);
            return result;
        };
        if !self.validate_block(&block) {
            self.tracker.track_block_rejected(
                block.id,
                self.id,
                BlockRejectReason::InvalidTransaction,
                now,
            );
            return result;
        }

        // every valid block joins the tree and is forwarded on, whether or
        // not it ends up on the adopted chain
        let height = parent_height + 1;
        self.blocks.insert(block.id, block.clone());
        self.heights.insert(block.id, height);
        self.arrivals.insert(block.id, now);
        self.forward_block(&block, now, &mut result);

        let old_head = self.chain_head;
        if parent == self.chain_head {
            self.apply_block(&block);
            self.chain_head = block.id;
            self.chain_height = height;
        } else if height > self.chain_height {
            self.reorg_to(now, &block);
        }
        let head_changed = self.chain_head != old_head;
        let mut restart = head_changed;

        if self.strategy.withholds() {
            if head_changed && !self.withheld.is_empty() {
                // the public chain overtook the private branch; everything
                // withheld is stale now
                debug!(node = %self.id, discarded = self.withheld.len(), "abandoning withheld blocks");
                self.withheld.clear();
                self.lead = 0;
                self.public_advanced = false;
            }
            if height > self.public_height {
                self.public_height = height;
                if !self.withheld.is_empty() {
                    self.lead = self.lead.saturating_sub(1);
                    self.public_advanced = true;
                    // mining restarts so the release policy runs promptly,
                    // even though the private head is unchanged
                    restart = true;
                }
            }
        }
        if restart {
            self.begin_mining(now, &mut result);
        }
        result
    }

    pub(crate) fn handle_finish_mining(&mut self, now: Timestamp, attempt: u64) -> EventResult {
        let mut result = EventResult::default();
        if attempt != self.mining_attempt {
            // the chain head moved while this proof-of-work wait was in
            // flight; the attempt was cancelled
            return result;
        }
        let Some(candidate) = self.candidate.take() else {
            return result;
        };
        let block = Arc::new(candidate.seal(self.id));
        let height = self.chain_height + 1;
        self.blocks.insert(block.id, block.clone());
        self.heights.insert(block.id, height);
        self.arrivals.insert(block.id, now);
        self.apply_block(&block);
        self.chain_head = block.id;
        self.chain_height = height;
        self.blocks_mined += 1;
        result.mined = Some(block.clone());

        let withhold = self.strategy.withholds();
        self.tracker.track_block_mined(&block, height, withhold, now);
        if withhold {
            self.withheld.push_back(block);
            self.lead += 1;
        } else {
            self.forward_block(&block, now, &mut result);
        }
        self.begin_mining(now, &mut result);
        result
    }

    /// Start a fresh proof-of-work attempt on the current head. For a
    /// withholding miner this is also where the release policy runs, before
    /// the new candidate is assembled.
    fn begin_mining(&mut self, now: Timestamp, result: &mut EventResult) {
        self.mining_attempt += 1;
        if self.public_advanced {
            self.public_advanced = false;
            match self.strategy.decide_release(self.lead) {
                ReleaseAction::Wait => {}
                ReleaseAction::ReleaseOldest => self.release_blocks(1, now, result),
                ReleaseAction::ReleaseAll => {
                    let all = self.withheld.len();
                    self.release_blocks(all, now, result);
                    self.lead = 0;
                }
            }
        }

        let mut candidate = CandidateBlock::new(
            self.chain_head,
            self.balances.clone(),
            self.config.block_size_cap,
            now,
        );
        let target = self.rng.random_range(1..=self.config.max_block_txns);
        for tx in self.mempool.values() {
            if candidate.txn_count() >= target {
                break;
            }
            candidate.add(tx.clone());
        }
        let coinbase = Arc::new(Transaction::coinbase(
            self.id,
            self.config.coinbase_reward,
            now,
        ));
        candidate.add(coinbase);
        self.candidate = Some(candidate);

        let delay = millis(self.mining_delay.sample(&mut self.rng));
        result.wake_after(delay, SimulationEvent::FinishMining(self.id, self.mining_attempt));
    }

    /// Publish the oldest `count` withheld blocks to every neighbor.
    fn release_blocks(&mut self, count: usize, now: Timestamp, result: &mut EventResult) {
        let mut released = vec![];
        for _ in 0..count {
            let Some(block) = self.withheld.pop_front() else {
                break;
            };
            let height = self.heights[&block.id];
            self.public_height = self.public_height.max(height);
            for &peer in &self.neighbors {
                if self.sent_blocks.insert((peer, block.id)) {
                    self.tracker.track_block_sent(block.id, self.id, peer, now);
                    result.send_to(peer, SimulationMessage::Block(block.clone()));
                }
            }
            released.push(block.id);
        }
        if !released.is_empty() {
            self.tracker
                .track_blocks_released(self.id, released, self.withheld.len(), now);
        }
    }

    /// Replay a block's transactions against the balances the adopted chain
    /// currently produces. Branch history is not reconstructed for
    /// validation, so a block that spends coins its branch holds can still
    /// be rejected when the local chain disagrees.
    fn validate_block(&self, block: &Block) -> bool {
        let mut balances = self.balances.clone();
        for tx in &block.transactions {
            if let Some(sender) = tx.sender {
                if balances[sender.to_inner()] < tx.amount {
                    return false;
                }
                balances[sender.to_inner()] -= tx.amount;
            }
            balances[tx.receiver.to_inner()] += tx.amount;
        }
        true
    }

    /// Apply a block at the tip of the adopted chain: transfer its coins and
    /// drop its transactions from the pending pool.
    fn apply_block(&mut self, block: &Block) {
        for tx in &block.transactions {
            if let Some(sender) = tx.sender {
                self.balances[sender.to_inner()] -= tx.amount;
            }
            self.balances[tx.receiver.to_inner()] += tx.amount;
            self.mempool.remove(&tx.id);
        }
    }

    /// Switch the adopted chain to the branch ending at `new_tip`: roll the
    /// old branch back to the fork point, then replay the new branch from
    /// there. Rolled-back transactions return to the pending pool, except
    /// coinbases, which exist only inside the block that minted them.
    fn reorg_to(&mut self, now: Timestamp, new_tip: &Arc<Block>) {
        let old_head = self.chain_head;
        let fork = self.find_fork_point(old_head, new_tip.id);

        let mut rolled_back = 0;
        let mut cursor = old_head;
        while cursor != fork {
            let block = self.blocks[&cursor].clone();
            for tx in block.transactions.iter().rev() {
                match tx.sender {
                    Some(sender) => {
                        self.balances[sender.to_inner()] += tx.amount;
                        self.balances[tx.receiver.to_inner()] -= tx.amount;
                        self.mempool.insert(tx.id, tx.clone());
                    }
                    None => self.balances[tx.receiver.to_inner()] -= tx.amount,
                }
            }
            rolled_back += 1;
            cursor = self.parent_of(cursor);
        }

        let mut branch = vec![];
        let mut cursor = new_tip.id;
        while cursor != fork {
            branch.push(cursor);
            cursor = self.parent_of(cursor);
        }
        for id in branch.into_iter().rev() {
            let block = self.blocks[&id].clone();
            self.apply_block(&block);
        }

        self.chain_height = self.heights[&new_tip.id];
        self.chain_head = new_tip.id;
        self.tracker
            .track_chain_reorged(self.id, old_head, new_tip.id, fork, rolled_back, now);
    }

    /// Deepest common ancestor of two recorded blocks. Every non-genesis
    /// block in the tree has a recorded parent, so the walk always meets, at
    /// genesis in the worst case.
    pub(crate) fn find_fork_point(&self, a: BlockId, b: BlockId) -> BlockId {
        let (mut a, mut b) = (a, b);
        let (mut height_a, mut height_b) = (self.heights[&a], self.heights[&b]);
        while height_a > height_b {
            a = self.parent_of(a);
            height_a -= 1;
        }
        while height_b > height_a {
            b = self.parent_of(b);
            height_b -= 1;
        }
        while a != b {
            a = self.parent_of(a);
            b = self.parent_of(b);
        }
        a
    }

    fn parent_of(&self, id: BlockId) -> BlockId {
        self.blocks[&id]
            .parent
            .expect("non-genesis blocks have parents")
    }

    fn flood_transaction(&mut self, tx: &Arc<Transaction>, now: Timestamp, result: &mut EventResult) {
        for &peer in &self.neighbors {
            if self.sent_txs.insert((peer, tx.id)) {
                self.tracker.track_transaction_sent(tx.id, self.id, peer, now);
                result.send_to(peer, SimulationMessage::Tx(tx.clone()));
            }
        }
    }

    fn forward_block(&mut self, block: &Arc<Block>, now: Timestamp, result: &mut EventResult) {
        for &peer in &self.neighbors {
            if self.sent_blocks.insert((peer, block.id)) {
                self.tracker.track_block_sent(block.id, self.id, peer, now);
                result.send_to(peer, SimulationMessage::Block(block.clone()));
            }
        }
    }

    fn schedule_next_tx(&mut self, _now: Timestamp, result: &mut EventResult) {
        let delay = millis(self.tx_interarrival.sample(&mut self.rng));
        result.wake_after(delay, SimulationEvent::GenerateTx(self.id));
    }

    fn choose_receiver(&mut self) -> NodeId {
        let mut receiver = self.rng.random_range(0..self.config.nodes.len() - 1);
        if receiver >= self.id.to_inner() {
            receiver += 1;
        }
        NodeId::new(receiver)
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn strategy(&self) -> MinerStrategy {
        self.strategy
    }

    pub fn chain_head(&self) -> BlockId {
        self.chain_head
    }

    pub fn chain_height(&self) -> u64 {
        self.chain_height
    }

    pub fn balances(&self) -> &[f64] {
        &self.balances
    }

    /// Blocks this peer mined over the whole run, adopted or not.
    pub fn blocks_mined(&self) -> u64 {
        self.blocks_mined
    }

    pub fn lead(&self) -> u64 {
        self.lead
    }

    pub fn withheld(&self) -> WithheldSnapshot {
        WithheldSnapshot {
            lead: self.lead,
            blocks: self.withheld.iter().map(|b| b.id).collect(),
        }
    }

    pub fn known_blocks(&self) -> impl Iterator<Item = &Arc<Block>> {
        self.blocks.values()
    }

    pub fn height_of(&self, id: BlockId) -> Option<u64> {
        self.heights.get(&id).copied()
    }

    pub fn arrival_of(&self, id: BlockId) -> Option<Timestamp> {
        self.arrivals.get(&id).copied()
    }

    pub fn pending_txns(&self) -> usize {
        self.mempool.len()
    }

    #[cfg(test)]
    pub(crate) fn has_pending_txn(&self, id: TransactionId) -> bool {
        self.mempool.contains_key(&id)
    }

    /// Ids of the blocks on the adopted chain, tip first, genesis excluded.
    pub fn main_chain(&self) -> Vec<BlockId> {
        let mut chain = vec![];
        let mut cursor = self.chain_head;
        while let Some(parent) = self.blocks[&cursor].parent {
            chain.push(cursor);
            cursor = parent;
        }
        chain
    }

    pub fn chain_stats(&self) -> ChainStats {
        let mut mined_per_node = vec![0; self.config.nodes.len()];
        for id in self.main_chain() {
            if let Some(miner) = self.blocks[&id].miner {
                mined_per_node[miner.to_inner()] += 1;
            }
        }
        ChainStats {
            height: self.chain_height,
            mined_per_node,
        }
    }
}
