use std::sync::{Arc, mpsc};

use rand_chacha::{ChaChaRng, rand_core::SeedableRng};

use crate::{
    clock::{Timestamp, millis},
    config::{
        AttackerStrategy, CpuClass, LinkClass, NodeId, RawAttackerConfig, RawConfig,
        RawDelayConfig, RawLinkConfig, RawNodeConfig, SimConfiguration,
    },
    events::{Event, EventTracker},
    model::{Block, CandidateBlock, Transaction},
};

use super::{Peer, Simulation, SimulationMessage};

fn raw_config(n: usize, links: Vec<(usize, usize)>) -> RawConfig {
    RawConfig {
        seed: Some(42),
        horizon_ms: 60_000.0,
        tx_interarrival_ms: 500.0,
        block_interval_ms: 2_000.0,
        max_block_txns: 5,
        block_size_cap: 100,
        coinbase_reward: 50.0,
        max_tx_amount: 30.0,
        delays: RawDelayConfig::default(),
        nodes: (0..n)
            .map(|i| RawNodeConfig {
                link: if i % 2 == 0 {
                    LinkClass::Fast
                } else {
                    LinkClass::Slow
                },
                cpu: if i % 3 == 0 {
                    CpuClass::High
                } else {
                    CpuClass::Low
                },
            })
            .collect(),
        links: links
            .into_iter()
            .map(|nodes| RawLinkConfig { nodes })
            .collect(),
        attacker: None,
    }
}

fn full_mesh(n: usize) -> Vec<(usize, usize)> {
    (0..n)
        .flat_map(|a| ((a + 1)..n).map(move |b| (a, b)))
        .collect()
}

fn run_sim(raw: RawConfig) -> (Simulation, Vec<Event>) {
    let (sender, receiver) = mpsc::channel();
    let mut sim = Simulation::new(raw.build().unwrap(), EventTracker::new(sender)).unwrap();
    sim.run();
    let events = receiver.try_iter().map(|(event, _)| event).collect();
    (sim, events)
}

fn test_peer(config: &Arc<SimConfiguration>, index: usize, genesis: &Arc<Block>) -> Peer {
    let (sender, receiver) = mpsc::channel();
    // peers keep their tracker clone alive; events pile up unread
    std::mem::forget(receiver);
    Peer::new(
        &config.nodes[index],
        config.clone(),
        genesis.clone(),
        EventTracker::new(sender),
        ChaChaRng::seed_from_u64(index as u64 + 7),
    )
}

/// A sealed block for hand-driven scenarios. The candidate's balance
/// snapshot is padded so admission never interferes with the test.
fn mined_block(
    parent: &Block,
    miner: usize,
    txs: Vec<Arc<Transaction>>,
    n: usize,
    at: Timestamp,
) -> Arc<Block> {
    let mut candidate = CandidateBlock::new(parent.id, vec![1_000.0; n], 1_000, at);
    for tx in txs {
        assert!(candidate.add(tx));
    }
    candidate.add(Arc::new(Transaction::coinbase(
        NodeId::new(miner),
        50.0,
        at,
    )));
    Arc::new(candidate.seal(NodeId::new(miner)))
}

fn at(ms: f64) -> Timestamp {
    Timestamp::zero() + millis(ms)
}

#[test]
fn honest_run_conserves_minted_coins() {
    let (sim, events) = run_sim(raw_config(4, full_mesh(4)));
    let peer = &sim.peers()[0];
    assert!(peer.chain_height() > 0, "no blocks were mined in a minute");

    // every coin on the adopted chain came out of a coinbase; transfers
    // are zero-sum
    let total: f64 = peer.balances().iter().sum();
    let minted = 50.0 * peer.chain_height() as f64;
    assert!(
        (total - minted).abs() < 1e-6,
        "total {total} vs minted {minted}"
    );

    for (node, balance) in peer.balances().iter().enumerate() {
        assert!(*balance >= -1e-9, "node {node} went negative: {balance}");
    }

    let mined_events = events
        .iter()
        .filter(|event| matches!(event, Event::BlockMined { .. }))
        .count() as u64;
    assert_eq!(mined_events, sim.blocks_mined());
    assert!(sim.blocks_mined() >= peer.chain_height());
}

#[test]
fn seeded_runs_are_reproducible() {
    let (one, _) = run_sim(raw_config(4, full_mesh(4)));
    let (two, _) = run_sim(raw_config(4, full_mesh(4)));
    assert_eq!(one.blocks_mined(), two.blocks_mined());
    for (a, b) in one.peers().iter().zip(two.peers()) {
        assert_eq!(a.chain_head(), b.chain_head());
        assert_eq!(a.balances(), b.balances());
    }
}

#[test]
fn reorg_rolls_back_to_fork_point_and_repools_transactions() {
    let config = Arc::new(raw_config(2, vec![(0, 1)]).build().unwrap());
    let genesis = Arc::new(Block::genesis());
    let mut peer = test_peer(&config, 0, &genesis);
    let other = NodeId::new(1);

    // branch A: a coinbase funding node 1, then a block spending from it
    let transfer = Arc::new(Transaction::new(Some(other), NodeId::new(0), 10.0, at(5.0)));
    let a1 = mined_block(&genesis, 1, vec![], 2, at(10.0));
    let a2 = mined_block(&a1, 1, vec![transfer.clone()], 2, at(20.0));
    peer.handle_receive_tx(at(6.0), other, transfer.clone());
    peer.handle_receive_block(at(11.0), other, a1.clone());
    peer.handle_receive_block(at(21.0), other, a2.clone());
    assert_eq!(peer.chain_head(), a2.id);
    assert_eq!(peer.chain_height(), 2);
    assert!(!peer.has_pending_txn(transfer.id));
    assert!((peer.balances()[0] - 10.0).abs() < 1e-9);
    assert!((peer.balances()[1] - 90.0).abs() < 1e-9);

    // branch B outgrows branch A; its blocks carry only coinbases
    let b1 = mined_block(&genesis, 1, vec![], 2, at(12.0));
    let b2 = mined_block(&b1, 1, vec![], 2, at(22.0));
    let b3 = mined_block(&b2, 1, vec![], 2, at(32.0));
    peer.handle_receive_block(at(13.0), other, b1.clone());
    peer.handle_receive_block(at(23.0), other, b2.clone());
    assert_eq!(peer.chain_head(), a2.id, "a tie must not displace the head");
    peer.handle_receive_block(at(33.0), other, b3.clone());

    assert_eq!(peer.chain_head(), b3.id);
    assert_eq!(peer.chain_height(), 3);
    assert_eq!(peer.find_fork_point(a2.id, b3.id), genesis.id);
    // the transfer went back to the pool; the rolled-back coinbases did not
    assert!(peer.has_pending_txn(transfer.id));
    assert!(peer.balances()[0].abs() < 1e-9);
    assert!((peer.balances()[1] - 150.0).abs() < 1e-9);
}

#[test]
fn adopted_chain_is_independent_of_arrival_order() {
    let config = Arc::new(raw_config(2, vec![(0, 1)]).build().unwrap());
    let genesis = Arc::new(Block::genesis());
    let other = NodeId::new(1);

    let a1 = mined_block(&genesis, 1, vec![], 2, at(10.0));
    let a2 = mined_block(&a1, 1, vec![], 2, at(20.0));
    let b1 = mined_block(&genesis, 1, vec![], 2, at(12.0));
    let b2 = mined_block(&b1, 1, vec![], 2, at(22.0));
    let b3 = mined_block(&b2, 1, vec![], 2, at(32.0));

    let orders: [Vec<&Arc<Block>>; 2] = [
        vec![&a1, &a2, &b1, &b2, &b3],
        vec![&b1, &a1, &b2, &a2, &b3],
    ];
    let peers: Vec<Peer> = orders
        .into_iter()
        .map(|order| {
            let mut peer = test_peer(&config, 0, &genesis);
            for (step, block) in order.into_iter().enumerate() {
                peer.handle_receive_block(at(100.0 + step as f64), other, block.clone());
            }
            peer
        })
        .collect();

    assert_eq!(peers[0].chain_head(), b3.id);
    assert_eq!(peers[0].chain_head(), peers[1].chain_head());
    assert_eq!(peers[0].balances(), peers[1].balances());
}

#[test]
fn overspending_block_is_rejected_and_not_forwarded() {
    let config = Arc::new(raw_config(2, vec![(0, 1)]).build().unwrap());
    let genesis = Arc::new(Block::genesis());
    let mut peer = test_peer(&config, 0, &genesis);
    let other = NodeId::new(1);

    // node 1 holds nothing on this peer's chain, so the spend cannot replay
    let overspend = Arc::new(Transaction::new(Some(other), NodeId::new(0), 5.0, at(1.0)));
    let mut candidate = CandidateBlock::new(genesis.id, vec![1_000.0; 2], 1_000, at(2.0));
    assert!(candidate.add(overspend));
    let bad = Arc::new(candidate.seal(other));

    let result = peer.handle_receive_block(at(3.0), other, bad.clone());
    assert!(result.messages.is_empty());
    assert!(peer.height_of(bad.id).is_none());
    assert_eq!(peer.chain_head(), genesis.id);
}

#[test]
fn orphan_block_is_dropped_not_buffered() {
    let config = Arc::new(raw_config(2, vec![(0, 1)]).build().unwrap());
    let genesis = Arc::new(Block::genesis());
    let mut peer = test_peer(&config, 0, &genesis);
    let other = NodeId::new(1);

    let unseen_parent = mined_block(&genesis, 1, vec![], 2, at(10.0));
    let orphan = mined_block(&unseen_parent, 1, vec![], 2, at(20.0));
    let result = peer.handle_receive_block(at(21.0), other, orphan.clone());
    assert!(result.messages.is_empty());
    assert!(peer.height_of(orphan.id).is_none());

    // the parent arriving later does not resurrect the orphan
    peer.handle_receive_block(at(22.0), other, unseen_parent.clone());
    assert_eq!(peer.chain_height(), 1);
    assert!(peer.height_of(orphan.id).is_none());
}

fn attacker_config(strategy: AttackerStrategy) -> RawConfig {
    let mut raw = raw_config(2, vec![(0, 1)]);
    raw.attacker = Some(RawAttackerConfig {
        node: 0,
        strategy,
        power: Some(0.3),
    });
    raw
}

#[test]
fn selfish_miner_dumps_branch_when_public_chain_closes_in() {
    let config = Arc::new(attacker_config(AttackerStrategy::Selfish).build().unwrap());
    let genesis = Arc::new(Block::genesis());
    let mut attacker = test_peer(&config, 0, &genesis);
    let other = NodeId::new(1);

    attacker.start(at(0.0));
    let first = attacker.handle_finish_mining(at(100.0), 1);
    assert!(first.mined.is_some());
    assert!(first.messages.is_empty(), "withheld blocks must not leak");
    let second = attacker.handle_finish_mining(at(200.0), 2);
    assert!(second.mined.is_some());
    assert_eq!(attacker.lead(), 2);
    assert_eq!(attacker.withheld().blocks.len(), 2);
    assert_eq!(attacker.chain_height(), 2);

    // an honest block at height 1 cuts the lead to 1; the whole private
    // branch goes public in response
    let public = mined_block(&genesis, 1, vec![], 2, at(150.0));
    let result = attacker.handle_receive_block(at(250.0), other, public);
    let released: Vec<_> = result
        .messages
        .iter()
        .filter(|(to, msg)| *to == other && matches!(msg, SimulationMessage::Block(_)))
        .collect();
    assert_eq!(released.len(), 2);
    assert_eq!(attacker.lead(), 0);
    assert!(attacker.withheld().blocks.is_empty());
    assert_eq!(attacker.blocks_mined(), 2);
}

#[test]
fn stubborn_miner_spends_withheld_blocks_one_at_a_time() {
    let config = Arc::new(attacker_config(AttackerStrategy::Stubborn).build().unwrap());
    let genesis = Arc::new(Block::genesis());
    let mut attacker = test_peer(&config, 0, &genesis);
    let other = NodeId::new(1);

    attacker.start(at(0.0));
    attacker.handle_finish_mining(at(100.0), 1);
    attacker.handle_finish_mining(at(200.0), 2);
    let withheld = attacker.withheld();
    assert_eq!(withheld.blocks.len(), 2);
    let oldest = withheld.blocks[0];

    let public = mined_block(&genesis, 1, vec![], 2, at(150.0));
    let result = attacker.handle_receive_block(at(250.0), other, public);
    let released: Vec<_> = result
        .messages
        .iter()
        .filter_map(|(_, msg)| match msg {
            SimulationMessage::Block(block) => Some(block.id),
            SimulationMessage::Tx(_) => None,
        })
        .collect();
    assert_eq!(released, vec![oldest]);
    assert_eq!(attacker.lead(), 1);
    assert_eq!(attacker.withheld().blocks.len(), 1);
}

#[test]
fn stale_mining_attempt_is_ignored() {
    let config = Arc::new(raw_config(2, vec![(0, 1)]).build().unwrap());
    let genesis = Arc::new(Block::genesis());
    let mut peer = test_peer(&config, 0, &genesis);
    let other = NodeId::new(1);

    peer.start(at(0.0));
    // a new head cancels the outstanding attempt...
    let public = mined_block(&genesis, 1, vec![], 2, at(10.0));
    peer.handle_receive_block(at(11.0), other, public.clone());
    let stale = peer.handle_finish_mining(at(12.0), 1);
    assert!(stale.mined.is_none());
    assert_eq!(peer.chain_head(), public.id);

    // ...while the reissued attempt still completes
    let fresh = peer.handle_finish_mining(at(13.0), 2);
    assert!(fresh.mined.is_some());
    assert_eq!(peer.chain_height(), 2);
}

#[test]
fn attacker_run_keeps_lead_consistent_with_withheld_blocks() {
    let (sim, _) = {
        let mut raw = raw_config(5, full_mesh(5));
        raw.attacker = Some(RawAttackerConfig {
            node: 0,
            strategy: AttackerStrategy::Selfish,
            power: Some(0.35),
        });
        run_sim(raw)
    };
    let attacker = &sim.peers()[0];
    let snapshot = attacker.withheld();
    assert_eq!(snapshot.lead, snapshot.blocks.len() as u64);

    let observer = &sim.peers()[1];
    let stats = observer.chain_stats();
    assert_eq!(stats.height, observer.chain_height());
    let adopted: u64 = stats.mined_per_node.iter().sum();
    assert_eq!(adopted, stats.height);

    let mpu = sim.mpu_overall(observer.id());
    assert!((0.0..=1.0).contains(&mpu), "mpu out of range: {mpu}");
}
