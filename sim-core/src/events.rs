use std::sync::{Arc, mpsc};

use serde::Serialize;
use tracing::warn;

use crate::{
    clock::Timestamp,
    config::NodeId,
    model::{Block, BlockId, Transaction, TransactionId},
};

/// Why a received block was dropped.
#[derive(Debug, Clone, Copy, Serialize)]
pub enum BlockRejectReason {
    /// Some contained transaction failed replay validation.
    InvalidTransaction,
    /// The parent is unknown; orphans are not buffered.
    UnknownParent,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum Event {
    TransactionGenerated {
        id: TransactionId,
        sender: NodeId,
        receiver: NodeId,
        amount: f64,
    },
    TransactionSent {
        id: TransactionId,
        sender: NodeId,
        recipient: NodeId,
    },
    TransactionReceived {
        id: TransactionId,
        sender: NodeId,
        recipient: NodeId,
    },
    BlockMined {
        id: BlockId,
        miner: NodeId,
        height: u64,
        transactions: Vec<TransactionId>,
        withheld: bool,
    },
    BlockSent {
        id: BlockId,
        sender: NodeId,
        recipient: NodeId,
    },
    BlockReceived {
        id: BlockId,
        sender: NodeId,
        recipient: NodeId,
    },
    BlockRejected {
        id: BlockId,
        recipient: NodeId,
        reason: BlockRejectReason,
    },
    ChainReorged {
        node: NodeId,
        old_head: BlockId,
        new_head: BlockId,
        fork_point: BlockId,
        rolled_back: u64,
    },
    BlocksReleased {
        miner: NodeId,
        blocks: Vec<BlockId>,
        remaining_withheld: usize,
    },
}

/// Fans structured events out to whoever is listening (the CLI's event
/// monitor); cheap to clone into every peer.
#[derive(Clone)]
pub struct EventTracker {
    sender: mpsc::Sender<(Event, Timestamp)>,
}

impl EventTracker {
    pub fn new(sender: mpsc::Sender<(Event, Timestamp)>) -> Self {
        Self { sender }
    }

    pub fn track_transaction_generated(&self, tx: &Transaction, at: Timestamp) {
        self.send(
            Event::TransactionGenerated {
                id: tx.id,
                sender: tx.sender.expect("generated transactions have a sender"),
                receiver: tx.receiver,
                amount: tx.amount,
            },
            at,
        );
    }

    pub fn track_transaction_sent(
        &self,
        id: TransactionId,
        sender: NodeId,
        recipient: NodeId,
        at: Timestamp,
    ) {
        self.send(
            Event::TransactionSent {
                id,
                sender,
                recipient,
            },
            at,
        );
    }

    pub fn track_transaction_received(
        &self,
        id: TransactionId,
        sender: NodeId,
        recipient: NodeId,
        at: Timestamp,
    ) {
        self.send(
            Event::TransactionReceived {
                id,
                sender,
                recipient,
            },
            at,
        );
    }

    pub fn track_block_mined(&self, block: &Arc<Block>, height: u64, withheld: bool, at: Timestamp) {
        self.send(
            Event::BlockMined {
                id: block.id,
                miner: block.miner.expect("mined blocks have a miner"),
                height,
                transactions: block.transactions.iter().map(|tx| tx.id).collect(),
                withheld,
            },
            at,
        );
    }

    pub fn track_block_sent(&self, id: BlockId, sender: NodeId, recipient: NodeId, at: Timestamp) {
        self.send(
            Event::BlockSent {
                id,
                sender,
                recipient,
            },
            at,
        );
    }

    pub fn track_block_received(
        &self,
        id: BlockId,
        sender: NodeId,
        recipient: NodeId,
        at: Timestamp,
    ) {
        self.send(
            Event::BlockReceived {
                id,
                sender,
                recipient,
            },
            at,
        );
    }

    pub fn track_block_rejected(
        &self,
        id: BlockId,
        recipient: NodeId,
        reason: BlockRejectReason,
        at: Timestamp,
    ) {
        self.send(
            Event::BlockRejected {
                id,
                recipient,
                reason,
            },
            at,
        );
    }

    #[allow(clippy::too_many_arguments)]
    pub fn track_chain_reorged(
        &self,
        node: NodeId,
        old_head: BlockId,
        new_head: BlockId,
        fork_point: BlockId,
        rolled_back: u64,
        at: Timestamp,
    ) {
        self.send(
            Event::ChainReorged {
                node,
                old_head,
                new_head,
                fork_point,
                rolled_back,
            },
            at,
        );
    }

    pub fn track_blocks_released(
        &self,
        miner: NodeId,
        blocks: Vec<BlockId>,
        remaining_withheld: usize,
        at: Timestamp,
    ) {
        self.send(
            Event::BlocksReleased {
                miner,
                blocks,
                remaining_withheld,
            },
            at,
        );
    }

    fn send(&self, event: Event, at: Timestamp) {
        if self.sender.send((event, at)).is_err() {
            warn!("tried sending event after the monitor finished");
        }
    }
}
