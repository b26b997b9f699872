use std::{
    fmt::Display,
    hash::{DefaultHasher, Hash, Hasher},
    sync::Arc,
};

use serde::Serialize;

use crate::{clock::Timestamp, config::NodeId};

macro_rules! id_wrapper {
    ($outer:ident, $inner:ty) => {
        #[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
        pub struct $outer($inner);
        impl Display for $outer {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{:016x}", self.0)
            }
        }
        impl Serialize for $outer {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.serialize_str(&self.to_string())
            }
        }
        impl $outer {
            #[allow(unused)]
            pub fn new(value: $inner) -> Self {
                Self(value)
            }
        }
    };
}

id_wrapper!(TransactionId, u64);
id_wrapper!(BlockId, u64);

/// A transfer of coins. A coinbase transaction has no sender and credits the
/// block's miner unconditionally.
///
/// The id is derived from the transaction's content plus its creation
/// instant; collisions are assumed away rather than enforced.
#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    pub id: TransactionId,
    pub sender: Option<NodeId>,
    pub receiver: NodeId,
    pub amount: f64,
    pub created_at: Timestamp,
}

impl Transaction {
    pub fn new(sender: Option<NodeId>, receiver: NodeId, amount: f64, created_at: Timestamp) -> Self {
        let mut hasher = DefaultHasher::new();
        sender.map(NodeId::to_inner).hash(&mut hasher);
        receiver.to_inner().hash(&mut hasher);
        amount.to_bits().hash(&mut hasher);
        created_at.as_nanos().hash(&mut hasher);
        Self {
            id: TransactionId(hasher.finish()),
            sender,
            receiver,
            amount,
            created_at,
        }
    }

    pub fn coinbase(receiver: NodeId, amount: f64, created_at: Timestamp) -> Self {
        Self::new(None, receiver, amount, created_at)
    }

    pub fn is_coinbase(&self) -> bool {
        self.sender.is_none()
    }
}

/// A sealed block. Immutable once mined; `parent` is `None` only for genesis.
#[derive(Debug, Clone)]
pub struct Block {
    pub id: BlockId,
    pub parent: Option<BlockId>,
    pub transactions: Vec<Arc<Transaction>>,
    pub created_at: Timestamp,
    pub miner: Option<NodeId>,
}

impl Block {
    pub fn genesis() -> Self {
        Self::seal(None, vec![], Timestamp::zero(), None)
    }

    fn seal(
        parent: Option<BlockId>,
        transactions: Vec<Arc<Transaction>>,
        created_at: Timestamp,
        miner: Option<NodeId>,
    ) -> Self {
        let mut hasher = DefaultHasher::new();
        parent.hash(&mut hasher);
        for tx in &transactions {
            tx.id.hash(&mut hasher);
        }
        created_at.as_nanos().hash(&mut hasher);
        miner.map(NodeId::to_inner).hash(&mut hasher);
        Self {
            id: BlockId(hasher.finish()),
            parent,
            transactions,
            created_at,
            miner,
        }
    }

    /// Size of the block for delay purposes: one unit of header weight plus
    /// one per non-coinbase transaction.
    pub fn weight(&self) -> u64 {
        1 + self
            .transactions
            .iter()
            .filter(|tx| !tx.is_coinbase())
            .count() as u64
    }
}

/// A block under assembly. Admission of a transaction runs against the
/// candidate's own running balance snapshot; the candidate never touches the
/// peer's live ledger until it is sealed and committed.
#[derive(Debug, Clone)]
pub struct CandidateBlock {
    parent: BlockId,
    balances: Vec<f64>,
    transactions: Vec<Arc<Transaction>>,
    weight: u64,
    size_cap: u64,
    created_at: Timestamp,
}

impl CandidateBlock {
    pub fn new(parent: BlockId, balances: Vec<f64>, size_cap: u64, created_at: Timestamp) -> Self {
        Self {
            parent,
            balances,
            transactions: vec![],
            // header weight; the cap check below compares against this
            // counter before incrementing it, so a block admits one regular
            // transaction beyond the point where the counter reaches the cap
            weight: 1,
            size_cap,
            created_at,
        }
    }

    /// Try to admit a transaction. Coinbase transactions always succeed and
    /// do not count against the size cap. Regular transactions are rejected,
    /// with no state change, when the block is full or the sender's running
    /// balance cannot cover the amount.
    pub fn add(&mut self, tx: Arc<Transaction>) -> bool {
        if self.weight > self.size_cap {
            return false;
        }
        let Some(sender) = tx.sender else {
            self.balances[tx.receiver.to_inner()] += tx.amount;
            self.transactions.push(tx);
            return true;
        };
        if self.balances[sender.to_inner()] < tx.amount {
            return false;
        }
        self.balances[sender.to_inner()] -= tx.amount;
        self.balances[tx.receiver.to_inner()] += tx.amount;
        self.transactions.push(tx);
        self.weight += 1;
        true
    }

    pub fn txn_count(&self) -> usize {
        self.transactions.len()
    }

    pub fn seal(self, miner: NodeId) -> Block {
        Block::seal(
            Some(self.parent),
            self.transactions,
            self.created_at,
            Some(miner),
        )
    }
}
