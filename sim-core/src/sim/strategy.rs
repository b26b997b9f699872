use crate::config::AttackerStrategy;

/// Mining policy of a peer. One `Peer` implementation covers every policy;
/// the strategy only decides whether freshly mined blocks are withheld and
/// when withheld blocks are released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MinerStrategy {
    Honest,
    Selfish,
    Stubborn,
}

impl From<Option<AttackerStrategy>> for MinerStrategy {
    fn from(value: Option<AttackerStrategy>) -> Self {
        match value {
            None => Self::Honest,
            Some(AttackerStrategy::Selfish) => Self::Selfish,
            Some(AttackerStrategy::Stubborn) => Self::Stubborn,
        }
    }
}

/// What to do with the withheld branch at the top of a mining-loop iteration,
/// after the public chain advanced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseAction {
    Wait,
    ReleaseOldest,
    ReleaseAll,
}

impl MinerStrategy {
    pub fn withholds(&self) -> bool {
        !matches!(self, Self::Honest)
    }

    /// Release policy, evaluated with the lead as it stands after the public
    /// advance was counted. A selfish miner dumps its whole private branch
    /// once the lead is down to one (winning outright with two blocks in
    /// hand, or contesting the tie with its last one); with a larger lead it
    /// spends only the oldest block. A stubborn miner never releases more
    /// than the oldest.
    pub fn decide_release(&self, lead: u64) -> ReleaseAction {
        match self {
            Self::Honest => ReleaseAction::Wait,
            Self::Selfish => {
                if lead <= 1 {
                    ReleaseAction::ReleaseAll
                } else {
                    ReleaseAction::ReleaseOldest
                }
            }
            Self::Stubborn => ReleaseAction::ReleaseOldest,
        }
    }
}
