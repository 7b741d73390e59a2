//! Bet Ledger
//!
//! Append-only history of settled rounds. The round engine is the only
//! writer; reporting code reads through a shared [`LedgerHandle`].

use std::collections::BTreeSet;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::game::state::{Bet, BetStatus, RoundId};

/// A round as archived at the end of EXPLODED settlement.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SettledRound {
    /// Round identifier
    pub round_id: RoundId,
    /// Revealed crash point
    pub crash_multiplier: f64,
    /// Wall-clock settlement time
    pub settled_at: DateTime<Utc>,
    /// Every bet in its terminal state, ordered by player
    pub bets: Vec<Bet>,
}

impl SettledRound {
    /// Sum of stakes.
    pub fn total_wagered(&self) -> f64 {
        self.bets.iter().map(|b| b.stake).sum()
    }

    /// Sum of payouts.
    pub fn total_paid(&self) -> f64 {
        self.bets.iter().map(Bet::payout).sum()
    }

    /// Bets lost because their owner left before settlement.
    pub fn forfeited(&self) -> impl Iterator<Item = &Bet> {
        self.bets.iter().filter(|b| b.forfeited)
    }
}

/// Aggregate figures across the whole ledger.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerStats {
    /// Rounds archived
    pub rounds: usize,
    /// Bets archived
    pub bets: usize,
    /// Sum of stakes
    pub total_wagered: f64,
    /// Sum of payouts
    pub total_paid: f64,
}

impl LedgerStats {
    /// Wagered minus paid.
    pub fn house_profit(&self) -> f64 {
        self.total_wagered - self.total_paid
    }

    /// Observed house edge, or `None` before anything was wagered.
    pub fn realized_edge(&self) -> Option<f64> {
        if self.total_wagered > 0.0 {
            Some(self.house_profit() / self.total_wagered)
        } else {
            None
        }
    }
}

/// Append-only record of settled rounds.
#[derive(Debug, Default)]
pub struct BetLedger {
    rounds: Vec<SettledRound>,
}

impl BetLedger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Archive a settled round.
    ///
    /// # Panics
    ///
    /// Panics on engine defects: a round archived twice or out of order, a
    /// bet that is still pending or belongs to another round, or two bets
    /// for one player.
    pub fn append(&mut self, round: SettledRound) {
        if let Some(last) = self.rounds.last() {
            assert!(
                round.round_id > last.round_id,
                "round {} archived after round {}",
                round.round_id,
                last.round_id
            );
        }

        let mut seen = BTreeSet::new();
        for bet in &round.bets {
            assert!(
                seen.insert(bet.player_id),
                "two bets for {} in round {}",
                bet.player_id,
                round.round_id
            );
            assert_eq!(bet.round_id, round.round_id, "bet filed under wrong round");
            assert!(
                matches!(bet.status, BetStatus::Won | BetStatus::Lost),
                "unsettled bet for {} in round {}",
                bet.player_id,
                round.round_id
            );
        }

        self.rounds.push(round);
    }

    /// All archived rounds, oldest first.
    pub fn rounds(&self) -> &[SettledRound] {
        &self.rounds
    }

    /// Look up one round.
    pub fn round(&self, round_id: RoundId) -> Option<&SettledRound> {
        // Ids are strictly increasing, so the archive is sorted.
        self.rounds
            .binary_search_by_key(&round_id, |r| r.round_id)
            .ok()
            .map(|idx| &self.rounds[idx])
    }

    /// Most recent crash points, newest first.
    pub fn recent_crashes(&self, count: usize) -> Vec<f64> {
        self.rounds
            .iter()
            .rev()
            .take(count)
            .map(|r| r.crash_multiplier)
            .collect()
    }

    /// Number of archived rounds.
    pub fn len(&self) -> usize {
        self.rounds.len()
    }

    /// True before the first settlement.
    pub fn is_empty(&self) -> bool {
        self.rounds.is_empty()
    }

    /// Totals across every archived round.
    pub fn stats(&self) -> LedgerStats {
        self.rounds.iter().fold(LedgerStats::default(), |mut acc, r| {
            acc.rounds += 1;
            acc.bets += r.bets.len();
            acc.total_wagered += r.total_wagered();
            acc.total_paid += r.total_paid();
            acc
        })
    }
}

/// Shared, read-mostly handle to the ledger.
#[derive(Clone, Debug, Default)]
pub struct LedgerHandle {
    inner: Arc<RwLock<BetLedger>>,
}

impl LedgerHandle {
    /// Create a handle around an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read access for reporting.
    pub fn read(&self) -> RwLockReadGuard<'_, BetLedger> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a settled round. Only the round engine calls this.
    pub(crate) fn append(&self, round: SettledRound) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .append(round);
    }
}
