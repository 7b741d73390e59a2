//! Round State Definitions
//!
//! Data types for one play cycle: the round, its phase, and the bets placed
//! in it. These are plain data; only the round engine mutates them.
//! Uses BTreeMap so settlement and RESULT listings iterate in player order.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Player identifier, assigned by the session registry on connect.
///
/// The engine and ledger hold only this id, never the connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlayerId(pub u64);

impl PlayerId {
    /// Create from a raw id.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Raw id.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "player-{}", self.0)
    }
}

/// Monotonic round identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoundId(pub u64);

impl RoundId {
    /// The id that follows this one.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for RoundId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// =============================================================================
// PHASE
// =============================================================================

/// Current phase of the round.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoundPhase {
    /// Bets are open
    Betting,
    /// Multiplier is climbing; cash-outs are open
    Flying,
    /// Crashed; settled and waiting for the next round
    Exploded,
}

impl RoundPhase {
    /// Upper-case wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Betting => "BETTING",
            Self::Flying => "FLYING",
            Self::Exploded => "EXPLODED",
        }
    }
}

impl fmt::Display for RoundPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// BET
// =============================================================================

/// Lifecycle of a bet.
///
/// `Pending` moves to `CashedOut` on a successful cash-out or to `Lost` at
/// settlement. Settlement relabels `CashedOut` as `Won`; the payout locked at
/// cash-out never changes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetStatus {
    /// Stake is riding on the current flight
    Pending,
    /// Cashed out before the crash, awaiting settlement
    CashedOut,
    /// Settled with a payout
    Won,
    /// Settled with nothing
    Lost,
}

/// One player's stake in one round.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bet {
    /// Owner
    pub player_id: PlayerId,
    /// Round the stake belongs to
    pub round_id: RoundId,
    /// Positive stake
    pub stake: f64,
    /// Current status
    pub status: BetStatus,
    /// Multiplier locked at cash-out (set only once cashed out)
    pub cashout_multiplier: Option<f64>,
    /// Owner disconnected while the bet was pending
    pub forfeited: bool,
}

impl Bet {
    /// Create a pending bet.
    pub fn new(player_id: PlayerId, round_id: RoundId, stake: f64) -> Self {
        Self {
            player_id,
            round_id,
            stake,
            status: BetStatus::Pending,
            cashout_multiplier: None,
            forfeited: false,
        }
    }

    /// Still riding?
    #[inline]
    pub fn is_pending(&self) -> bool {
        self.status == BetStatus::Pending
    }

    /// Amount paid to the player: stake x cash-out multiplier, or zero.
    pub fn payout(&self) -> f64 {
        match (self.status, self.cashout_multiplier) {
            (BetStatus::CashedOut | BetStatus::Won, Some(m)) => self.stake * m,
            _ => 0.0,
        }
    }
}

// =============================================================================
// ROUND
// =============================================================================

/// The single active round.
#[derive(Clone, Debug)]
pub struct Round {
    /// Monotonic id
    pub id: RoundId,
    /// Current phase
    pub phase: RoundPhase,
    /// When the current phase began
    pub phase_started_at: Instant,
    /// When the flight began (set on BETTING -> FLYING)
    pub flight_started_at: Option<Instant>,
    /// Crash point, drawn once on BETTING -> FLYING
    crash_multiplier: Option<f64>,
    /// Bets keyed by player (at most one each)
    pub bets: BTreeMap<PlayerId, Bet>,
}

impl Round {
    /// Open a new round in BETTING.
    pub fn new(id: RoundId, now: Instant) -> Self {
        Self {
            id,
            phase: RoundPhase::Betting,
            phase_started_at: now,
            flight_started_at: None,
            crash_multiplier: None,
            bets: BTreeMap::new(),
        }
    }

    /// Fix the crash point. Can only happen once per round.
    pub fn set_crash_multiplier(&mut self, crash: f64) {
        assert!(
            self.crash_multiplier.is_none(),
            "crash multiplier for round {} drawn twice",
            self.id
        );
        self.crash_multiplier = Some(crash);
    }

    /// Crash point as the engine sees it (hidden from players until EXPLODED).
    pub fn crash_multiplier(&self) -> Option<f64> {
        self.crash_multiplier
    }

    /// Crash point, visible only once the round has exploded.
    pub fn revealed_crash(&self) -> Option<f64> {
        match self.phase {
            RoundPhase::Exploded => self.crash_multiplier,
            _ => None,
        }
    }

    /// Enter a new phase.
    pub fn transition(&mut self, phase: RoundPhase, now: Instant) {
        self.phase = phase;
        self.phase_started_at = now;
    }

    /// Get a player's bet.
    pub fn bet(&self, player_id: &PlayerId) -> Option<&Bet> {
        self.bets.get(player_id)
    }

    /// Get a player's bet mutably.
    pub fn bet_mut(&mut self, player_id: &PlayerId) -> Option<&mut Bet> {
        self.bets.get_mut(player_id)
    }
}
