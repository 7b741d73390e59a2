//! Round Engine
//!
//! The single authoritative state machine for round phase, crash point and
//! bet resolution. Every mutation of [`Round`] and [`Bet`] happens here, one
//! [`InboundEvent`] at a time, in queue order.
//!
//! ```text
//!   BETTING --(T_bet elapsed: draw crash)--> FLYING
//!   FLYING  --(multiplier(t) >= crash)-----> EXPLODED (settle, archive)
//!   EXPLODED --(pause elapsed)-------------> BETTING (next round id)
//! ```
//!
//! The engine never reads the clock itself; callers pass `now` with each
//! event, so tests drive time directly. A cash-out is priced at the moment
//! it is dequeued. If the curve has already reached the crash point by then,
//! the crash is processed first and the cash-out loses.

use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::config::{check_range, env_millis, env_parse, ConfigError};
use crate::core::crash::{floor_cents, CrashModel};
use crate::core::rng::{round_seed_digest, DeterministicRng};
use crate::game::events::{ClientRequest, EngineEventData, InboundEvent, Outbound};
use crate::game::ledger::{LedgerHandle, SettledRound};
use crate::game::state::{Bet, BetStatus, PlayerId, Round, RoundId, RoundPhase};

/// Round timing and economics.
#[derive(Debug, Clone)]
pub struct GameConfig {
    /// Length of the BETTING window (`T_bet`).
    pub bet_window: Duration,
    /// Pause between settlement and the next BETTING phase.
    pub round_pause: Duration,
    /// Cadence of timer ticks (UPDATE broadcasts and crash checks).
    pub tick_interval: Duration,
    /// Crash distribution and growth curve.
    pub crash: CrashModel,
    /// Server seed; each round's RNG is derived from it.
    pub seed: u64,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            bet_window: Duration::from_secs(10),
            round_pause: Duration::from_secs(3),
            tick_interval: Duration::from_millis(100),
            crash: CrashModel::default(),
            seed: time_seed(),
        }
    }
}

impl GameConfig {
    /// Defaults overridden by `CRASH_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(d) = env_millis("CRASH_BET_WINDOW_MS")? {
            config.bet_window = d;
        }
        if let Some(d) = env_millis("CRASH_ROUND_PAUSE_MS")? {
            config.round_pause = d;
        }
        if let Some(d) = env_millis("CRASH_TICK_MS")? {
            if d.is_zero() {
                return Err(ConfigError::OutOfRange {
                    key: "CRASH_TICK_MS",
                    reason: "must be at least 1ms",
                });
            }
            config.tick_interval = d;
        }
        if let Some(edge) = env_parse::<f64>("CRASH_HOUSE_EDGE")? {
            config.crash.house_edge = check_range("CRASH_HOUSE_EDGE", edge, 0.0, 0.99, "0.0..=0.99")?;
        }
        if let Some(rate) = env_parse::<f64>("CRASH_GROWTH_RATE")? {
            config.crash.growth_rate = check_range("CRASH_GROWTH_RATE", rate, 1e-6, 100.0, "positive")?;
        }
        if let Some(max) = env_parse::<f64>("CRASH_MAX_MULTIPLIER")? {
            config.crash.max_multiplier = check_range("CRASH_MAX_MULTIPLIER", max, 1.0, 1e9, ">= 1.0")?;
        }
        if let Some(seed) = env_parse::<u64>("CRASH_SEED")? {
            config.seed = seed;
        }

        Ok(config)
    }
}

/// Seed from the wall clock.
fn time_seed() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

/// Reasons a player request is refused.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    /// Action submitted in the wrong phase.
    #[error("{action} is not allowed during {phase}")]
    WrongPhase {
        /// Requested action.
        action: &'static str,
        /// Phase at processing time.
        phase: RoundPhase,
    },

    /// Player already holds a bet this round.
    #[error("already placed a bet in round {round_id}")]
    DuplicateBet {
        /// Current round.
        round_id: RoundId,
    },

    /// Stake is not a positive number.
    #[error("invalid bet amount {amount}")]
    InvalidAmount {
        /// Rejected stake.
        amount: f64,
    },

    /// No pending bet to cash out.
    #[error("no pending bet to cash out")]
    NoActiveBet,

    /// The crash was processed before this cash-out.
    #[error("too late: crashed at {crash_multiplier:.2}x")]
    TooLate {
        /// Crash point of the round.
        crash_multiplier: f64,
    },
}

/// Outcome of a successful cash-out.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CashOutReceipt {
    /// Locked multiplier.
    pub multiplier: f64,
    /// Stake x multiplier.
    pub payout: f64,
}

/// The authoritative round state machine.
pub struct RoundEngine {
    config: GameConfig,
    round: Round,
    ledger: LedgerHandle,
    /// Events produced since the last drain
    pending_events: Vec<Outbound>,
    #[cfg(test)]
    rigged_crash: Option<f64>,
}

impl RoundEngine {
    /// Create an engine with round 1 open for bets.
    pub fn new(config: GameConfig, ledger: LedgerHandle, now: Instant) -> Self {
        Self {
            config,
            round: Round::new(RoundId(1), now),
            ledger,
            pending_events: Vec::new(),
            #[cfg(test)]
            rigged_crash: None,
        }
    }

    /// Opening announcement for the first round.
    pub fn announce(&mut self) -> Vec<Outbound> {
        self.push_event(Outbound::broadcast(EngineEventData::PhaseChanged {
            round_id: self.round.id,
            phase: self.round.phase,
        }));
        self.take_events()
    }

    /// The active round.
    pub fn round(&self) -> &Round {
        &self.round
    }

    /// Current phase.
    pub fn phase(&self) -> RoundPhase {
        self.round.phase
    }

    /// Engine configuration.
    pub fn config(&self) -> &GameConfig {
        &self.config
    }

    /// Shared ledger handle.
    pub fn ledger(&self) -> &LedgerHandle {
        &self.ledger
    }

    /// Live multiplier, only while FLYING.
    pub fn current_multiplier(&self, now: Instant) -> Option<f64> {
        match (self.round.phase, self.round.flight_started_at) {
            (RoundPhase::Flying, Some(start)) => Some(
                self.config
                    .crash
                    .multiplier_at(now.saturating_duration_since(start)),
            ),
            _ => None,
        }
    }

    /// Process one queue entry and return what it produced.
    pub fn handle(&mut self, event: InboundEvent, now: Instant) -> Vec<Outbound> {
        match event {
            InboundEvent::Request { player_id, request } => match request {
                ClientRequest::Bet { amount } => match self.place_bet(player_id, amount) {
                    Ok(()) => self.push_event(Outbound::to(
                        player_id,
                        EngineEventData::BetAccepted {
                            round_id: self.round.id,
                            stake: amount,
                        },
                    )),
                    Err(error) => self.reject(player_id, error),
                },
                ClientRequest::CashOut => match self.cash_out(player_id, now) {
                    Ok(receipt) => self.push_event(Outbound::to(
                        player_id,
                        EngineEventData::CashedOut {
                            round_id: self.round.id,
                            multiplier: receipt.multiplier,
                            payout: receipt.payout,
                        },
                    )),
                    Err(EngineError::TooLate { crash_multiplier }) => self.push_event(Outbound::to(
                        player_id,
                        EngineEventData::TooLate {
                            round_id: self.round.id,
                            crash_multiplier,
                        },
                    )),
                    Err(error) => self.reject(player_id, error),
                },
            },
            InboundEvent::Tick => self.tick(now),
            InboundEvent::Disconnected { player_id } => self.player_disconnected(player_id),
        }

        self.take_events()
    }

    /// Record a stake for the current round.
    pub fn place_bet(&mut self, player_id: PlayerId, amount: f64) -> Result<(), EngineError> {
        if self.round.phase != RoundPhase::Betting {
            return Err(EngineError::WrongPhase {
                action: "bet",
                phase: self.round.phase,
            });
        }

        if !amount.is_finite() || amount <= 0.0 {
            return Err(EngineError::InvalidAmount { amount });
        }

        if self.round.bets.contains_key(&player_id) {
            return Err(EngineError::DuplicateBet {
                round_id: self.round.id,
            });
        }

        self.round
            .bets
            .insert(player_id, Bet::new(player_id, self.round.id, amount));
        debug!("{} bet {:.2} in round {}", player_id, amount, self.round.id);

        Ok(())
    }

    /// Cash out a pending bet at the multiplier current at `now`.
    pub fn cash_out(&mut self, player_id: PlayerId, now: Instant) -> Result<CashOutReceipt, EngineError> {
        match self.round.phase {
            RoundPhase::Flying => {}
            RoundPhase::Exploded
                if self
                    .round
                    .bet(&player_id)
                    .is_some_and(|bet| bet.status == BetStatus::Lost) =>
            {
                return Err(self.too_late());
            }
            phase => {
                return Err(EngineError::WrongPhase {
                    action: "cash-out",
                    phase,
                });
            }
        }

        if !self.round.bet(&player_id).is_some_and(Bet::is_pending) {
            return Err(EngineError::NoActiveBet);
        }

        let (Some(multiplier), Some(crash)) = (self.current_multiplier(now), self.round.crash_multiplier()) else {
            unreachable!("round {} is flying without a crash point", self.round.id);
        };

        if multiplier >= crash {
            // The curve got there before this request was dequeued.
            self.explode(now);
            return Err(self.too_late());
        }

        let locked = floor_cents(multiplier);
        let round_id = self.round.id;
        let Some(bet) = self.round.bet_mut(&player_id) else {
            return Err(EngineError::NoActiveBet);
        };
        bet.status = BetStatus::CashedOut;
        bet.cashout_multiplier = Some(locked);
        let payout = bet.payout();

        debug!(
            "{} cashed out at {:.2}x in round {} for {:.2}",
            player_id, locked, round_id, payout
        );

        Ok(CashOutReceipt {
            multiplier: locked,
            payout,
        })
    }

    /// Advance the clock: open the flight, check for the crash, or start the
    /// next round, depending on phase.
    pub fn tick(&mut self, now: Instant) {
        let in_phase = now.saturating_duration_since(self.round.phase_started_at);

        match self.round.phase {
            RoundPhase::Betting => {
                if in_phase >= self.config.bet_window {
                    self.start_flight(now);
                }
            }
            RoundPhase::Flying => {
                let Some(multiplier) = self.current_multiplier(now) else {
                    return;
                };
                let crash = self.round.crash_multiplier().unwrap_or(1.0);

                if multiplier >= crash {
                    self.explode(now);
                } else {
                    #[cfg(feature = "debug-tracing")]
                    debug!("Round {} at {:.4}x", self.round.id, multiplier);

                    self.push_event(Outbound::broadcast(EngineEventData::Update {
                        round_id: self.round.id,
                        multiplier: floor_cents(multiplier),
                    }));
                }
            }
            RoundPhase::Exploded => {
                if in_phase >= self.config.round_pause {
                    self.start_next_round(now);
                }
            }
        }
    }

    /// Mark a departed player's pending bet as forfeited.
    pub fn player_disconnected(&mut self, player_id: PlayerId) {
        let round_id = self.round.id;
        if let Some(bet) = self.round.bet_mut(&player_id) {
            if bet.is_pending() {
                bet.forfeited = true;
                warn!(
                    "{} disconnected with a pending bet of {:.2} in round {}; it will be forfeited",
                    player_id, bet.stake, round_id
                );
            }
        }
    }

    /// Drain produced events.
    pub fn take_events(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.pending_events)
    }

    fn push_event(&mut self, event: Outbound) {
        self.pending_events.push(event);
    }

    fn reject(&mut self, player_id: PlayerId, error: EngineError) {
        debug!("Rejected request from {}: {}", player_id, error);
        self.push_event(Outbound::to(player_id, EngineEventData::Rejected { error }));
    }

    fn too_late(&self) -> EngineError {
        EngineError::TooLate {
            crash_multiplier: self.round.revealed_crash().unwrap_or(1.0),
        }
    }

    /// BETTING -> FLYING: draw the crash point and start the clock.
    fn start_flight(&mut self, now: Instant) {
        let round_id = self.round.id;
        let mut rng = DeterministicRng::for_round(self.config.seed, round_id.0);
        let crash = self.config.crash.draw_crash(&mut rng);
        #[cfg(test)]
        let crash = self.rigged_crash.take().unwrap_or(crash);

        self.round.set_crash_multiplier(crash);
        self.round.flight_started_at = Some(now);
        self.round.transition(RoundPhase::Flying, now);

        let digest = round_seed_digest(self.config.seed, round_id.0);
        info!(
            "Round {} flying with {} bets (seed digest {})",
            round_id,
            self.round.bets.len(),
            hex::encode(&digest[..8])
        );

        self.push_event(Outbound::broadcast(EngineEventData::PhaseChanged {
            round_id,
            phase: RoundPhase::Flying,
        }));
    }

    /// FLYING -> EXPLODED: settle every bet, broadcast the result, archive.
    fn explode(&mut self, now: Instant) {
        let round_id = self.round.id;
        let crash = self.round.crash_multiplier().unwrap_or(1.0);
        self.round.transition(RoundPhase::Exploded, now);

        for bet in self.round.bets.values_mut() {
            match bet.status {
                BetStatus::Pending => {
                    bet.status = BetStatus::Lost;
                    if bet.forfeited {
                        warn!(
                            "Forfeited bet of {:.2} by departed {} settled lost in round {}",
                            bet.stake, bet.player_id, round_id
                        );
                    }
                }
                BetStatus::CashedOut => bet.status = BetStatus::Won,
                BetStatus::Won | BetStatus::Lost => {
                    unreachable!("bet settled before round {} exploded", round_id)
                }
            }
        }

        let bets: Vec<Bet> = self.round.bets.values().cloned().collect();
        let settled = SettledRound {
            round_id,
            crash_multiplier: crash,
            settled_at: Utc::now(),
            bets: bets.clone(),
        };
        info!(
            "Round {} exploded at {:.2}x: {} bets, wagered {:.2}, paid {:.2}",
            round_id,
            crash,
            bets.len(),
            settled.total_wagered(),
            settled.total_paid()
        );
        self.ledger.append(settled);

        self.push_event(Outbound::broadcast(EngineEventData::PhaseChanged {
            round_id,
            phase: RoundPhase::Exploded,
        }));
        self.push_event(Outbound::broadcast(EngineEventData::Settled {
            round_id,
            crash_multiplier: crash,
            bets,
        }));
    }

    /// EXPLODED -> BETTING on a fresh round.
    fn start_next_round(&mut self, now: Instant) {
        let round_id = self.round.id.next();
        self.round = Round::new(round_id, now);
        info!("Round {} open for bets", round_id);

        self.push_event(Outbound::broadcast(EngineEventData::PhaseChanged {
            round_id,
            phase: RoundPhase::Betting,
        }));
    }

    /// Force the crash point of the next flight.
    #[cfg(test)]
    pub(crate) fn rig_crash(&mut self, crash: f64) {
        self.rigged_crash = Some(crash);
    }
}
