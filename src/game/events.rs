//! Engine Events
//!
//! Everything that flows into the round engine through its queue, and
//! everything the engine emits for delivery.

use serde::{Deserialize, Serialize};

use crate::game::engine::EngineError;
use crate::game::state::{Bet, PlayerId, RoundId, RoundPhase};

/// A decoded player action.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum ClientRequest {
    /// Stake `amount` on the current round
    Bet {
        /// Requested stake
        amount: f64,
    },
    /// Take the current multiplier
    CashOut,
}

/// One entry of the engine's inbound queue.
#[derive(Clone, Debug, PartialEq)]
pub enum InboundEvent {
    /// Player action, stamped with the sender's identity by the transport
    Request {
        /// Sender
        player_id: PlayerId,
        /// Decoded action
        request: ClientRequest,
    },
    /// Periodic timer tick
    Tick,
    /// Session went away
    Disconnected {
        /// Departed player
        player_id: PlayerId,
    },
}

impl InboundEvent {
    /// Shorthand for a bet request.
    pub fn bet(player_id: PlayerId, amount: f64) -> Self {
        Self::Request {
            player_id,
            request: ClientRequest::Bet { amount },
        }
    }

    /// Shorthand for a cash-out request.
    pub fn cash_out(player_id: PlayerId) -> Self {
        Self::Request {
            player_id,
            request: ClientRequest::CashOut,
        }
    }
}

/// Who receives an outbound event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// Every connected session
    All,
    /// A single session
    To(PlayerId),
}

/// Event data emitted by the engine.
#[derive(Clone, Debug, PartialEq)]
pub enum EngineEventData {
    /// Current multiplier during FLYING
    Update {
        /// Current round
        round_id: RoundId,
        /// Multiplier floored to cents
        multiplier: f64,
    },

    /// Round entered a new phase
    PhaseChanged {
        /// Round entering the phase
        round_id: RoundId,
        /// New phase
        phase: RoundPhase,
    },

    /// Bet recorded
    BetAccepted {
        /// Round the bet belongs to
        round_id: RoundId,
        /// Recorded stake
        stake: f64,
    },

    /// Cash-out succeeded
    CashedOut {
        /// Current round
        round_id: RoundId,
        /// Locked multiplier
        multiplier: f64,
        /// Stake times multiplier
        payout: f64,
    },

    /// Cash-out arrived after the crash
    TooLate {
        /// Round that crashed
        round_id: RoundId,
        /// Where it crashed
        crash_multiplier: f64,
    },

    /// Request rejected
    Rejected {
        /// Why
        error: EngineError,
    },

    /// Round settled; every bet in terminal state
    Settled {
        /// Settled round
        round_id: RoundId,
        /// Revealed crash point
        crash_multiplier: f64,
        /// Every bet, in player order
        bets: Vec<Bet>,
    },
}

/// An engine event with its addressing.
#[derive(Clone, Debug, PartialEq)]
pub struct Outbound {
    /// Recipient(s)
    pub delivery: Delivery,
    /// Payload
    pub data: EngineEventData,
}

impl Outbound {
    /// Event for every session.
    pub fn broadcast(data: EngineEventData) -> Self {
        Self {
            delivery: Delivery::All,
            data,
        }
    }

    /// Event for one player.
    pub fn to(player_id: PlayerId, data: EngineEventData) -> Self {
        Self {
            delivery: Delivery::To(player_id),
            data,
        }
    }
}
