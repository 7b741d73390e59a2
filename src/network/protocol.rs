//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket.
//! Every message is one text frame carrying a self-describing JSON object,
//! so framing is delegated to the WebSocket layer.

use serde::{Deserialize, Serialize};

use crate::game::engine::EngineError;
use crate::game::events::{ClientRequest, EngineEventData};
use crate::game::state::{Bet, BetStatus, PlayerId, RoundId, RoundPhase};

/// Longest human-readable `text` carried by a server message.
pub const MAX_TEXT_LEN: usize = 255;

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Stake an amount on the current round.
    #[serde(alias = "BET")]
    Bet {
        /// Stake.
        amount: f64,
    },

    /// Take the current multiplier. Any `amount` field is ignored.
    #[serde(alias = "CASHOUT", alias = "cash_out")]
    Cashout,
}

impl ClientMessage {
    /// Convert to the engine request.
    pub fn to_request(self) -> ClientRequest {
        match self {
            Self::Bet { amount } => ClientRequest::Bet { amount },
            Self::Cashout => ClientRequest::CashOut,
        }
    }
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// Current multiplier during FLYING.
    Update {
        /// Multiplier as text.
        text: String,
        /// Current multiplier.
        value: f64,
        /// Current round.
        round_id: RoundId,
    },

    /// A payout figure: crash point on settlement, payout for one player.
    Result {
        /// Human-readable summary.
        text: String,
        /// Crash multiplier (broadcast) or payout (addressed).
        value: f64,
        /// Round the figure belongs to.
        round_id: RoundId,
        /// Every bettor's outcome, on settlement only.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        outcomes: Option<Vec<BetOutcome>>,
    },

    /// Status notice: phase transitions, acknowledgements, welcome.
    Info {
        /// Human-readable notice.
        text: String,
        /// Round concerned, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        round_id: Option<RoundId>,
        /// Phase concerned, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        phase: Option<RoundPhase>,
        /// Recipient's id, on welcome only.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        player_id: Option<PlayerId>,
    },

    /// Request refused.
    Error {
        /// Human-readable reason.
        text: String,
        /// Machine-readable reason.
        code: ErrorCode,
    },
}

/// One bettor's line in a settlement RESULT.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BetOutcome {
    /// Player identifier.
    pub player_id: PlayerId,
    /// Stake.
    pub stake: f64,
    /// Terminal status.
    pub status: BetStatus,
    /// Locked multiplier, if cashed out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cashout_multiplier: Option<f64>,
    /// Amount paid.
    pub payout: f64,
}

impl From<&Bet> for BetOutcome {
    fn from(bet: &Bet) -> Self {
        Self {
            player_id: bet.player_id,
            stake: bet.stake,
            status: bet.status,
            cashout_multiplier: bet.cashout_multiplier,
            payout: bet.payout(),
        }
    }
}

/// Error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Frame could not be decoded.
    InvalidRequest,
    /// Action not allowed in the current phase.
    WrongPhase,
    /// Already bet this round.
    DuplicateBet,
    /// Stake not positive.
    InvalidAmount,
    /// Nothing to cash out.
    NoActiveBet,
    /// Crash processed first.
    TooLate,
    /// Engine queue full; try again.
    Busy,
    /// Server at session capacity.
    CapacityExceeded,
}

impl From<&EngineError> for ErrorCode {
    fn from(error: &EngineError) -> Self {
        match error {
            EngineError::WrongPhase { .. } => Self::WrongPhase,
            EngineError::DuplicateBet { .. } => Self::DuplicateBet,
            EngineError::InvalidAmount { .. } => Self::InvalidAmount,
            EngineError::NoActiveBet => Self::NoActiveBet,
            EngineError::TooLate { .. } => Self::TooLate,
        }
    }
}

/// Clamp a status text to [`MAX_TEXT_LEN`] bytes on a char boundary.
fn status_text(text: String) -> String {
    if text.len() <= MAX_TEXT_LEN {
        return text;
    }
    let mut end = MAX_TEXT_LEN;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

impl ServerMessage {
    /// Error message with a code.
    pub fn error(code: ErrorCode, text: impl Into<String>) -> Self {
        Self::Error {
            text: status_text(text.into()),
            code,
        }
    }

    /// Plain status notice.
    pub fn info(text: impl Into<String>) -> Self {
        Self::Info {
            text: status_text(text.into()),
            round_id: None,
            phase: None,
            player_id: None,
        }
    }

    /// Greeting sent on registration.
    pub fn welcome(player_id: PlayerId) -> Self {
        Self::Info {
            text: status_text(format!("Welcome, you are {}", player_id)),
            round_id: None,
            phase: None,
            player_id: Some(player_id),
        }
    }

    /// Render an engine event for the wire.
    pub fn from_engine_event(event: &EngineEventData) -> Self {
        match event {
            EngineEventData::Update { round_id, multiplier } => Self::Update {
                text: format!("{:.2}x", multiplier),
                value: *multiplier,
                round_id: *round_id,
            },
            EngineEventData::PhaseChanged { round_id, phase } => {
                let text = match phase {
                    RoundPhase::Betting => format!("Round {}: bets are open", round_id),
                    RoundPhase::Flying => format!("Round {}: bets closed, flying", round_id),
                    RoundPhase::Exploded => format!("Round {}: exploded", round_id),
                };
                Self::Info {
                    text: status_text(text),
                    round_id: Some(*round_id),
                    phase: Some(*phase),
                    player_id: None,
                }
            }
            EngineEventData::BetAccepted { round_id, stake } => Self::Info {
                text: status_text(format!("Bet of {:.2} accepted for round {}", stake, round_id)),
                round_id: Some(*round_id),
                phase: Some(RoundPhase::Betting),
                player_id: None,
            },
            EngineEventData::CashedOut {
                round_id,
                multiplier,
                payout,
            } => Self::Result {
                text: status_text(format!("Cashed out at {:.2}x: payout {:.2}", multiplier, payout)),
                value: *payout,
                round_id: *round_id,
                outcomes: None,
            },
            EngineEventData::TooLate {
                round_id,
                crash_multiplier,
            } => Self::Result {
                text: status_text(format!(
                    "Too late: round {} crashed at {:.2}x",
                    round_id, crash_multiplier
                )),
                value: 0.0,
                round_id: *round_id,
                outcomes: None,
            },
            EngineEventData::Rejected { error } => Self::error(ErrorCode::from(error), error.to_string()),
            EngineEventData::Settled {
                round_id,
                crash_multiplier,
                bets,
            } => Self::Result {
                text: status_text(format!("Round {} crashed at {:.2}x", round_id, crash_multiplier)),
                value: *crash_multiplier,
                round_id: *round_id,
                outcomes: Some(bets.iter().map(BetOutcome::from).collect()),
            },
        }
    }
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl ClientMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl ServerMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_parsing() {
        assert_eq!(
            ClientMessage::from_json(r#"{"type":"bet","amount":12.5}"#).unwrap(),
            ClientMessage::Bet { amount: 12.5 }
        );
        assert_eq!(
            ClientMessage::from_json(r#"{"type":"BET","amount":3}"#).unwrap(),
            ClientMessage::Bet { amount: 3.0 }
        );
        // Amount is ignored for cash-outs
        assert_eq!(
            ClientMessage::from_json(r#"{"type":"cashout","amount":99}"#).unwrap(),
            ClientMessage::Cashout
        );
        assert_eq!(
            ClientMessage::from_json(r#"{"type":"CASHOUT"}"#).unwrap(),
            ClientMessage::Cashout
        );
    }

    #[test]
    fn test_malformed_client_messages() {
        assert!(ClientMessage::from_json("not json").is_err());
        assert!(ClientMessage::from_json(r#"{"type":"bet"}"#).is_err());
        assert!(ClientMessage::from_json(r#"{"type":"double_down"}"#).is_err());
        assert!(ClientMessage::from_json(r#"{"amount":5}"#).is_err());
    }

    #[test]
    fn test_to_request() {
        assert_eq!(
            ClientMessage::Bet { amount: 4.0 }.to_request(),
            ClientRequest::Bet { amount: 4.0 }
        );
        assert_eq!(ClientMessage::Cashout.to_request(), ClientRequest::CashOut);
    }

    #[test]
    fn test_update_wire_shape() {
        let msg = ServerMessage::from_engine_event(&EngineEventData::Update {
            round_id: RoundId(4),
            multiplier: 1.57,
        });
        let json: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "update");
        assert_eq!(json["value"], 1.57);
        assert_eq!(json["round_id"], 4);
        assert_eq!(json["text"], "1.57x");
    }

    #[test]
    fn test_settlement_result_lists_outcomes() {
        let mut won = Bet::new(PlayerId::new(1), RoundId(2), 10.0);
        won.status = BetStatus::Won;
        won.cashout_multiplier = Some(1.8);
        let mut lost = Bet::new(PlayerId::new(2), RoundId(2), 20.0);
        lost.status = BetStatus::Lost;

        let msg = ServerMessage::from_engine_event(&EngineEventData::Settled {
            round_id: RoundId(2),
            crash_multiplier: 2.5,
            bets: vec![won, lost],
        });

        let parsed = ServerMessage::from_json(&msg.to_json().unwrap()).unwrap();
        match parsed {
            ServerMessage::Result { value, outcomes: Some(outcomes), .. } => {
                assert_eq!(value, 2.5);
                assert_eq!(outcomes.len(), 2);
                assert!((outcomes[0].payout - 18.0).abs() < 1e-9);
                assert_eq!(outcomes[1].status, BetStatus::Lost);
                assert_eq!(outcomes[1].payout, 0.0);
            }
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_too_late_is_a_losing_result() {
        let msg = ServerMessage::from_engine_event(&EngineEventData::TooLate {
            round_id: RoundId(1),
            crash_multiplier: 2.5,
        });
        match msg {
            ServerMessage::Result { value, text, .. } => {
                assert_eq!(value, 0.0);
                assert!(text.contains("2.50x"));
            }
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_error_codes() {
        let msg = ServerMessage::from_engine_event(&EngineEventData::Rejected {
            error: EngineError::DuplicateBet { round_id: RoundId(3) },
        });
        let json = msg.to_json().unwrap();
        assert!(json.contains("duplicate_bet"));
        assert!(json.contains("\"type\":\"error\""));

        let busy = ServerMessage::error(ErrorCode::Busy, "try again").to_json().unwrap();
        assert!(busy.contains("busy"));
    }

    #[test]
    fn test_text_is_capped() {
        let long = "é".repeat(300);
        match ServerMessage::info(long) {
            ServerMessage::Info { text, .. } => {
                assert!(text.len() <= MAX_TEXT_LEN);
                assert!(text.chars().all(|c| c == 'é'));
            }
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_welcome_carries_player_id() {
        let json = ServerMessage::welcome(PlayerId::new(9)).to_json().unwrap();
        assert!(json.contains("\"player_id\":9"));
    }
}
