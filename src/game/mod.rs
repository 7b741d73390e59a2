//! Game Logic Module
//!
//! Round state and its single authoritative mutator.
//!
//! ## Module Structure
//!
//! - `state`: Round, bet, and identifier types
//! - `engine`: Round state machine (phases, crash, bet and cash-out resolution)
//! - `events`: Engine inbound queue entries and outbound events
//! - `ledger`: Append-only history of settled rounds

pub mod engine;
pub mod events;
pub mod ledger;
pub mod state;

// Re-export key types
pub use engine::{CashOutReceipt, EngineError, GameConfig, RoundEngine};
pub use events::{ClientRequest, Delivery, EngineEventData, InboundEvent, Outbound};
pub use ledger::{BetLedger, LedgerHandle, LedgerStats, SettledRound};
pub use state::{Bet, BetStatus, PlayerId, Round, RoundId, RoundPhase};
