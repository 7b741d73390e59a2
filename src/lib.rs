//! # Crash Game Server
//!
//! Authoritative server for a round-based crash wagering game.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      CRASH SERVER                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Pure primitives                           │
//! │  ├── rng.rs      - Xorshift128+ PRNG, per-round seeds        │
//! │  └── crash.rs    - Crash distribution and growth curve       │
//! │                                                              │
//! │  game/           - Round logic (single owner)                │
//! │  ├── state.rs    - Round, bet and id types                   │
//! │  ├── engine.rs   - BETTING -> FLYING -> EXPLODED machine     │
//! │  ├── events.rs   - Engine queue entries and outputs          │
//! │  └── ledger.rs   - Settled round history                     │
//! │                                                              │
//! │  network/        - Networking                                │
//! │  ├── server.rs   - WebSocket server and session tasks        │
//! │  ├── protocol.rs - JSON message types                        │
//! │  ├── registry.rs - Live session map                          │
//! │  └── dispatcher.rs - Non-blocking broadcast fan-out          │
//! │                                                              │
//! │  config.rs       - CRASH_* environment overrides             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Ordering Guarantee
//!
//! Ticks, bets, cash-outs and disconnects all pass through one bounded
//! queue drained by one engine task. Whatever is dequeued first wins:
//! a cash-out dequeued after the crash check loses, one dequeued before
//! it is paid at the multiplier observed at that moment.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod core;
pub mod game;
pub mod network;

// Re-export commonly used types
pub use crate::config::ConfigError;
pub use crate::core::{CrashModel, DeterministicRng};
pub use game::{BetStatus, GameConfig, LedgerHandle, PlayerId, RoundEngine, RoundId, RoundPhase};
pub use network::{GameServer, GameServerError, ServerConfig};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
