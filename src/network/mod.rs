//! Network Layer
//!
//! WebSocket server, wire protocol, session registry and broadcast fan-out.
//! Game state is never touched here; every player action is queued to the
//! round engine in `game/`.

pub mod dispatcher;
pub mod protocol;
pub mod registry;
pub mod server;

pub use dispatcher::BroadcastDispatcher;
pub use protocol::{BetOutcome, ClientMessage, ErrorCode, ServerMessage};
pub use registry::{RegistryError, SessionHandle, SessionRegistry};
pub use server::{GameServer, GameServerError, ServerConfig};
