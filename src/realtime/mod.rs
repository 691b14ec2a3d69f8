//! Pull sessions over WebSocket, plus the capture and health endpoints
//!
//! Each connected client gets its own [`PullSession`], which reads the
//! backend log from a fixed start and pushes one JSON frame per entry.

mod protocol;
mod server;
mod session;

pub use protocol::{PullMessage, PullRequest};
pub use server::{AppState, RelayServer, SessionId, SessionInfo, SessionRegistry};
pub use session::{PullSession, SessionEnd};
