//! Gateway-facing side: wire protocol and the single long-lived session.

pub mod protocol;
pub mod session;

pub use session::{
    Rekey, SessionNotice, SessionState, SessionStatsSnapshot, UpstreamSession,
};
