//! Log file tailing for kubeship
//!
//! This crate provides the registry that keeps one session per log file, the
//! rotation-tolerant follower, container log line parsing, and the supervised
//! tail session that ties them to pod lookup and forwarding.

mod follower;
mod parser;
mod registry;
mod session;

pub use follower::{FollowConfig, FollowError, LogFollower};
pub use parser::{LogParser, ParseError};
pub use registry::{ManagedFile, ManagedFileRegistry};
pub use session::{
    SessionConfig, SessionContext, SessionError, StopReason, TailSession, spawn_session,
};

// Re-export types used in our public API
pub use kubeship_types::{LogFilePath, OptInPolicy, SessionState};
