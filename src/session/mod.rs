//! Analysis sessions: one container plus an input and output directory per session.

pub mod model;
pub mod registry;

pub use model::{Owner, Session, SessionPaths, SessionStatus};
pub use registry::{SessionRegistry, SessionReport};
