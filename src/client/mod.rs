//! Consumer side of the session lifecycle, for tools and tests that talk to
//! a running server over HTTP.

pub mod agent;
pub mod events;
pub mod storage;

pub use self::agent::{AgentError, EndReason, SessionAgent, SessionObserver};
pub use self::storage::{CredentialStorage, FileStorage, MemoryStorage, StoredSession};
