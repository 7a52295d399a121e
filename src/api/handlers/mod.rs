pub mod admin;
pub mod auth;
pub mod health;
pub mod principal;
pub mod recovery;
pub mod session_events;
pub mod types;

pub use self::health::health;
