//! Wakegate - wakes cold backends on demand and holds clients until they answer
//!
//! This library coordinates the wake-up of backends that are stopped while idle:
//! - Sends an out-of-band wake signal to a backend's control endpoint
//! - Deduplicates wake signals per backend within a cooldown window
//! - Polls each waiting client's target backend until it is reachable
//! - Routes the client once the backend answers and reports progress meanwhile
//! - Parks connecting clients on a fallback backend while their target starts
//! - Exposes an admin API the proxy reports client sessions to

pub mod ack;
pub mod admin;
pub mod backend;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod poll;
pub mod probe;
pub mod registry;
pub mod router;
pub mod session;
pub mod throttle;
pub mod wake;
