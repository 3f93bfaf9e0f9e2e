//! veiltls - TLS-camouflage transport server with smart-failover egress
//!
//! Terminates TLS-obfuscated client sessions and forwards each accepted
//! stream to its destination through an ordered pool of egress candidates
//! (HTTP/HTTPS CONNECT proxies, SOCKS5 proxies, or the OS socket stack),
//! with in-line failover, mid-stream failure detection, background liveness
//! probing, and smart failback to the highest-priority candidate.
//!
//! # Architecture
//!
//! ```text
//! +-----------+     +-------------+     +----------------------+
//! |  server/  | --> |   egress/   | --> | destination via      |
//! | (TLS in,  |     | (pool, dial |     | http / socks5 /      |
//! | sessions) |     |  failover)  |     | direct               |
//! +-----+-----+     +------+------+     +----------------------+
//!       |                  |
//! +-----v-----+     +------v------+
//! |  padding/ |     |   probe     |
//! | (shaping) |     | (recovery)  |
//! +-----------+     +-------------+
//! ```

pub mod common;
pub mod config;
pub mod egress;
pub mod padding;
pub mod server;

pub use common::error::{DialError, Error, Result};
pub use config::Config;
pub use server::Server;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
