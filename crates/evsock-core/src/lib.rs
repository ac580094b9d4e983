//! # evsock-core
//!
//! Platform-agnostic building blocks for the evsock reactor.
//!
//! ## Modules
//!
//! - `id` - process-unique socket identifiers
//! - `address` - IPv4 validity helpers and socket I/O mode
//! - `contract` - work contracts and contract groups (deferred work)
//! - `error` - error types shared across crates
//! - `env` - environment variable configuration helpers
//! - `logging` - tracing subscriber setup

pub mod address;
pub mod contract;
pub mod env;
pub mod error;
pub mod id;
pub mod logging;

pub use address::{is_valid_address, is_valid_ip, IoMode, IP_ANY, IP_NONE, PORT_ANY};
pub use contract::{Contract, ContractGroup};
pub use env::{env_first, env_flag, env_get, env_get_opt, env_get_string};
pub use error::{ConnectError, ContractError};
pub use id::SocketId;
