//! A single-process HTTP/1.1 file and login server built directly on epoll.
//!
//! One event-loop thread owns the listening socket, a fixed-capacity
//! connection table and an expiration-ordered timer list; a fixed pool of
//! worker threads runs the per-connection protocol work behind a bounded
//! task queue. Connection sockets are one-shot registrations, re-armed only
//! after the worker handling the event has finished, and idle connections
//! are evicted on a periodic alarm tick.

pub mod config;
pub mod conn;
pub mod error;
pub mod http;
pub mod logging;
pub mod pool;
pub mod server;
pub mod store;
pub mod syscalls;
pub mod table;
pub mod timer;

pub use config::{Discipline, ServerConfig};
pub use error::{ServerError, ServerResult};
pub use server::Server;
pub use store::CredentialStore;
