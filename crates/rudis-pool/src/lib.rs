//! # rudis-pool
//!
//! Connection pooling for the rudis Redis client.
//!
//! The pool reconciles three pressures at once: bounded concurrency (never
//! more than `pool_size` pooled connections in flight), fair admission of
//! waiters under contention, and correct lifecycle handling under partial
//! failure (dial storms, broken sockets, idle expiry) — while staying safe
//! for any number of concurrent callers.
//!
//! ## Features
//!
//! - **Bounded admission**: a semaphore gate with a configurable wait
//!   timeout; caller deadlines compose via [`tokio::time::timeout`]
//! - **Idle reuse**: LIFO (default) or FIFO ordering over idle connections
//! - **Health checking**: lifetime and idle-age expiry plus a non-blocking
//!   socket probe that catches half-open TCP connections
//! - **Dial circuit**: consecutive dial failures short-circuit further
//!   dials until a background probe confirms the backend recovered
//! - **Maintenance**: min-idle replenishment and a periodic reaper that
//!   retires stale idle connections
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use rudis_pool::prelude::*;
//!
//! let config = PoolConfig::new(Arc::new(TcpDialer::new("127.0.0.1:6379")))
//!     .with_pool_size(16)
//!     .with_min_idle_conns(4);
//! let pool = ConnPool::new(config);
//!
//! let cn = pool.get().await?;
//! cn.write_all(b"PING\r\n").await?;
//! pool.put(cn).await;
//!
//! pool.close().await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod conn;
pub mod error;
pub mod pool;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::conn::{Conn, Dialer, TcpDialer};
    pub use crate::error::{Error, Result};
    pub use crate::pool::{ConnPool, PoolConfig, Pooler, Stats};
}

// Re-export commonly used items at crate root
pub use conn::{Conn, Dialer, TcpDialer};
pub use error::{Error, Result};
pub use pool::{ConnPool, PoolConfig, Pooler, Stats};
