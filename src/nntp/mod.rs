//! NNTP protocol implementation and connection pooling
//!
//! This module provides the async NNTP session used to fetch article bodies and
//! the bounded pool that shares sessions between concurrent downloads.

mod connection;
mod pool;

pub use connection::{bracket_message_id, tls_connector, NntpConnection, NntpSession};
pub use pool::{ConnectionPool, PooledConnection, SessionFactory};
