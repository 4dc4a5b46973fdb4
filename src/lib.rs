//! nzb-fetch - resumable NZB downloader library
//!
//! Downloads the files described by NZB documents over a pool of NNTP
//! sessions, decodes their yEnc articles and reassembles them on disk so that
//! an interrupted download resumes where it stopped. Finished downloads can be
//! verified, repaired and extracted with external PAR2 and archive tools.
//!
//! # Features
//!
//! - Async/await support via Tokio
//! - Connection pooling with FIFO hand-off
//! - yEnc decoding
//! - Cooperative cancellation of groups and sessions
//! - Queueing of large NZBs, small ones first
//! - Progress snapshots for any presentation layer
//!
//! # Example
//!
//! ```no_run
//! use nzb_fetch::{config::Config, Referential};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load()?;
//!     let referential = Referential::from_config(&config)?;
//!     referential.add_file("show.nzb".as_ref())?;
//!     referential.wait_idle().await;
//!     referential.shutdown().await;
//!     Ok(())
//! }
//! ```

// Core modules
pub mod cancel;
pub mod cli;
pub mod config;
pub mod disk;
pub mod error;
pub mod progress;
pub mod yenc;

// Feature modules organized by functionality
pub mod download;
pub mod nntp;
pub mod processing;
pub mod referential;
pub mod scheduler;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use cancel::{CancellationSource, CancellationToken};
pub use config::Config;
pub use download::{Group, Nzb};
pub use error::{Error, Result};
pub use nntp::ConnectionPool;
pub use referential::Referential;
pub use scheduler::Scheduler;
