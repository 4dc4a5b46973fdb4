//! Post-processing of finished downloads
//!
//! PAR2 verification/repair and archive extraction are delegated to external
//! binaries chosen per platform.

mod tools;

pub use tools::{is_archive, ExternalTools, NoopTools, ProcessTools, ToolStrategy};
