//! Download orchestration and NZB file handling
//!
//! A [`Group`] is one NZB: its [`FileEntry`]s download [`Segment`]s over the
//! shared connection pool, then the group repairs and extracts the result.

mod file_entry;
mod group;
mod nzb;
mod segment;

pub use file_entry::{temp_path, FileEntry};
pub use group::{split_entries, Group};
pub use nzb::{filename_from_subject, is_nzb, is_par2, Nzb, NzbFile, NzbSegment};
pub use segment::{Segment, DEFAULT_ATTEMPTS, RETRY_DELAY};
