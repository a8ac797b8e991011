//! A parallel, consistent, chunked logical dumper: extracts relational
//! database contents into a directory of files suitable for bulk reload.

pub mod config;
pub mod dump;
pub mod error;
pub mod session;
pub mod tools;

pub use config::DumpOptions;
pub use dump::{run, DumpSummary};
pub use error::{DumpError, Result};
