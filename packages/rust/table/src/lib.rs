//! Delimited-table I/O for PartGen.
//!
//! - [`read_table`] decodes a file (UTF-8, Latin-1, or lossy UTF-8), strips a
//!   leading BOM, drops placeholder columns and yields string-typed [`Row`]s.
//! - [`OutputSink`] writes the processed table one record at a time so that
//!   partial progress survives an interrupted run.
//!
//! [`Row`]: partgen_shared::Row

mod reader;
mod sink;

pub use reader::{Table, TextEncoding, decode, parse_table, read_table};
pub use sink::{OutputSink, default_output_path};
