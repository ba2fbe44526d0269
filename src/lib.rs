//! Local mirror of a remote work item tracker.
//!
//! A resilient REST client (`remote`) feeds a sync engine (`sync`) that
//! keeps a SQLite mirror (`cache`) current; automated callers read the
//! mirror through the tool dispatcher (`dispatch`).

pub mod cache;
pub mod config;
pub mod dispatch;
pub mod logging;
pub mod remote;
pub mod sync;
