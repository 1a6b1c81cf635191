//! presence-store — SQLite persistence for the attendance core.
//!
//! Enrolled descriptors (the embedding store), sessions, attendance records
//! with the one-record-per-(session, identity) invariant, and unverified
//! learning samples captured on successful recognition.

mod error;
mod migrations;
mod recorder;
mod store;

pub use error::{RecordError, StoreError};
pub use recorder::{RecordRequest, StatusRule};
pub use store::Store;
