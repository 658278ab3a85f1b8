//! Core type system and error handling for stagehand
//!
//! This crate provides the foundational types shared by the stagehand
//! transfer engine:
//!
//! - **Error handling**: a structured error taxonomy with retry/hold
//!   classification and the flattened [`FailureInfo`] carried in acks
//! - **Job records**: the typed attribute view of a job driving a session
//! - **Transfer items**: planned moves with the engine's total ordering
//! - **Summaries**: progress events and the final session summary
//!
//! # Examples
//!
//! ```rust
//! use stagehand_types::{JobRecord, TransferItem};
//!
//! let job = JobRecord::new(17, 0, "alice", "/home/alice/job");
//! assert_eq!(job.job_id(), "17.0");
//!
//! let mut plan = vec![TransferItem::local("b.txt"), TransferItem::local("a.txt")];
//! plan.sort();
//! assert_eq!(plan[0].src_name, "a.txt");
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod job;
pub mod result;
pub mod types;

pub use error::{Error, FailureInfo, HoldCode};
pub use job::{AttrValue, JobRecord};
pub use result::Result;
pub use types::*;
