//! Framed wire protocol for the stagehand transfer engine
//!
//! This crate owns everything that touches raw protocol bytes:
//!
//! - **Commands**: the frozen numeric command and sub-command codes
//! - **Records**: the schema-checked attribute payloads of structured
//!   exchanges
//! - **Channels**: the byte-duplex abstraction (with an in-process pair
//!   for tests)
//! - **Framing**: command headers, file payloads, xfer-info, go-ahead,
//!   and ack encoding
//!
//! The uploader and downloader state machines live in `stagehand-engine`
//! and drive this crate exclusively through [`Framer`] and tagged command
//! variants; no magic numbers escape this crate.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod command;
pub mod framer;
pub mod record;

pub use channel::{MemoryChannel, WireChannel};
pub use command::{TransferCommand, TransferSubCommand};
pub use framer::{Framer, GoAhead, GoAheadInfo, TransferAck};
pub use record::{AttrRecord, RecordValue};
