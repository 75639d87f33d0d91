//! # Crate to update the firmware of a flight-controller over its serial bootloader
//!
//! This crate talks to the bootloader of a flight-controller over a byte-oriented
//! serial link and reprograms the application area of its flash.
//!
//! # Protocol stack
//!
//! - [`cobsr`]: COBS/R framing, so that `0x00` only ever appears as a frame
//!   terminator and a receiver can resynchronise on it.
//! - [`checksum`]: a CRC-16 on every message, and the CRC-32 used to verify the
//!   written image.
//! - [`packets`]: message layout, boot requests and responses.
//! - [`MsgLink`]: sends messages over any byte stream or serial port and queues
//!   the valid incoming ones, in arrival order.
//! - [`bootloader`]: one request/response exchange per operation.
//! - [`FirmwareUpdater`]: the complete update.
//!
//! # Update sequence
//!
//! The updater enters the bootloader, erases the application sectors, writes the
//! image except for its first 8 bytes, has the device checksum what was written,
//! and only then writes the first 8 bytes. Those bytes are the entry vector the
//! device reads at boot: until they are written, a power loss leaves the device
//! booting its previous image. Writes are pipelined with up to 10 requests in
//! flight to hide the link latency.
//!
//! Responses carry no sequence number; they are matched to requests by type and
//! order only.
//!
//! See `src/main.rs` for a command line tool built on this crate.

#![deny(missing_docs)]

pub mod bootloader;
pub mod checksum;
pub mod cobsr;
pub mod config;
mod error;
mod image;
mod msglink;
pub mod packets;
mod progress;
mod updater;

#[cfg(test)]
mod testutil;

pub use bootloader::Bootloader;
pub use config::BootConfig;
pub use error::BootError;
pub use image::{FirmwareImage, Section};
pub use msglink::{MsgLink, Transport};
pub use progress::{NoProgress, ProgressSink};
pub use updater::{FirmwareUpdater, UpdateOutcome, UpdateReport};
