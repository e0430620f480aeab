//! Protocol module for reassembling and parsing telemetry messages.
//!
//! This module contains the implementations for:
//! - message classification and field parsing
//! - fragment reassembly

pub mod frame;
pub mod message;

pub use frame::FrameAssembler;
pub use message::{parse, ParseOutcome, ProtocolMessage};
