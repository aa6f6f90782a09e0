//! AT command engine for atgsm.
//!
//! This crate turns a half-duplex, line-oriented modem stream into
//! request/response transactions while demultiplexing the notifications a
//! modem sends on its own. One tokio task owns the transport; a queue task
//! serializes the operations that drive it.
//!
//! # Architecture
//!
//! - [`framer`]: terminator-delimited line buffer
//! - [`matcher`]: decides when a command's reply is complete
//! - [`io`]: IO task types, spawn, and the select loop
//! - [`tokens`]: response parameter tokenizer
//! - [`processor`]: signature matching over notification lines, plus recovery
//! - [`queue`]: sequential, idle-gated operation queue

pub mod framer;
pub mod io;
pub mod matcher;
pub mod processor;
pub mod queue;
pub mod tokens;

pub use framer::LineBuffer;
pub use io::{AtIo, BatchResponses, Command, EngineState, IoConfig, Response, spawn_io_task};
pub use matcher::{Markers, Outcome, Transaction};
pub use processor::{Decoder, Match, Processor, ProcessorResult, Recovery, Signature};
pub use queue::{OperationQueue, Step, sequence};
pub use tokens::{Token, tokenize};
