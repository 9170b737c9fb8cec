//! Transport codec for the supervisor link.
//!
//! The supervisory node drives skald over a single byte stream of
//! length-prefixed JSON frames. This crate owns both directions:
//!
//! - [`frame`]: the length-prefixed framing (u32 big-endian prefix)
//! - [`message`]: the typed records inside a frame
//!
//! A request frame mirrors the supervisor's tuple shape: a sender
//! reference plus a payload list whose head is the enqueue timestamp
//! (milliseconds since the Unix epoch) followed by the command name
//! and its arguments. Replies are one of three shapes: a single value,
//! a property list, or a priority echo.
//!
//! The codec is deliberately dumb: it validates structure, not
//! command semantics. Arity and type checks for individual commands
//! live in the dispatcher.

pub mod error;
pub mod frame;
pub mod message;

pub use error::ProtoError;
pub use frame::{read_frame, write_frame};
pub use message::{Arg, Hello, Reply, ReplyEnvelope, Request};
