//! Event-stream wire handling.
//!
//! The planner feed is a line-oriented, SSE-style protocol carried over a
//! persistent HTTP response body:
//! - `id: <cursor>` - resumption cursor line
//! - `event: <name>` - event name line
//! - `data: <payload>` - data payload line(s), joined with `\n`
//! - Empty line - signals end of frame
//! - Lines starting with `:` - comments (ignored)
//!
//! # Module structure
//! - `frames` - byte-chunk buffering and frame extraction (`FrameParser`)
//! - `normalize` - frame payload validation into `StreamEvent`s

mod frames;
mod normalize;

pub use frames::{FrameParser, RawFrame};
pub use normalize::{normalize_frame, StreamMessage};
