//! hostpty-proto: wire messages shared by the host PTY service and its clients.
//!
//! Every connection carries newline-delimited JSON frames. The first frame a
//! client writes names the call (`{"method": ...}`); what follows depends on
//! the call.
//!
//! - [`terminal`]: the per-session Attach / Resize / Ping protocol.
//! - [`deviceplugin`]: the orchestrator-facing device-plugin and registration messages.
//! - [`codec`]: [`FrameReader`] / [`FrameWriter`] over any tokio byte stream.

pub mod codec;
pub mod deviceplugin;
pub mod terminal;

pub use codec::{FrameReader, FrameWriter, ProtoError, MAX_FRAME_LEN};
pub use terminal::{InputFrame, OutputFrame, Pong, ResizeReply, Size, TerminalRequest};
