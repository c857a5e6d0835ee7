pub mod client;
pub mod pty;
pub mod server;

pub use client::{AttachReceiver, AttachSender, ClientError, TerminalClient};
pub use pty::{ProcessState, PtyError, PtyReader, TerminalProcess};
pub use server::{StreamError, TerminalStreamServer};
