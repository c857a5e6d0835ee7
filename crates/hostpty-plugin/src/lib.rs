//! Device-plugin side of hostpty: advertises a fixed pool of PTY devices to
//! the node agent and hands each container that requests one a fresh host
//! shell behind its own session socket.

pub mod allocator;
pub mod options;
pub mod registration;
pub mod service;

pub use allocator::{
    AllocateError, AllocatorConfig, SessionAllocator, CONTAINER_PTS_DIR, CONTROL_TIMEOUT,
    RESOURCE_NAME, SOCK_FILE_ENV,
};
pub use options::Options;
pub use registration::{register, RegistrationError};
pub use service::PluginServer;
