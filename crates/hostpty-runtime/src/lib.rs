//! Process plumbing shared by the hostpty binaries: cooperative shutdown,
//! worker groups, bounded unix-socket dials, listener handoff across
//! upgrades, file watching, logging setup and version reporting.

pub mod logging;
pub mod net;
pub mod shutdown;
pub mod upgrade;
pub mod version;
pub mod watch;
pub mod worker;

pub use net::{dial_unix, prepare_unix_socket, DialError};
pub use shutdown::{force_exit_after, Shutdown};
pub use upgrade::{
    init_graceful_upgrade, HandoffRegistry, ListenerRegistry, StaticRegistry, UpgradeError,
};
pub use worker::{Continue, WorkerGroup, WorkerHandle};
