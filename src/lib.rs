pub mod cli;
pub mod config;
pub mod events;
pub mod fleet;
pub mod logging;
pub mod monitor;
pub mod process_manager;
pub mod render;
pub mod session_log;
pub mod summary;
pub mod tail;
pub mod teardown;
pub mod ui;

pub use config::MonitorConfig;
pub use events::{decode_line, Event, EventKind};
pub use fleet::{Fleet, Vm, VmSeed, VmStatus};
pub use monitor::{Monitor, MonitorState, SessionExit};
