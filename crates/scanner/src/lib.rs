//! Library scanning: folder walking, incremental diffing, tag mapping and scan control.

pub mod config;
pub mod context;
pub mod controller;
pub mod entities;
pub mod error;
pub mod events;
pub mod external;
pub mod folder;
pub mod mapping;
pub mod pipeline;
pub mod process_folders;
pub mod protocol;
pub mod store;

pub use config::{MappingOptions, ScannerConfig};
pub use context::RequestContext;
pub use controller::{ScanStrategy, Scanner};
pub use error::ScanError;
pub use events::{Broker, EventBroker, ScanStatus, ServerEvent};
pub use external::{ExternalScanner, FULL_RESCAN_FLAG, SUBPROCESS_FLAG};
pub use pipeline::LocalScanner;
pub use protocol::{read_record, write_record, ProgressRecord, ProtocolError, PROTOCOL_VERSION};
pub use store::DataStore;

/// The library status queries report on.
pub const DEFAULT_LIBRARY_ID: u32 = 1;

/// Capacity of the queue between a running scan and the controller.
pub const PROGRESS_QUEUE_SIZE: usize = 100;
