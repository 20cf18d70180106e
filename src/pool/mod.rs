//! Download queue and file cache engine
//!
//! - `engine`: read path, explicit downloads, removal, invalidation
//! - `queue`: persistent priority queue with a Running/Paused loop
//! - `package`: package downloads and status rollback
//! - `http_client`, `fs`, `network`: adapters the engine runs on

pub mod engine;
pub mod events;
pub mod file_id;
pub mod fs;
pub mod http_client;
pub mod network;
pub mod package;
pub mod queue;
pub mod single_flight;
pub mod status;
pub mod transfer;

pub use engine::{FileOptions, Filepool};
pub use events::FilepoolEvent;
pub use package::{DownloadSize, PackageFile, PackageRequest};
pub use queue::{ProcessOutcome, QueueHandle, QueueState};
pub use status::{FileState, PackageStatus};
