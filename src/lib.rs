pub mod app;
pub mod cli;
pub mod error;
pub mod file;
pub mod pool;
pub mod store;
pub mod util;

pub use app::config::Config;
pub use error::{FilepoolError, Result};
pub use pool::Filepool;
