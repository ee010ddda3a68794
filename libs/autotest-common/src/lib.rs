pub mod config;
pub mod error;
pub mod images;
pub mod types;

pub use config::RunSettings;
pub use error::ConfigError;
pub use images::ImageTable;
pub use types::{CaseDescriptor, TestMatrix};
