//! Data persistence layer.

pub mod local;
pub mod traits;

pub use local::LocalStorage;
pub use traits::{Result, ScoreStorage, StorageError};
