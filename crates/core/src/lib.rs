pub mod config;
pub mod error;
pub mod record;
pub mod signal;
pub mod store;

pub use config::Config;
pub use error::*;
pub use record::*;
pub use signal::*;
pub use store::{MemoryRecordStore, RawRecordStore, RecordQuery};
