mod client;
mod record;

pub use client::{ClientOptions, DEFAULT_TIMEOUT, RecordClient, SncError};
pub use record::{Record, RecordList};
