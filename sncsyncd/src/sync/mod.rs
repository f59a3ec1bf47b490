pub mod conflict;
pub mod engine;
pub mod file_record;
pub mod hash;
pub mod local_watcher;
pub mod paths;
pub mod queue;
pub mod sidecar;
