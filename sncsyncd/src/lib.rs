pub mod config;
pub mod daemon;
pub mod logging;
pub mod notifier;
pub mod selftest;
pub mod sync;
