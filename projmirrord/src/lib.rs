pub mod config;
pub mod daemon;
pub mod logging;
pub mod presenter;
pub mod protocol;
pub mod storage;
pub mod sync;
