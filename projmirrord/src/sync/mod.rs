pub mod backoff;
pub mod engine;
#[cfg(test)]
pub(crate) mod fake_remote;
pub mod ignore;
pub mod local_watcher;
pub mod paths;
pub mod queue;
pub mod roots;
pub mod status;
pub mod tree;
