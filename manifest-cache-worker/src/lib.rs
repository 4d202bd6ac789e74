pub mod config;
pub mod error;
pub mod metrics_consts;
pub mod poller;
pub mod reconciler;
pub mod rewriter;
pub mod worker;
