pub mod blob;
pub mod fetch;
pub mod message;
pub mod metrics;
pub mod queue;
pub mod sqs;
