//! Delivery policies

pub mod block;
pub mod retry;

pub use block::BlockPolicy;
pub use retry::RetryPolicy;
