//! Retry: bounded attempts with exponential backoff + jitter.

mod engine;
mod policy;

pub use engine::{RetryEngine, RetryState};
pub use policy::RetryPolicy;
