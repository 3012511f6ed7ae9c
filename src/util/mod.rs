pub mod backoff;
pub mod duration_millis;

pub use backoff::{BackoffSettings, ExponentialBackoff};
