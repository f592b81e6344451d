pub mod format;
pub mod retry;

pub use format::{format_bytes, format_duration, format_eta, format_speed};
pub use retry::{backoff, retry_with_strategy, RetryStrategy};
