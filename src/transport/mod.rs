//! 传输层实现

mod http;
mod progress_stream;

pub use http::HttpTransport;
pub use progress_stream::ProgressStream;
