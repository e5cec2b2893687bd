pub mod file_tailer;
pub mod parser;

pub use file_tailer::FileTailer;
pub use parser::{AttemptParser, FeedError};

// Async version
pub use file_tailer::AsyncFileTailer;
