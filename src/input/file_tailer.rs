use super::parser::{AttemptParser, FeedError};
use crate::models::LoginRequest;
use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::PathBuf;

/// Read login attempts from a feed file
pub struct FileTailer {
    file_path: PathBuf,
    reader: Option<BufReader<File>>,
    parser: AttemptParser,
    from_start: bool,
}

impl FileTailer {
    /// Create a new file tailer
    ///
    /// With `from_start` the whole file is read; otherwise only lines
    /// appended after `initialize`.
    pub fn new(file_path: PathBuf, from_start: bool) -> Result<Self, FeedError> {
        Ok(FileTailer {
            file_path,
            reader: None,
            parser: AttemptParser::new()?,
            from_start,
        })
    }

    /// Initialize the file reader
    pub fn initialize(&mut self) -> Result<(), FeedError> {
        let file = File::open(&self.file_path)?;
        let mut reader = BufReader::new(file);
        if !self.from_start {
            reader.seek(SeekFrom::End(0))?;
        }
        self.reader = Some(reader);
        Ok(())
    }

    /// Read every complete attempt available
    ///
    /// Lines that fail to parse are logged and skipped.
    pub fn read_requests(&mut self) -> Result<Vec<LoginRequest>, FeedError> {
        if self.reader.is_none() {
            self.initialize()?;
        }
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| FeedError::Malformed("reader not initialized".to_string()))?;

        let mut requests = Vec::new();
        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line)? == 0 {
                break; // EOF
            }
            match self.parser.parse_line(&line) {
                Ok(Some(request)) => requests.push(request),
                Ok(None) => {}
                Err(e) => log::warn!("Skipping attempt line: {}", e),
            }
        }
        Ok(requests)
    }
}

// ============================================
// Async File Tailer
// ============================================

use tokio::fs::File as AsyncFile;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader as AsyncBufReader};
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

/// Async version of FileTailer for use with tokio
pub struct AsyncFileTailer {
    file_path: PathBuf,
    parser: AttemptParser,
    from_start: bool,
}

impl AsyncFileTailer {
    /// Create a new async file tailer
    pub fn new(file_path: PathBuf, from_start: bool) -> Result<Self, FeedError> {
        Ok(AsyncFileTailer {
            file_path,
            parser: AttemptParser::new()?,
            from_start,
        })
    }

    /// Run the file tailer, sending attempts through the channel
    ///
    /// This method runs until the channel is closed, `shutdown` fires, or
    /// the file cannot be opened.
    pub async fn run(
        &mut self,
        tx: mpsc::Sender<LoginRequest>,
        shutdown: CancellationToken,
    ) -> Result<(), FeedError> {
        let file = AsyncFile::open(&self.file_path).await?;
        let mut reader = AsyncBufReader::new(file);
        if !self.from_start {
            reader.seek(std::io::SeekFrom::End(0)).await?;
        }

        log::info!("Async file tailer started for {:?}", self.file_path);

        let mut line = String::new();
        loop {
            let read = tokio::select! {
                _ = shutdown.cancelled() => break,
                read = reader.read_line(&mut line) => read,
            };

            match read {
                Ok(0) => {
                    // EOF - wait for more data
                    sleep(Duration::from_millis(100)).await;
                }
                Ok(_) if !line.ends_with('\n') => {
                    // partial line; keep it and wait for the rest
                    sleep(Duration::from_millis(100)).await;
                }
                Ok(_) => {
                    match self.parser.parse_line(&line) {
                        Ok(Some(request)) => {
                            if tx.send(request).await.is_err() {
                                log::info!("Channel closed, stopping file tailer");
                                break;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => log::warn!("Skipping attempt line: {}", e),
                    }
                    line.clear();
                }
                Err(e) => {
                    log::error!("Error reading file: {}", e);
                    sleep(Duration::from_secs(1)).await;
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn feed() -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "user=alice ip=203.0.113.7 device=laptop").unwrap();
        writeln!(file, "garbage line").unwrap();
        writeln!(file, r#"{{"user_id":"bob","ip_address":"198.51.100.4","device_id":"phone"}}"#).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_read_from_start_skips_bad_lines() {
        let file = feed();
        let mut tailer = FileTailer::new(file.path().to_path_buf(), true).unwrap();

        let requests = tailer.read_requests().unwrap();

        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].user_id, "alice");
        assert_eq!(requests[1].user_id, "bob");
    }

    #[test]
    fn test_tail_only_sees_new_lines() {
        let mut file = feed();
        let mut tailer = FileTailer::new(file.path().to_path_buf(), false).unwrap();
        tailer.initialize().unwrap();
        assert!(tailer.read_requests().unwrap().is_empty());

        writeln!(file, "user=carol ip=192.0.2.9 device=tablet").unwrap();
        file.flush().unwrap();

        let requests = tailer.read_requests().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].user_id, "carol");
    }

    #[tokio::test]
    async fn test_async_tailer_sends_and_stops() {
        let file = feed();
        let mut tailer = AsyncFileTailer::new(file.path().to_path_buf(), true).unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        let shutdown = CancellationToken::new();

        let stop = shutdown.clone();
        let handle = tokio::spawn(async move { tailer.run(tx, stop).await });

        assert_eq!(rx.recv().await.unwrap().user_id, "alice");
        assert_eq!(rx.recv().await.unwrap().user_id, "bob");

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }
}
