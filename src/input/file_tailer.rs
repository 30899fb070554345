use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;

use super::{parse_event, InputError, PlatformEvent};

/// Read every platform event in a file
pub struct EventFileReader {
    file_path: PathBuf,
}

impl EventFileReader {
    pub fn new(file_path: PathBuf) -> Self {
        EventFileReader { file_path }
    }

    /// Parse the whole file, stopping at the first malformed line
    pub fn read_events(&self) -> Result<Vec<PlatformEvent>, InputError> {
        let reader = BufReader::new(File::open(&self.file_path)?);
        let mut events = Vec::new();

        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            match parse_event(&line) {
                Ok(Some(event)) => events.push(event),
                Ok(None) => {}
                Err(source) => {
                    return Err(InputError::Parse {
                        line: index + 1,
                        source,
                    })
                }
            }
        }

        Ok(events)
    }

    /// Check if the file still exists and is readable
    pub fn is_valid(&self) -> bool {
        self.file_path.exists()
    }
}

// ============================================
// Async File Tailer
// ============================================

use tokio::fs::File as AsyncFile;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader as AsyncBufReader};
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration as TokioDuration};

/// Follows an event file, forwarding appended events
pub struct AsyncFileTailer {
    file_path: PathBuf,
    from_start: bool,
}

impl AsyncFileTailer {
    /// Tail from the current end of the file
    pub fn new(file_path: PathBuf) -> Self {
        AsyncFileTailer {
            file_path,
            from_start: false,
        }
    }

    /// Replay existing lines before following new ones
    pub fn from_start(mut self) -> Self {
        self.from_start = true;
        self
    }

    /// Run the file tailer, sending events through the channel
    ///
    /// This method runs until the channel is closed or the file cannot be
    /// opened. Malformed lines are logged and skipped.
    pub async fn run(&mut self, tx: mpsc::Sender<PlatformEvent>) -> Result<(), InputError> {
        let file = AsyncFile::open(&self.file_path).await?;
        let mut reader = AsyncBufReader::new(file);

        if !self.from_start {
            reader.seek(std::io::SeekFrom::End(0)).await?;
        }

        log::info!("Event file tailer started for {:?}", self.file_path);

        let mut line_number = 0usize;
        let mut pending = String::new();
        loop {
            match reader.read_line(&mut pending).await {
                Ok(0) => {
                    // EOF - wait for more data
                    sleep(TokioDuration::from_millis(100)).await;
                }
                Ok(_) if !pending.ends_with('\n') => {
                    // Partial line, the writer has not finished it yet
                }
                Ok(_) => {
                    line_number += 1;
                    let line = std::mem::take(&mut pending);
                    match parse_event(&line) {
                        Ok(Some(event)) => {
                            if tx.send(event).await.is_err() {
                                log::info!("Channel closed, stopping file tailer");
                                break;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => log::warn!("Skipping line {}: {}", line_number, e),
                    }
                }
                Err(e) => {
                    log::error!("Error reading file: {}", e);
                    sleep(TokioDuration::from_secs(1)).await;
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

    const LINES: &str = r#"# replayed host events
{"type":"geofence","region_id":"office","transition":"enter"}

{"type":"advertisement","device_id":"AA:BB","name":"Office-Beacon-1","rssi":-58}
"#;

    #[test]
    fn test_read_events() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(LINES.as_bytes()).unwrap();

        let events = EventFileReader::new(file.path().to_path_buf())
            .read_events()
            .unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], PlatformEvent::Advertisement(_)));
    }

    #[test]
    fn test_read_events_reports_line_number() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{\"type\":\"foreground\",\"foreground\":true}\nnot json\n")
            .unwrap();

        let err = EventFileReader::new(file.path().to_path_buf())
            .read_events()
            .unwrap_err();
        assert!(matches!(err, InputError::Parse { line: 2, .. }));
    }

    #[tokio::test]
    async fn test_tailer_follows_appended_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(LINES.as_bytes()).unwrap();
        file.flush().unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let mut tailer = AsyncFileTailer::new(file.path().to_path_buf()).from_start();
        let handle = tokio::spawn(async move { tailer.run(tx).await });

        assert!(matches!(rx.recv().await, Some(PlatformEvent::Geofence(_))));
        assert!(matches!(rx.recv().await, Some(PlatformEvent::Advertisement(_))));

        writeln!(file, "{{\"type\":\"radio\",\"powered\":false}}").unwrap();
        file.flush().unwrap();
        let event = tokio::time::timeout(TokioDuration::from_secs(5), rx.recv())
            .await
            .unwrap();
        assert_eq!(event, Some(PlatformEvent::Radio { powered: false }));

        drop(rx);
        handle.abort();
    }
}
