/// Output reader: moves a child's merged output into the line queue.
///
/// One reader thread exists per child process. It owns the blocking read end
/// of the output pipe so the timing loop never blocks on raw I/O.
use std::io::{BufRead, BufReader, Read};
use std::thread::JoinHandle;
use tokio::sync::mpsc::UnboundedSender;

/// Failure reading the child's output mid-stream. Treated as end-of-stream.
#[derive(Debug)]
pub struct StreamReadError {
    pub source: std::io::Error,
}

impl std::fmt::Display for StreamReadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "failed to read child output: {}", self.source)
    }
}

impl std::error::Error for StreamReadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Why the reader stopped.
#[derive(Debug)]
pub enum ReaderExit {
    EndOfStream,
    /// The queue consumer went away before the stream ended.
    ConsumerGone,
    ReadFailed(StreamReadError),
}

/// Decode bytes as UTF-8, dropping invalid sequences instead of failing.
pub fn decode_lossy(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for chunk in bytes.utf8_chunks() {
        out.push_str(chunk.valid());
    }
    out
}

/// Strip a trailing `\n` or `\r\n`.
fn strip_terminator(mut bytes: &[u8]) -> &[u8] {
    if let [rest @ .., b'\n'] = bytes {
        bytes = rest;
    }
    if let [rest @ .., b'\r'] = bytes {
        bytes = rest;
    }
    bytes
}

/// Read `source` line by line, sending every non-empty line to `queue`.
///
/// Returns when the stream ends, a read fails, or the receiver is dropped.
/// The source is dropped (closing the pipe) on return.
pub fn drain_lines<R: Read>(source: R, queue: &UnboundedSender<String>) -> ReaderExit {
    let mut reader = BufReader::new(source);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => return ReaderExit::EndOfStream,
            Ok(_) => {
                let line = decode_lossy(strip_terminator(&buf));
                if line.is_empty() {
                    continue;
                }
                if queue.send(line).is_err() {
                    return ReaderExit::ConsumerGone;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return ReaderExit::ReadFailed(StreamReadError { source: e }),
        }
    }
}

/// Start the reader thread for one child process.
pub fn spawn_reader<R>(
    source: R,
    queue: UnboundedSender<String>,
    pid: Option<u32>,
) -> std::io::Result<JoinHandle<()>>
where
    R: Read + Send + 'static,
{
    std::thread::Builder::new()
        .name("output-reader".to_string())
        .spawn(move || match drain_lines(source, &queue) {
            ReaderExit::EndOfStream => tracing::debug!(?pid, "child output closed"),
            ReaderExit::ConsumerGone => tracing::debug!(?pid, "line queue dropped, reader exiting"),
            ReaderExit::ReadFailed(e) => {
                tracing::debug!(?pid, error = %e, "treating read failure as end of output")
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::sync::mpsc;

    fn collect(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<String> {
        let mut lines = Vec::new();
        while let Ok(line) = rx.try_recv() {
            lines.push(line);
        }
        lines
    }

    /// A reader that yields some bytes and then fails.
    struct FailingReader {
        data: Cursor<Vec<u8>>,
    }

    impl Read for FailingReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let n = self.data.read(buf)?;
            if n == 0 {
                return Err(std::io::Error::other("pipe broke"));
            }
            Ok(n)
        }
    }

    #[test]
    fn test_decode_lossy_drops_invalid_bytes() {
        assert_eq!(decode_lossy(b"tex \xff\xfe42"), "tex 42");
        assert_eq!(decode_lossy("héllo".as_bytes()), "héllo");
        assert_eq!(decode_lossy(b""), "");
    }

    #[test]
    fn test_drain_lines_preserves_order_and_skips_blank_lines() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let input = Cursor::new(b"first\n\nsecond\r\n\r\nthird".to_vec());
        let exit = drain_lines(input, &tx);
        assert!(matches!(exit, ReaderExit::EndOfStream));
        assert_eq!(collect(&mut rx), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_drain_lines_read_error_is_end_of_stream() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let input = FailingReader {
            data: Cursor::new(b"kept 1\nkept 2\n".to_vec()),
        };
        let exit = drain_lines(input, &tx);
        assert!(matches!(exit, ReaderExit::ReadFailed(_)));
        // Lines read before the failure are still delivered.
        assert_eq!(collect(&mut rx), vec!["kept 1", "kept 2"]);
    }

    #[test]
    fn test_drain_lines_stops_when_consumer_dropped() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let exit = drain_lines(Cursor::new(b"orphan\n".to_vec()), &tx);
        assert!(matches!(exit, ReaderExit::ConsumerGone));
    }

    #[test]
    fn test_spawn_reader_thread_finishes_at_eof() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = spawn_reader(Cursor::new(b"a\nb\n".to_vec()), tx, None).unwrap();
        handle.join().unwrap();
        assert_eq!(collect(&mut rx), vec!["a", "b"]);
        // Sender was dropped with the thread.
        assert!(rx.try_recv().is_err());
    }
}
