use crate::error::GatewayError;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::AsyncBufRead;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// One line read off the upstream body, or the terminal read error.
pub enum ScanEvent {
    Line(String),
    Err(GatewayError),
}

/// The producer side of the passthrough/synthesis pumps: a line reader task
/// plus a detached watcher that aborts it if the downstream request is
/// cancelled while the read is blocked waiting on upstream.
pub struct LineProducer {
    pub rx: mpsc::Receiver<ScanEvent>,
    pub last_read_at: Arc<AtomicI64>,
    _done_tx: oneshot::Sender<()>,
}

pub fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Spawns the producer and watcher tasks described by the streaming
/// architecture: a buffered channel of capacity 16 carries scanned lines to
/// the caller's select loop, an `AtomicI64` timestamp lets that loop detect
/// upstream stalls without the producer itself needing a timeout, and the
/// watcher task aborts the producer when `cancel` fires so a blocked read
/// doesn't outlive the request.
pub fn spawn_line_producer<R>(reader: R, max_line_size: usize, cancel: CancellationToken) -> LineProducer
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(16);
    let last_read_at = Arc::new(AtomicI64::new(now_nanos()));
    let last_read_at_producer = last_read_at.clone();

    let producer = tokio::spawn(async move {
        let mut reader = reader;
        loop {
            match read_capped_line(&mut reader, max_line_size).await {
                Ok(Some(line)) => {
                    last_read_at_producer.store(now_nanos(), Ordering::SeqCst);
                    if tx.send(ScanEvent::Line(line)).await.is_err() {
                        return;
                    }
                }
                Ok(None) => return,
                Err(err) => {
                    let _ = tx.send(ScanEvent::Err(err)).await;
                    return;
                }
            }
        }
    });

    let (done_tx, mut done_rx) = oneshot::channel();
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {
                producer.abort();
            }
            _ = &mut done_rx => {}
        }
    });

    LineProducer {
        rx,
        last_read_at,
        _done_tx: done_tx,
    }
}

/// Reads one `\n`-terminated line (stripping a trailing `\r`), refusing to
/// buffer more than `max_line_size` bytes without finding a terminator.
/// Returns `Ok(None)` on a clean EOF with no partial line pending.
async fn read_capped_line<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    max_line_size: usize,
) -> Result<Option<String>, GatewayError> {
    use tokio::io::AsyncBufReadExt;

    let mut buf: Vec<u8> = Vec::new();
    loop {
        let available = match reader.fill_buf().await {
            Ok(chunk) => chunk,
            Err(e) => return Err(GatewayError::StreamReadError(e.to_string())),
        };

        if available.is_empty() {
            return if buf.is_empty() {
                Ok(None)
            } else {
                Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
            };
        }

        if let Some(pos) = available.iter().position(|&b| b == b'\n') {
            buf.extend_from_slice(&available[..pos]);
            let consumed = pos + 1;
            reader.consume(consumed);
            if buf.len() > max_line_size {
                return Err(GatewayError::ResponseTooLarge);
            }
            let mut line = String::from_utf8_lossy(&buf).into_owned();
            if line.ends_with('\r') {
                line.pop();
            }
            return Ok(Some(line));
        }

        let n = available.len();
        buf.extend_from_slice(available);
        reader.consume(n);
        if buf.len() > max_line_size {
            return Err(GatewayError::ResponseTooLarge);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tokio::io::{AsyncRead, ReadBuf};

    /// A reader whose `fill_buf` never resolves, standing in for an upstream
    /// body that has stalled mid-read.
    struct PendingReader;

    impl AsyncRead for PendingReader {
        fn poll_read(self: Pin<&mut Self>, _cx: &mut Context<'_>, _buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
            Poll::Pending
        }
    }

    impl AsyncBufRead for PendingReader {
        fn poll_fill_buf(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<&[u8]>> {
            Poll::Pending
        }

        fn consume(self: Pin<&mut Self>, _amt: usize) {}
    }

    #[tokio::test]
    async fn reads_lines_split_on_newline() {
        let body = Cursor::new(b"data: one\n\ndata: two\n\n".to_vec());
        let cancel = CancellationToken::new();
        let mut producer = spawn_line_producer(body, 1024, cancel);

        let mut lines = Vec::new();
        while let Some(event) = producer.rx.recv().await {
            match event {
                ScanEvent::Line(l) => lines.push(l),
                ScanEvent::Err(_) => break,
            }
        }
        assert_eq!(lines, vec!["data: one", "", "data: two", ""]);
    }

    #[tokio::test]
    async fn oversized_line_reports_response_too_large() {
        let body = Cursor::new(b"abcdefghij\n".to_vec());
        let cancel = CancellationToken::new();
        let mut producer = spawn_line_producer(body, 4, cancel);
        match producer.rx.recv().await {
            Some(ScanEvent::Err(GatewayError::ResponseTooLarge)) => {}
            other => panic!("expected ResponseTooLarge, got {:?}", other.is_some()),
        }
    }

    #[tokio::test]
    async fn cancellation_aborts_a_blocked_producer() {
        let cancel = CancellationToken::new();
        let mut producer = spawn_line_producer(PendingReader, 1024, cancel.clone());

        cancel.cancel();

        let event = tokio::time::timeout(Duration::from_secs(1), producer.rx.recv())
            .await
            .expect("cancellation watcher should abort the blocked producer promptly");
        assert!(event.is_none());
    }
}
