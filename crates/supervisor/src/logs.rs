use job_store::JobStore;
use models::{JobId, LogStream};
use tokio::io::AsyncBufReadExt;

/// Line is one recorded chunk of a job's captured output.
#[derive(Debug)]
pub struct Line {
    pub job_id: JobId,
    pub stream: LogStream,
    pub text: String,
}

/// Tx is the channel sender of log Lines. The channel is bounded, so slow
/// database writes apply backpressure to the pipe readers rather than
/// buffering without limit.
pub type Tx = tokio::sync::mpsc::Sender<Line>;

/// Default bound of the log channel.
pub const CHANNEL_DEPTH: usize = 8192;

/// Cap on the in-memory buffer for a single line; longer lines are split
/// into multiple chunks at the cap. Already-recorded chunks are never
/// discarded.
pub const LINE_CAP: usize = 256 * 1024;

/// Consume newline-delimited output from `reader`, sending each line as a
/// chunk to the sink. Returns the final non-empty line, which the caller
/// parses as the child's result or error document.
#[tracing::instrument(err, skip(tx, reader))]
pub async fn capture_lines<R>(
    tx: Tx,
    job_id: JobId,
    stream: LogStream,
    reader: R,
) -> Result<Option<String>, std::io::Error>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut reader = tokio::io::BufReader::new(reader);
    let mut pending: Vec<u8> = Vec::new();
    let mut last: Option<String> = None;

    loop {
        let chunk = reader.fill_buf().await?;
        if chunk.is_empty() {
            // EOF; flush any unterminated tail.
            if !pending.is_empty() {
                let text = String::from_utf8_lossy(&pending).into_owned();
                send(&tx, job_id, stream, &mut last, text).await;
            }
            return Ok(last);
        }

        let (consumed, line) = match chunk.iter().position(|&b| b == b'\n') {
            Some(at) => {
                pending.extend_from_slice(&chunk[..at]);
                (at + 1, Some(std::mem::take(&mut pending)))
            }
            None if pending.len() + chunk.len() >= LINE_CAP => {
                // Split an over-long line at the cap.
                pending.extend_from_slice(chunk);
                (chunk.len(), Some(std::mem::take(&mut pending)))
            }
            None => {
                pending.extend_from_slice(chunk);
                (chunk.len(), None)
            }
        };
        reader.consume(consumed);

        if let Some(line) = line {
            let text = String::from_utf8_lossy(&line).into_owned();
            send(&tx, job_id, stream, &mut last, text).await;
        }
    }
}

async fn send(tx: &Tx, job_id: JobId, stream: LogStream, last: &mut Option<String>, text: String) {
    if !text.trim().is_empty() {
        *last = Some(text.clone());
    }
    // The receiver lives for the life of the service; a send failure means
    // shutdown is underway and remaining output is dropped.
    let _ = tx
        .send(Line {
            job_id,
            stream,
            text,
        })
        .await;
}

/// Drain log Lines from the receiver into the job store, batching whatever
/// is immediately available into one transaction per write.
#[tracing::instrument(ret, skip_all)]
pub async fn serve_sink(
    store: JobStore,
    mut rx: tokio::sync::mpsc::Receiver<Line>,
) -> anyhow::Result<()> {
    let mut buffer: Vec<Line> = Vec::with_capacity(256);
    loop {
        let received = rx.recv_many(&mut buffer, 256).await;
        if received == 0 {
            tracing::debug!("log channel closed; sink exiting");
            return Ok(());
        }
        let batch: Vec<_> = buffer
            .drain(..)
            .map(|line| (line.job_id, line.stream, line.text))
            .collect();

        let store = store.clone();
        tokio::task::spawn_blocking(move || store.append_log_batch(&batch)).await??;
    }
}
