//! Streamed download bodies
//!
//! The store writes synchronously, the response body is polled
//! asynchronously. A bounded channel sits between the two; the blocking
//! side waits whenever the client falls behind.

use crate::api::REQUEST_ID_KEY;
use crate::service::ArchiveService;
use bytes::Bytes;
use futures::Stream;
use log::{info, warn};
use std::io::{self, Write};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Number of in-flight chunks between the store and the socket
const STREAM_BUFFER_CHUNKS: usize = 8;

type BodyChunk = Result<Bytes, io::Error>;

/// `Write` sink forwarding each buffer into the response channel.
///
/// Must only be used from a blocking thread.
pub struct ChannelWriter {
    tx: mpsc::Sender<BodyChunk>,
}

impl ChannelWriter {
    pub fn new(tx: mpsc::Sender<BodyChunk>) -> Self {
        Self { tx }
    }
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.tx
            .blocking_send(Ok(Bytes::copy_from_slice(buf)))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "client disconnected"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Start streaming `id` on the blocking pool and return the body stream.
///
/// Dropping the stream closes the channel, so the next chunk write fails
/// and the transfer stops.
pub fn download_body(
    service: Arc<ArchiveService>,
    id: String,
    request_id: String,
) -> impl Stream<Item = BodyChunk> {
    let (tx, rx) = mpsc::channel::<BodyChunk>(STREAM_BUFFER_CHUNKS);

    tokio::task::spawn_blocking(move || {
        log_mdc::insert(REQUEST_ID_KEY, &request_id);
        let mut sink = ChannelWriter::new(tx.clone());
        match service.download(&id, &mut sink) {
            Ok(written) => info!("Download of {} complete, {} bytes", id, written),
            Err(e) => {
                warn!("Download of {} aborted: {}", id, e);
                let _ = tx.blocking_send(Err(io::Error::new(io::ErrorKind::Other, e.to_string())));
            }
        }
        log_mdc::remove(REQUEST_ID_KEY);
    });

    futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (chunk, rx))
    })
}
