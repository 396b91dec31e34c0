//! Frame transport over a credit-based L2CAP stream.
//!
//! The channel already guarantees ordered, reliable byte delivery, so this
//! is just the codec fed from a background reader; writes block on peer
//! credit inside the stream itself.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::protocol::{self, Frame};
use crate::transport::{FrameTransport, TransportError, TransportKind};

const READ_CHUNK: usize = 4096;
const INCOMING_QUEUE: usize = 64;

pub struct L2capTransport {
    writer: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    incoming: Mutex<mpsc::Receiver<Result<Frame, TransportError>>>,
    reader_task: JoinHandle<()>,
}

impl L2capTransport {
    /// Wrap the channel's two byte streams and start the frame reader.
    pub fn start<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::channel(INCOMING_QUEUE);
        let reader_task = tokio::spawn(read_loop(reader, tx));
        Self {
            writer: Mutex::new(Box::new(writer)),
            incoming: Mutex::new(rx),
            reader_task,
        }
    }
}

async fn read_loop<R>(mut reader: R, tx: mpsc::Sender<Result<Frame, TransportError>>)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut chunk = vec![0u8; READ_CHUNK];
    let mut buffer: Vec<u8> = Vec::new();

    loop {
        let read = match reader.read(&mut chunk).await {
            Ok(0) => {
                let _ = tx.send(Err(TransportError::Closed)).await;
                return;
            }
            Ok(read) => read,
            Err(err) => {
                let _ = tx.send(Err(TransportError::Io(err.to_string()))).await;
                return;
            }
        };
        buffer.extend_from_slice(&chunk[..read]);

        match protocol::consume_frames(&mut buffer) {
            Ok(frames) => {
                for frame in frames {
                    if tx.send(Ok(frame)).await.is_err() {
                        return;
                    }
                }
            }
            Err(err) => {
                let _ = tx.send(Err(TransportError::Io(err.to_string()))).await;
                return;
            }
        }
    }
}

#[async_trait]
impl FrameTransport for L2capTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::L2cap
    }

    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        let envelope =
            protocol::encode(&frame).map_err(|err| TransportError::Io(err.to_string()))?;
        let mut writer = self.writer.lock().await;
        writer
            .write_all(&envelope)
            .await
            .map_err(|err| TransportError::Io(err.to_string()))?;
        writer
            .flush()
            .await
            .map_err(|err| TransportError::Io(err.to_string()))
    }

    async fn next_frame(&self) -> Result<Frame, TransportError> {
        self.incoming
            .lock()
            .await
            .recv()
            .await
            .unwrap_or(Err(TransportError::Closed))
    }

    async fn close(&self) {
        self.reader_task.abort();
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

impl Drop for L2capTransport {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DataPayload;

    fn duplex_pair() -> (L2capTransport, L2capTransport) {
        let (a, b) = tokio::io::duplex(16 * 1024);
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);
        (
            L2capTransport::start(a_read, a_write),
            L2capTransport::start(b_read, b_write),
        )
    }

    #[tokio::test]
    async fn frames_roundtrip_over_duplex_stream() {
        let (a, b) = duplex_pair();

        let frame = Frame::Data(DataPayload {
            sequence: 12,
            payload: vec![7; 4096],
        });
        a.send(frame.clone()).await.unwrap();
        assert_eq!(b.next_frame().await.unwrap(), frame);

        b.send(Frame::Ping(1)).await.unwrap();
        assert_eq!(a.next_frame().await.unwrap(), Frame::Ping(1));
    }

    #[tokio::test]
    async fn several_frames_in_one_burst_arrive_in_order() {
        let (a, b) = duplex_pair();
        for token in 0..5u32 {
            a.send(Frame::Ping(token)).await.unwrap();
        }
        for token in 0..5u32 {
            assert_eq!(b.next_frame().await.unwrap(), Frame::Ping(token));
        }
    }

    #[tokio::test]
    async fn closed_stream_terminates_the_frame_stream() {
        let (a, b) = duplex_pair();
        a.close().await;
        assert!(matches!(
            b.next_frame().await,
            Err(TransportError::Closed) | Err(TransportError::Io(_))
        ));
    }
}
