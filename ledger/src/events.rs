use crate::{Error, Result};
use futures_util::{Stream as FutStream, StreamExt};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio_tungstenite::{tungstenite::Message, WebSocketStream};
use tracing::{debug, error};

const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Stream of push updates from the WebSocket connection.
///
/// A spawned task decodes incoming JSON frames into a bounded channel; the
/// single consumer drains it, so updates are applied from exactly one task
/// rather than from per-callback contexts.
pub struct Stream<T: DeserializeOwned + Send + 'static> {
    receiver: mpsc::Receiver<Result<T>>,
    _handle: tokio::task::JoinHandle<()>,
}

impl<T: DeserializeOwned + Send + 'static> Drop for Stream<T> {
    fn drop(&mut self) {
        self._handle.abort();
    }
}

impl<T: DeserializeOwned + Send + 'static> Stream<T> {
    pub(crate) fn new<S>(ws: WebSocketStream<S>) -> Self
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        Self::new_with_capacity(ws, DEFAULT_CHANNEL_CAPACITY)
    }

    pub(crate) fn new_with_capacity<S>(mut ws: WebSocketStream<S>, capacity: usize) -> Self
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let capacity = if capacity == 0 {
            DEFAULT_CHANNEL_CAPACITY
        } else {
            capacity
        };
        let (tx, rx) = mpsc::channel(capacity);

        let handle = tokio::spawn(async move {
            while let Some(msg) = ws.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        debug!("Received text frame: {} bytes", text.len());
                        let decoded = serde_json::from_str(&text).map_err(Error::InvalidData);
                        if forward(&tx, decoded).await.is_err() {
                            break; // Receiver dropped
                        }
                    }
                    Ok(Message::Binary(data)) => {
                        debug!("Received binary frame: {} bytes", data.len());
                        let decoded = serde_json::from_slice(&data).map_err(Error::InvalidData);
                        if forward(&tx, decoded).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => {
                        debug!("WebSocket closed");
                        let _ = tx.send(Err(Error::ConnectionClosed)).await;
                        break;
                    }
                    Ok(_) => {} // Ignore other message types
                    Err(e) => {
                        error!("WebSocket error: {}", e);
                        let _ = tx.send(Err(e.into())).await;
                        break;
                    }
                }
            }
        });

        Self {
            receiver: rx,
            _handle: handle,
        }
    }

    /// Receive the next update from the stream
    pub async fn next(&mut self) -> Option<Result<T>> {
        self.receiver.recv().await
    }
}

async fn forward<T>(tx: &mpsc::Sender<Result<T>>, decoded: Result<T>) -> std::result::Result<(), ()>
where
    T: Send + 'static,
{
    if let Err(err) = &decoded {
        error!("Failed to decode update: {}", err);
    }
    tx.send(decoded).await.map_err(|_| ())
}

impl<T: DeserializeOwned + Send + 'static> FutStream for Stream<T> {
    type Item = Result<T>;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}
