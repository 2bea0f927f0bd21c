//! Newline-framed JSON-RPC over a byte stream.
//!
//! [`Transport`] is the seam the client talks through. [`Connection`] frames
//! any async stream (TCP in production, an in-memory duplex in tests); the
//! test-only [`MockTransport`] skips framing and passes messages over
//! channels.

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use super::error::{StratumError, StratumResult};
use super::messages::JsonRpcMessage;

/// Longest line accepted from a pool. Jobs are a few hundred bytes.
const MAX_LINE: usize = 64 * 1024;

#[async_trait]
pub trait Transport: Send {
    /// Next message from the pool, or `None` once the pool closes.
    async fn read_message(&mut self) -> StratumResult<Option<JsonRpcMessage>>;

    async fn write_message(&mut self, msg: &JsonRpcMessage) -> StratumResult<()>;
}

pub struct Connection<S = TcpStream> {
    stream: BufStream<S>,
    line: Vec<u8>,
}

impl Connection<TcpStream> {
    /// Open a plain TCP connection to `host:port`.
    pub async fn connect(address: &str) -> StratumResult<Self> {
        debug!(address, "Connecting to pool");

        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| StratumError::ConnectionFailed(format!("{}: {}", address, e)))?;
        stream.set_nodelay(true)?;

        Ok(Self::new(stream))
    }
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream: BufStream::new(stream),
            line: Vec::with_capacity(1024),
        }
    }

    /// Read up to the next `\n`. Returns false at EOF with nothing buffered.
    async fn fill_line(&mut self) -> StratumResult<bool> {
        self.line.clear();
        let limit = (MAX_LINE + 1) as u64;
        let n = (&mut self.stream)
            .take(limit)
            .read_until(b'\n', &mut self.line)
            .await?;

        if n == 0 {
            return Ok(false);
        }
        if self.line.len() > MAX_LINE && self.line.last() != Some(&b'\n') {
            return Err(StratumError::InvalidMessage(format!(
                "line longer than {} bytes",
                MAX_LINE
            )));
        }
        Ok(true)
    }
}

#[async_trait]
impl<S> Transport for Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn read_message(&mut self) -> StratumResult<Option<JsonRpcMessage>> {
        while self.fill_line().await? {
            let line = self.line.trim_ascii();
            if line.is_empty() {
                continue;
            }

            let text = String::from_utf8_lossy(line);
            trace!(rx = %text, "Received message");

            return serde_json::from_slice(line).map(Some).map_err(|e| {
                StratumError::InvalidMessage(format!("{} in {}", e, text))
            });
        }
        Ok(None)
    }

    async fn write_message(&mut self, msg: &JsonRpcMessage) -> StratumResult<()> {
        let mut frame = serde_json::to_vec(msg)?;
        trace!(tx = %String::from_utf8_lossy(&frame), "Sending message");
        frame.push(b'\n');

        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        Ok(())
    }
}

/// Client side of an in-memory message pipe. Unlike a socket it does not
/// stop `tokio::time::pause()` from auto-advancing.
#[cfg(test)]
pub(crate) struct MockTransport {
    from_pool: tokio::sync::mpsc::UnboundedReceiver<JsonRpcMessage>,
    to_pool: tokio::sync::mpsc::UnboundedSender<JsonRpcMessage>,
}

/// Pool side of a [`MockTransport`].
#[cfg(test)]
pub(crate) struct MockTransportHandle {
    to_client: tokio::sync::mpsc::UnboundedSender<JsonRpcMessage>,
    from_client: tokio::sync::mpsc::UnboundedReceiver<JsonRpcMessage>,
}

#[cfg(test)]
impl MockTransport {
    pub fn pair() -> (Self, MockTransportHandle) {
        let (to_pool, from_client) = tokio::sync::mpsc::unbounded_channel();
        let (to_client, from_pool) = tokio::sync::mpsc::unbounded_channel();
        (
            MockTransport { from_pool, to_pool },
            MockTransportHandle {
                to_client,
                from_client,
            },
        )
    }
}

#[cfg(test)]
#[async_trait]
impl Transport for MockTransport {
    async fn read_message(&mut self) -> StratumResult<Option<JsonRpcMessage>> {
        Ok(self.from_pool.recv().await)
    }

    async fn write_message(&mut self, msg: &JsonRpcMessage) -> StratumResult<()> {
        self.to_pool
            .send(msg.clone())
            .map_err(|_| StratumError::Disconnected)
    }
}

#[cfg(test)]
impl MockTransportHandle {
    pub fn send(&self, msg: JsonRpcMessage) {
        self.to_client.send(msg).expect("client gone");
    }

    pub async fn recv(&mut self) -> JsonRpcMessage {
        self.from_client.recv().await.expect("client gone")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncWriteExt, duplex};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn connect_refused_names_address() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        match Connection::connect(&addr).await {
            Err(StratumError::ConnectionFailed(msg)) => assert!(msg.contains(&addr)),
            Err(other) => panic!("Expected ConnectionFailed, got {:?}", other),
            Ok(_) => panic!("Expected connect to fail"),
        }
    }

    #[tokio::test]
    async fn frames_one_message_per_line() {
        let (client, mut pool) = duplex(4096);
        let mut conn = Connection::new(client);

        conn.write_message(&JsonRpcMessage::request(1, "keepalived", json!({"id": "abc"})))
            .await
            .unwrap();

        let mut sent = vec![0u8; 256];
        let n = pool.read(&mut sent).await.unwrap();
        let sent = &sent[..n];
        assert_eq!(sent.last(), Some(&b'\n'));
        assert_eq!(sent.iter().filter(|b| **b == b'\n').count(), 1);

        pool.write_all(b"\r\n{\"id\":1,\"result\":{\"status\":\"KEEPALIVED\"},\"error\":null}\r\n")
            .await
            .unwrap();
        let reply = conn.read_message().await.unwrap().unwrap();
        assert_eq!(reply.id(), Some(1));

        drop(pool);
        assert!(conn.read_message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn garbage_line_is_invalid_message() {
        let (client, mut pool) = duplex(4096);
        let mut conn = Connection::new(client);

        pool.write_all(b"not json\n").await.unwrap();
        assert!(matches!(
            conn.read_message().await,
            Err(StratumError::InvalidMessage(_))
        ));
    }

    #[tokio::test]
    async fn overlong_line_rejected() {
        let (client, mut pool) = duplex(MAX_LINE * 2);
        let mut conn = Connection::new(client);

        pool.write_all(&vec![b'x'; MAX_LINE + 10]).await.unwrap();
        pool.write_all(b"\n").await.unwrap();

        match conn.read_message().await {
            Err(StratumError::InvalidMessage(msg)) => assert!(msg.contains("longer than")),
            other => panic!("Expected InvalidMessage, got {:?}", other),
        }
    }
}
