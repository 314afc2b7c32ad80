//! Helpers shared by the integration tests.

use std::time::Duration;

use futures::StreamExt;
use teleflux_core::{ByteStream, StreamError};

/// Drains `bytes`, returning everything received and the error that ended
/// the stream, if any.
pub async fn drain(mut bytes: ByteStream) -> (Vec<u8>, Option<StreamError>) {
    let mut received = Vec::new();
    while let Some(piece) = bytes.next().await {
        match piece {
            Ok(piece) => received.extend_from_slice(&piece),
            Err(e) => return (received, Some(e)),
        }
    }
    (received, None)
}

/// Reads the next `count` pieces, panicking if the stream ends early.
pub async fn take_pieces(bytes: &mut ByteStream, count: usize) -> Vec<u8> {
    let mut received = Vec::new();
    for _ in 0..count {
        let piece = bytes
            .next()
            .await
            .expect("stream ended early")
            .expect("stream failed");
        received.extend_from_slice(&piece);
    }
    received
}

/// Waits until `check` holds, polling every few milliseconds.
pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
