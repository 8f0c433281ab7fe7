//! Response destinations for proxied content.
//!
//! The proxy controller writes the response head first, then the body.
//! [`ChannelSink`] hands both to an HTTP handler while the copy is still
//! running; [`BufferSink`] collects everything in memory.

use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE, ETAG};
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncWrite, DuplexStream};
use tokio::sync::oneshot;

pub const DOCKER_CONTENT_DIGEST: HeaderName = HeaderName::from_static("docker-content-digest");

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub content_length: u64,
    pub content_type: Option<String>,
    pub digest: String,
}

impl ResponseHead {
    pub fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, HeaderValue::from(self.content_length));
        if let Some(content_type) = &self.content_type {
            if let Ok(value) = HeaderValue::from_str(content_type) {
                headers.insert(CONTENT_TYPE, value);
            }
        }
        if let Ok(value) = HeaderValue::from_str(&self.digest) {
            headers.insert(DOCKER_CONTENT_DIGEST, value);
        }
        if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", self.digest)) {
            headers.insert(ETAG, value);
        }
        headers
    }
}

pub trait ResponseSink: AsyncWrite + Unpin + Send {
    /// Record the response head. Called once, before any body byte.
    fn set_head(&mut self, head: ResponseHead);
}

/// In-memory sink.
#[derive(Debug, Default)]
pub struct BufferSink {
    head: Option<ResponseHead>,
    body: Vec<u8>,
}

impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn head(&self) -> Option<&ResponseHead> {
        self.head.as_ref()
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn into_parts(self) -> (Option<ResponseHead>, Vec<u8>) {
        (self.head, self.body)
    }
}

impl ResponseSink for BufferSink {
    fn set_head(&mut self, head: ResponseHead) {
        self.head = Some(head);
    }
}

impl AsyncWrite for BufferSink {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.get_mut().body.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Sink whose head is delivered over a oneshot channel and whose body is
/// piped through an in-memory duplex stream.
///
/// Writes fail with `BrokenPipe` once the reading half is dropped, which is
/// how a client disconnect reaches the copy loop.
#[derive(Debug)]
pub struct ChannelSink {
    head: Option<oneshot::Sender<ResponseHead>>,
    body: DuplexStream,
}

impl ChannelSink {
    /// Returns the sink, the head receiver and the readable end of the body.
    pub fn new(buffer_size: usize) -> (Self, oneshot::Receiver<ResponseHead>, DuplexStream) {
        let (head_tx, head_rx) = oneshot::channel();
        let (writer, reader) = tokio::io::duplex(buffer_size);
        (
            Self {
                head: Some(head_tx),
                body: writer,
            },
            head_rx,
            reader,
        )
    }
}

impl ResponseSink for ChannelSink {
    fn set_head(&mut self, head: ResponseHead) {
        if let Some(sender) = self.head.take() {
            let _ = sender.send(head);
        }
    }
}

impl AsyncWrite for ChannelSink {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().body).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().body).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().body).poll_shutdown(cx)
    }
}
