//! Response relay body
//!
//! `RelayBody` pulls chunks from the upstream response and hands each one to
//! hyper as its own frame, so hyper writes and flushes it to the client as
//! soon as it arrives. Two things can stop it early:
//!
//! - the idle timer, re-armed on every chunk, fires before the next chunk
//!   (buffered mode always, streaming mode only if configured);
//! - the listener shutdown signal fires (streaming sessions only).
//!
//! When the client goes away hyper drops the body, which drops the upstream
//! stream and with it the upstream connection.

use crate::error::ProxyError;
use crate::pool::TargetSlot;
use bytes::Bytes;
use futures_util::stream::{BoxStream, StreamExt};
use futures_util::Stream;
use hyper::body::{Body, Frame};
use pin_project_lite::pin_project;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::{Instant, Sleep};
use tracing::{debug, info, trace, warn};

/// How a response is relayed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayMode {
    /// Ordinary response, idle timeout enforced
    Buffered,
    /// `text/event-stream`, open until either side ends it
    Streaming,
}

/// Resolves when the owning listener starts draining
pub type ShutdownSignal = Pin<Box<dyn Future<Output = ()> + Send>>;

pin_project! {
    pub struct RelayBody {
        upstream: BoxStream<'static, Result<Bytes, String>>,
        #[pin]
        idle: Option<Sleep>,
        idle_timeout: Option<Duration>,
        shutdown: Option<ShutdownSignal>,
        mode: RelayMode,
        target: String,
        relayed: u64,
        chunks: u64,
        done: bool,
        _slot: Option<TargetSlot>,
    }

    impl PinnedDrop for RelayBody {
        fn drop(this: Pin<&mut Self>) {
            let this = this.project();
            if !*this.done {
                debug!(
                    upstream = %this.target,
                    mode = ?this.mode,
                    bytes = *this.relayed,
                    "Client went away, cancelling upstream read"
                );
            }
        }
    }
}

impl RelayBody {
    pub fn new<S, E>(upstream: S, mode: RelayMode, idle_timeout: Option<Duration>, target: impl Into<String>) -> Self
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: fmt::Display,
    {
        Self {
            upstream: upstream.map(|chunk| chunk.map_err(|e| e.to_string())).boxed(),
            idle: idle_timeout.map(tokio::time::sleep),
            idle_timeout,
            shutdown: None,
            mode,
            target: target.into(),
            relayed: 0,
            chunks: 0,
            done: false,
            _slot: None,
        }
    }

    /// End the relay when `signal` resolves
    pub fn with_shutdown(mut self, signal: ShutdownSignal) -> Self {
        self.shutdown = Some(signal);
        self
    }

    /// Hold the pool slot until the body is finished or dropped
    pub fn with_slot(mut self, slot: TargetSlot) -> Self {
        self._slot = Some(slot);
        self
    }

    pub fn mode(&self) -> RelayMode {
        self.mode
    }
}

impl Body for RelayBody {
    type Data = Bytes;
    type Error = ProxyError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let mut this = self.project();
        if *this.done {
            return Poll::Ready(None);
        }

        if let Some(shutdown) = this.shutdown.as_mut() {
            if shutdown.as_mut().poll(cx).is_ready() {
                *this.done = true;
                info!(
                    upstream = %this.target,
                    chunks = *this.chunks,
                    "Listener draining, closing stream"
                );
                return Poll::Ready(None);
            }
        }

        match this.upstream.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                if let (Some(timeout), Some(idle)) = (*this.idle_timeout, this.idle.as_mut().as_pin_mut()) {
                    idle.reset(Instant::now() + timeout);
                }
                *this.relayed += chunk.len() as u64;
                *this.chunks += 1;
                trace!(upstream = %this.target, len = chunk.len(), "Relayed chunk");
                Poll::Ready(Some(Ok(Frame::data(chunk))))
            }
            Poll::Ready(Some(Err(e))) => {
                *this.done = true;
                warn!(upstream = %this.target, error = %e, "Upstream body failed mid-relay");
                Poll::Ready(Some(Err(ProxyError::UpstreamBody(e))))
            }
            Poll::Ready(None) => {
                *this.done = true;
                debug!(
                    upstream = %this.target,
                    bytes = *this.relayed,
                    chunks = *this.chunks,
                    "Upstream body complete"
                );
                Poll::Ready(None)
            }
            Poll::Pending => {
                if let Some(idle) = this.idle.as_mut().as_pin_mut() {
                    if idle.poll(cx).is_ready() {
                        *this.done = true;
                        let after = this.idle_timeout.unwrap_or_default();
                        warn!(
                            upstream = %this.target,
                            idle_ms = after.as_millis() as u64,
                            "Upstream idle timeout after response head, aborting"
                        );
                        return Poll::Ready(Some(Err(ProxyError::UpstreamTimeout {
                            target: this.target.clone(),
                            after,
                        })));
                    }
                }
                Poll::Pending
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.done
    }
}
