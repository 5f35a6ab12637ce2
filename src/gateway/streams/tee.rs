//! Usage: Streaming tee wrappers: forward upstream bytes to the client
//! unchanged while extracting token usage and closing out the request log.

use axum::body::Bytes;
use futures_core::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::gateway::usage::{SseUsageTracker, UsageAccumulator};
use crate::infra::request_details::MAX_STREAM_RESPONSE_SIZE;

use super::{FinalizeCtx, StreamOutcome};

struct CappedCollector {
    buffer: Vec<u8>,
    cap: usize,
    truncated: bool,
}

impl CappedCollector {
    fn new(cap: usize) -> Self {
        Self {
            buffer: Vec::new(),
            cap,
            truncated: false,
        }
    }

    fn push(&mut self, bytes: &[u8]) {
        if self.buffer.len() >= self.cap {
            self.truncated = true;
            return;
        }
        let remaining = self.cap - self.buffer.len();
        if bytes.len() > remaining {
            self.buffer.extend_from_slice(&bytes[..remaining]);
            self.truncated = true;
        } else {
            self.buffer.extend_from_slice(bytes);
        }
    }
}

/// Tee for `text/event-stream` bodies: chunks are relayed verbatim and fed to
/// the cross-chunk SSE usage tracker. Exactly one finalization happens, on
/// upstream EOF, upstream error, or drop (client abort).
pub(crate) struct SseUsageTeeStream<S>
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Unpin,
{
    upstream: S,
    ctx: FinalizeCtx,
    tracker: SseUsageTracker,
    usage: UsageAccumulator,
    collector: Option<CappedCollector>,
    finalized: bool,
}

impl<S> SseUsageTeeStream<S>
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Unpin,
{
    pub(crate) fn new(upstream: S, ctx: FinalizeCtx) -> Self {
        let collector = ctx
            .details
            .should_record(ctx.status as i64)
            .then(|| CappedCollector::new(MAX_STREAM_RESPONSE_SIZE));
        Self {
            upstream,
            ctx,
            tracker: SseUsageTracker::new(),
            usage: UsageAccumulator::default(),
            collector,
            finalized: false,
        }
    }

    fn ingest(&mut self, chunk: &Bytes) {
        let dialect = self.ctx.dialect.clone();
        let usage = &mut self.usage;
        self.tracker
            .ingest_chunk(chunk, &mut |data| dialect.apply_usage_payload(data, usage));
        if let Some(collector) = self.collector.as_mut() {
            collector.push(chunk);
        }
    }

    fn finalize(&mut self, outcome: StreamOutcome) {
        if self.finalized {
            return;
        }
        self.finalized = true;

        let dialect = self.ctx.dialect.clone();
        let usage = &mut self.usage;
        self.tracker
            .finish(&mut |data| dialect.apply_usage_payload(data, usage));

        let (collected, truncated) = match self.collector.take() {
            Some(CappedCollector {
                buffer, truncated, ..
            }) => (Some(buffer), truncated),
            None => (None, false),
        };
        self.ctx.finish(outcome, self.usage, collected, truncated);
    }
}

impl<S> Stream for SseUsageTeeStream<S>
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Unpin,
{
    type Item = Result<Bytes, reqwest::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.as_mut().get_mut();
        match Pin::new(&mut this.upstream).poll_next(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(None) => {
                this.finalize(StreamOutcome::Eof);
                Poll::Ready(None)
            }
            Poll::Ready(Some(Ok(chunk))) => {
                this.ingest(&chunk);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(err))) => {
                this.finalize(StreamOutcome::UpstreamError(err.to_string()));
                Poll::Ready(Some(Err(err)))
            }
        }
    }
}

impl<S> Drop for SseUsageTeeStream<S>
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Unpin,
{
    fn drop(&mut self) {
        if !self.finalized {
            self.finalize(StreamOutcome::ClientAbort);
        }
    }
}

/// Tee for non-SSE bodies: buffers a capped copy so usage can be parsed from
/// the complete JSON document at EOF.
pub(crate) struct BodyBufferTeeStream<S>
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Unpin,
{
    upstream: S,
    ctx: FinalizeCtx,
    collector: CappedCollector,
    finalized: bool,
}

const MAX_USAGE_BUFFER_BYTES: usize = 2 * 1024 * 1024;

impl<S> BodyBufferTeeStream<S>
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Unpin,
{
    pub(crate) fn new(upstream: S, ctx: FinalizeCtx) -> Self {
        Self {
            upstream,
            ctx,
            collector: CappedCollector::new(MAX_USAGE_BUFFER_BYTES),
            finalized: false,
        }
    }

    fn finalize(&mut self, outcome: StreamOutcome) {
        if self.finalized {
            return;
        }
        self.finalized = true;

        let collected = std::mem::take(&mut self.collector.buffer);
        let truncated = self.collector.truncated;

        let mut usage = UsageAccumulator::default();
        if !truncated && !collected.is_empty() {
            let body = if self.ctx.response_gzip {
                super::gunzip_with_limit(&collected, MAX_USAGE_BUFFER_BYTES).unwrap_or_default()
            } else {
                collected.clone()
            };
            if let Ok(text) = std::str::from_utf8(&body) {
                let dialect = self.ctx.dialect.clone();
                dialect.apply_usage_payload(text, &mut usage);
            }
        }

        self.ctx.finish(outcome, usage, Some(collected), truncated);
    }
}

impl<S> Stream for BodyBufferTeeStream<S>
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Unpin,
{
    type Item = Result<Bytes, reqwest::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.as_mut().get_mut();
        match Pin::new(&mut this.upstream).poll_next(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(None) => {
                this.finalize(StreamOutcome::Eof);
                Poll::Ready(None)
            }
            Poll::Ready(Some(Ok(chunk))) => {
                this.collector.push(&chunk);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(err))) => {
                this.finalize(StreamOutcome::UpstreamError(err.to_string()));
                Poll::Ready(Some(Err(err)))
            }
        }
    }
}

impl<S> Drop for BodyBufferTeeStream<S>
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Unpin,
{
    fn drop(&mut self) {
        if !self.finalized {
            self.finalize(StreamOutcome::ClientAbort);
        }
    }
}
