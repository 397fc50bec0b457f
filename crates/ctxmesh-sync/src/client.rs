//! HTTP client for the context API of an upstream node.

use std::pin::Pin;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::StatusCode;
use serde_json::Value;
use tracing::warn;

use ctxmesh_types::{
    ContextEntry, ContextId, ContextMetadata, DeleteResponse, SaveRequest, SaveResponse,
    StreamEvent, ORIGIN_HEADER,
};

/// Timeout applied to every non-streaming request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

//─────────────────────────────
//  Upstream client
//─────────────────────────────

/// Client for one upstream node's context API.
///
/// The underlying connection pool carries no global timeout so that the
/// event-stream subscription can stay open indefinitely; every other call
/// sets a per-request timeout.
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    base: String,
    http: reqwest::Client,
}

impl UpstreamClient {
    /// Client for the node at `base_url`.
    pub fn new(base_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("failed to build upstream http client")?;
        Ok(Self {
            base: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    /// Base URL this client targets.
    pub fn base_url(&self) -> &str {
        &self.base
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    /// Full listing with metadata, the catch-up entry point.
    pub async fn list_with_metadata(&self) -> Result<Vec<ContextEntry>> {
        let response = self
            .http
            .get(self.url("/contexts"))
            .query(&[("includeMetadata", "true")])
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .context("upstream listing failed")?
            .error_for_status()
            .context("upstream listing rejected")?;
        response
            .json()
            .await
            .context("malformed upstream context listing")
    }

    /// Fetch a payload; `None` when the context no longer exists upstream.
    pub async fn fetch_context(&self, id: &ContextId) -> Result<Option<Value>> {
        let response = self
            .http
            .get(self.url(&format!("/contexts/{id}")))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .with_context(|| format!("upstream fetch failed: {id}"))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = response
            .error_for_status()
            .with_context(|| format!("upstream fetch rejected: {id}"))?;
        Ok(Some(response.json().await.context("malformed upstream payload")?))
    }

    /// Fetch metadata; `None` when the context no longer exists upstream.
    pub async fn fetch_metadata(&self, id: &ContextId) -> Result<Option<ContextMetadata>> {
        let response = self
            .http
            .get(self.url(&format!("/contexts/{id}/metadata")))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .with_context(|| format!("upstream metadata fetch failed: {id}"))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = response
            .error_for_status()
            .with_context(|| format!("upstream metadata fetch rejected: {id}"))?;
        Ok(Some(response.json().await.context("malformed upstream metadata")?))
    }

    /// Forward a client write to the authority and return its response.
    pub async fn forward_save(&self, id: &ContextId, request: &SaveRequest) -> Result<SaveResponse> {
        let response = self
            .http
            .put(self.url(&format!("/contexts/{id}")))
            .json(request)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .with_context(|| format!("write forwarding failed: {id}"))?
            .error_for_status()
            .with_context(|| format!("write forwarding rejected: {id}"))?;
        response.json().await.context("malformed forwarded save response")
    }

    /// Forward a client delete to the authority.
    pub async fn forward_delete(&self, id: &ContextId) -> Result<DeleteResponse> {
        let response = self
            .http
            .delete(self.url(&format!("/contexts/{id}")))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .with_context(|| format!("delete forwarding failed: {id}"))?
            .error_for_status()
            .with_context(|| format!("delete forwarding rejected: {id}"))?;
        response.json().await.context("malformed forwarded delete response")
    }

    /// Push a committed update to a downstream peer, metadata verbatim.
    pub async fn push_update(
        &self,
        id: &ContextId,
        payload: &Value,
        metadata: &ContextMetadata,
        origin: &str,
    ) -> Result<()> {
        let Value::Object(metadata_map) = serde_json::to_value(metadata)? else {
            bail!("context metadata did not serialize to an object");
        };
        let body = SaveRequest {
            context: payload.clone(),
            metadata: Some(metadata_map),
        };
        self.http
            .put(self.url(&format!("/contexts/{id}")))
            .header(ORIGIN_HEADER, origin)
            .json(&body)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .with_context(|| format!("propagation push failed: {id}"))?
            .error_for_status()
            .with_context(|| format!("propagation push rejected: {id}"))?;
        Ok(())
    }

    /// Push a committed delete to a downstream peer.
    pub async fn push_delete(&self, id: &ContextId, origin: &str) -> Result<()> {
        self.http
            .delete(self.url(&format!("/contexts/{id}")))
            .header(ORIGIN_HEADER, origin)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .with_context(|| format!("propagation delete failed: {id}"))?
            .error_for_status()
            .with_context(|| format!("propagation delete rejected: {id}"))?;
        Ok(())
    }

    /// Open a single context's event stream, as agent clients do.
    ///
    /// The server closes the stream after delivering the context's delete.
    pub async fn subscribe_context(&self, id: &ContextId) -> Result<EventStream> {
        let response = self
            .http
            .get(self.url(&format!("/contexts/{id}/stream")))
            .send()
            .await
            .with_context(|| format!("context stream connect failed: {id}"))?
            .error_for_status()
            .with_context(|| format!("context stream connect rejected: {id}"))?;
        Ok(EventStream::new(response.bytes_stream()))
    }

    /// Open the upstream's all-contexts event stream.
    pub async fn subscribe(&self, server_type: &str, node_id: &str) -> Result<EventStream> {
        let response = self
            .http
            .get(self.url("/contexts/stream"))
            .query(&[("serverType", server_type), ("nodeId", node_id)])
            .send()
            .await
            .context("event stream connect failed")?
            .error_for_status()
            .context("event stream connect rejected")?;
        Ok(EventStream::new(response.bytes_stream()))
    }
}

//─────────────────────────────
//  Event stream decoding
//─────────────────────────────

/// Decoded view of an upstream event stream.
///
/// Frames arrive as `data: <JSON>` chunks separated by blank lines; chunk
/// boundaries are arbitrary, so bytes are buffered until a full frame is
/// available.
pub struct EventStream {
    inner: Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>,
    buffer: Vec<u8>,
}

impl EventStream {
    pub(crate) fn new(
        stream: impl Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
    ) -> Self {
        Self {
            inner: Box::pin(stream),
            buffer: Vec::new(),
        }
    }

    /// Next decoded event; `None` once the upstream closed the stream.
    pub async fn next_event(&mut self) -> Result<Option<StreamEvent>> {
        loop {
            while let Some(frame) = self.take_frame() {
                if let Some(event) = parse_frame(&frame)? {
                    return Ok(Some(event));
                }
            }
            match self.inner.next().await {
                Some(Ok(chunk)) => self.buffer.extend_from_slice(&chunk),
                Some(Err(err)) => return Err(err).context("event stream transport error"),
                None => {
                    if !self.buffer.is_empty() {
                        warn!("event stream closed mid-frame");
                    }
                    return Ok(None);
                }
            }
        }
    }

    /// Drain one blank-line-terminated frame from the buffer, if complete.
    fn take_frame(&mut self) -> Option<Vec<u8>> {
        let lf = self.buffer.windows(2).position(|w| w == b"\n\n");
        let crlf = self.buffer.windows(4).position(|w| w == b"\r\n\r\n");
        let (end, sep_len) = match (lf, crlf) {
            (Some(lf), Some(crlf)) if crlf < lf => (crlf, 4),
            (Some(lf), _) => (lf, 2),
            (None, Some(crlf)) => (crlf, 4),
            (None, None) => return None,
        };
        let frame = self.buffer[..end].to_vec();
        self.buffer.drain(..end + sep_len);
        Some(frame)
    }
}

/// Decode one frame; `None` for comment or field-less frames.
fn parse_frame(frame: &[u8]) -> Result<Option<StreamEvent>> {
    for line in frame.split(|b| *b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let Some(data) = line.strip_prefix(b"data:") else {
            continue;
        };
        let data = data.strip_prefix(b" ").unwrap_or(data);
        let event = serde_json::from_slice(data).context("malformed stream event")?;
        return Ok(Some(event));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctxmesh_types::StreamEventKind;

    fn stream_of(chunks: Vec<&'static [u8]>) -> EventStream {
        EventStream::new(futures::stream::iter(
            chunks.into_iter().map(|c| Ok(Bytes::from_static(c))),
        ))
    }

    #[tokio::test]
    async fn decodes_complete_frames() {
        let mut stream = stream_of(vec![
            b"data: {\"event\":\"connected\",\"timestamp\":\"2026-01-01T00:00:00Z\"}\n\n",
            b"data: {\"event\":\"ping\",\"timestamp\":\"2026-01-01T00:00:30Z\"}\n\n",
        ]);

        assert_eq!(
            stream.next_event().await.unwrap().unwrap().event,
            StreamEventKind::Connected
        );
        assert_eq!(
            stream.next_event().await.unwrap().unwrap().event,
            StreamEventKind::Ping
        );
        assert!(stream.next_event().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reassembles_frames_split_across_chunks() {
        let mut stream = stream_of(vec![
            b"data: {\"event\":\"update\",\"contextId\":\"c1\",\"metadata\":{\"version\":2,",
            b"\"lastModified\":\"2026-01-01T00:00:00Z\",\"size\":9},",
            b"\"timestamp\":\"2026-01-01T00:00:01Z\"}\n",
            b"\ndata: {\"event\":\"delete\",\"contextId\":\"c1\",\"timestamp\":\"2026-01-01T00:00:02Z\"}\n\n",
        ]);

        let update = stream.next_event().await.unwrap().unwrap();
        assert_eq!(update.event, StreamEventKind::Update);
        assert_eq!(update.context_id.unwrap().as_str(), "c1");
        assert_eq!(update.metadata.unwrap().version, 2);

        let delete = stream.next_event().await.unwrap().unwrap();
        assert_eq!(delete.event, StreamEventKind::Delete);
    }

    #[tokio::test]
    async fn skips_comment_frames_and_handles_crlf() {
        let mut stream = stream_of(vec![
            b": keep-alive\n\n",
            b"data: {\"event\":\"resync\",\"timestamp\":\"2026-01-01T00:00:00Z\"}\r\n\r\n",
        ]);

        let event = stream.next_event().await.unwrap().unwrap();
        assert_eq!(event.event, StreamEventKind::Resync);
    }

    #[tokio::test]
    async fn malformed_payload_is_an_error() {
        let mut stream = stream_of(vec![b"data: {not json}\n\n"]);
        assert!(stream.next_event().await.is_err());
    }
}
