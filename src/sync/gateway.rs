//! Contract the sync client consumes from the backend, plus two transports:
//! [`LocalGateway`] (same process as the repository) and [`HttpGateway`]
//! (REST + Server-Sent Events against the gateway service).

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{BoxStream, StreamExt};
use tokio::sync::broadcast;

use crate::approval::{self, ApprovalPolicy};
use crate::feed::ChangeFeed;
use crate::models::{AdjustVote, ChangeFilter, ChangeKind, Post, PostChange, PostId, VoteField, WriteVote};
use crate::repo::{PostRepo, RepoError};

#[derive(thiserror::Error, Debug)]
pub enum GatewayError {
    #[error("not found")]
    NotFound,
    #[error("rejected ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("transport: {0}")]
    Transport(String),
    #[error("decode: {0}")]
    Decode(String),
    /// The change stream dropped `n` events; the caller should resync.
    #[error("change stream lagged by {0}")]
    Lagged(u64),
}

impl From<RepoError> for GatewayError {
    fn from(e: RepoError) -> Self {
        match e {
            RepoError::NotFound => GatewayError::NotFound,
            RepoError::Conflict => GatewayError::Rejected { status: 409, message: "conflict".into() },
            RepoError::Internal(msg) => GatewayError::Transport(msg),
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            GatewayError::Decode(e.to_string())
        } else {
            GatewayError::Transport(e.to_string())
        }
    }
}

pub type ChangeStream = BoxStream<'static, Result<PostChange, GatewayError>>;

#[async_trait]
pub trait RemoteGateway: Send + Sync {
    async fn read_posts(&self) -> Result<Vec<Post>, GatewayError>;
    async fn read_post(&self, id: PostId) -> Result<Post, GatewayError>;
    async fn write_vote_count(&self, id: PostId, field: VoteField, value: u32) -> Result<Post, GatewayError>;
    async fn adjust_vote_count(&self, id: PostId, field: VoteField, delta: i32) -> Result<Post, GatewayError>;
    async fn check_status(&self, id: PostId) -> Result<bool, GatewayError>;
    /// Open one long-lived change stream filtered server side.
    async fn open_changes(&self, filter: ChangeFilter) -> Result<ChangeStream, GatewayError>;
}

// ---------------- in-process ----------------

/// Talks to a repository directly and mirrors the HTTP service's approval
/// recheck after each vote write.
#[derive(Clone)]
pub struct LocalGateway {
    repo: Arc<dyn PostRepo>,
    feed: ChangeFeed,
    approval: ApprovalPolicy,
}

impl LocalGateway {
    pub fn new(repo: Arc<dyn PostRepo>, feed: ChangeFeed, approval: ApprovalPolicy) -> Self {
        Self { repo, feed, approval }
    }

    async fn after_write(&self, mut post: Post) -> Result<Post, GatewayError> {
        post.status = approval::recheck(self.repo.as_ref(), &self.approval, &post).await?;
        Ok(post)
    }
}

#[async_trait]
impl RemoteGateway for LocalGateway {
    async fn read_posts(&self) -> Result<Vec<Post>, GatewayError> {
        Ok(self.repo.list_posts().await?)
    }

    async fn read_post(&self, id: PostId) -> Result<Post, GatewayError> {
        Ok(self.repo.get_post(id).await?)
    }

    async fn write_vote_count(&self, id: PostId, field: VoteField, value: u32) -> Result<Post, GatewayError> {
        let post = self.repo.write_vote_count(id, field, value).await?;
        self.after_write(post).await
    }

    async fn adjust_vote_count(&self, id: PostId, field: VoteField, delta: i32) -> Result<Post, GatewayError> {
        let post = self.repo.adjust_vote_count(id, field, delta).await?;
        self.after_write(post).await
    }

    async fn check_status(&self, id: PostId) -> Result<bool, GatewayError> {
        Ok(self.repo.get_status(id).await?)
    }

    async fn open_changes(&self, filter: ChangeFilter) -> Result<ChangeStream, GatewayError> {
        let rx = self.feed.subscribe();
        let stream = futures_util::stream::unfold(rx, move |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(change) if filter.matches(&change) => return Some((Ok(change), rx)),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(n)) => return Some((Err(GatewayError::Lagged(n)), rx)),
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }
}

// ---------------- HTTP + SSE ----------------

#[derive(Clone)]
pub struct HttpGateway {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpGateway {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client: reqwest::Client::new(), base_url, token: None }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1{}", self.base_url, path)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let req = self.client.request(method, self.url(path));
        match &self.token {
            Some(t) => req.bearer_auth(t),
            None => req,
        }
    }

    async fn send<T: serde::de::DeserializeOwned>(&self, req: reqwest::RequestBuilder) -> Result<T, GatewayError> {
        let resp = req.send().await?;
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(GatewayError::NotFound);
        }
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(GatewayError::Rejected { status: status.as_u16(), message });
        }
        Ok(resp.json::<T>().await?)
    }
}

#[async_trait]
impl RemoteGateway for HttpGateway {
    async fn read_posts(&self) -> Result<Vec<Post>, GatewayError> {
        self.send(self.request(reqwest::Method::GET, "/posts")).await
    }

    async fn read_post(&self, id: PostId) -> Result<Post, GatewayError> {
        self.send(self.request(reqwest::Method::GET, &format!("/posts/{id}"))).await
    }

    async fn write_vote_count(&self, id: PostId, field: VoteField, value: u32) -> Result<Post, GatewayError> {
        let req = self
            .request(reqwest::Method::PUT, &format!("/posts/{id}/votes/{}", field.as_str()))
            .json(&WriteVote { value });
        self.send(req).await
    }

    async fn adjust_vote_count(&self, id: PostId, field: VoteField, delta: i32) -> Result<Post, GatewayError> {
        let req = self
            .request(reqwest::Method::POST, &format!("/posts/{id}/votes/{}/adjust", field.as_str()))
            .json(&AdjustVote { delta });
        self.send(req).await
    }

    async fn check_status(&self, id: PostId) -> Result<bool, GatewayError> {
        self.send(self.request(reqwest::Method::GET, &format!("/posts/{id}/status"))).await
    }

    async fn open_changes(&self, filter: ChangeFilter) -> Result<ChangeStream, GatewayError> {
        let mut query: Vec<(&str, String)> = Vec::new();
        if let Some(kind) = filter.kind {
            query.push(("kind", match kind { ChangeKind::Insert => "insert", ChangeKind::Update => "update" }.to_string()));
        }
        if let Some(status) = filter.status {
            query.push(("status", status.to_string()));
        }
        if let Some(id) = filter.post_id {
            query.push(("post_id", id.to_string()));
        }
        let resp = self
            .request(reqwest::Method::GET, "/changes")
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .query(&query)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(GatewayError::Rejected { status: resp.status().as_u16(), message: "change stream refused".into() });
        }

        let bytes = Box::pin(resp.bytes_stream());
        let state = (bytes, SseDecoder::default(), VecDeque::new());
        let stream = futures_util::stream::unfold(state, |(mut bytes, mut decoder, mut pending)| async move {
            loop {
                if let Some(item) = pending.pop_front() {
                    return Some((item, (bytes, decoder, pending)));
                }
                match bytes.next().await {
                    Some(Ok(chunk)) => pending.extend(decoder.push(&chunk).into_iter().filter_map(SseEvent::into_change)),
                    Some(Err(e)) => return Some((Err(GatewayError::Transport(e.to_string())), (bytes, decoder, pending))),
                    None => return None,
                }
            }
        });
        Ok(stream.boxed())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SseEvent {
    pub event: String,
    pub data: String,
}

impl SseEvent {
    fn into_change(self) -> Option<Result<PostChange, GatewayError>> {
        match self.event.as_str() {
            "change" => Some(serde_json::from_str(&self.data).map_err(|e| GatewayError::Decode(e.to_string()))),
            "lagged" => Some(Err(GatewayError::Lagged(self.data.trim().parse().unwrap_or(0)))),
            _ => None,
        }
    }
}

/// Incremental `text/event-stream` decoder. Frames, and the UTF-8 sequences
/// inside them, may span chunks; bytes are only decoded once a frame is
/// complete.
#[derive(Default)]
pub(crate) struct SseDecoder {
    buf: Vec<u8>,
    /// Last byte seen was `\r`; a following `\n` belongs to it.
    pending_cr: bool,
}

impl SseDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buf.reserve(chunk.len());
        for &byte in chunk {
            if std::mem::take(&mut self.pending_cr) && byte == b'\n' {
                continue;
            }
            if byte == b'\r' {
                self.pending_cr = true;
                self.buf.push(b'\n');
            } else {
                self.buf.push(byte);
            }
        }

        let mut events = Vec::new();
        while let Some(end) = self.buf.windows(2).position(|w| w == b"\n\n") {
            let frame: Vec<u8> = self.buf.drain(..end + 2).collect();
            events.extend(parse_frame(&String::from_utf8_lossy(&frame)));
        }
        events
    }
}

fn parse_frame(frame: &str) -> Option<SseEvent> {
    let mut event = String::from("message");
    let mut data: Vec<&str> = Vec::new();
    for line in frame.lines() {
        if line.starts_with(':') {
            continue; // comment / keep-alive
        }
        let (name, value) = line.split_once(':').unwrap_or((line, ""));
        let value = value.strip_prefix(' ').unwrap_or(value);
        match name {
            "event" => event = value.to_string(),
            "data" => data.push(value),
            _ => {}
        }
    }
    (!data.is_empty()).then(|| SseEvent { event, data: data.join("\n") })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoder_handles_split_frames_and_comments() {
        let mut d = SseDecoder::default();
        assert!(d.push(b": keepalive\n\nevent: chan").is_empty());
        let events = d.push(b"ge\ndata: {\"a\":1}\n\nevent: lagged\ndata: 3\n\n");
        assert_eq!(
            events,
            vec![
                SseEvent { event: "change".into(), data: "{\"a\":1}".into() },
                SseEvent { event: "lagged".into(), data: "3".into() },
            ]
        );
    }

    #[test]
    fn decoder_accepts_crlf() {
        let mut d = SseDecoder::default();
        let events = d.push(b"event: change\r\ndata: x\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "x");
    }

    #[test]
    fn decoder_keeps_multibyte_chars_split_across_chunks() {
        let bytes = "event: change\ndata: Café\n\n".as_bytes();
        // split between the two bytes of 'é'
        let cut = bytes.len() - 3;
        assert_eq!(&bytes[cut - 1..cut + 1], "é".as_bytes());

        let mut d = SseDecoder::default();
        assert!(d.push(&bytes[..cut]).is_empty());
        let events = d.push(&bytes[cut..]);
        assert_eq!(events, vec![SseEvent { event: "change".into(), data: "Café".into() }]);
    }

    #[test]
    fn decoder_joins_crlf_split_across_chunks() {
        let mut d = SseDecoder::default();
        assert!(d.push(b"data: a\r").is_empty());
        assert!(d.push(b"\ndata: b\r").is_empty());
        let events = d.push(b"\n\r\n");
        assert_eq!(events, vec![SseEvent { event: "message".into(), data: "a\nb".into() }]);
    }

    #[test]
    fn lagged_event_maps_to_error() {
        let ev = SseEvent { event: "lagged".into(), data: "7".into() };
        assert!(matches!(ev.into_change(), Some(Err(GatewayError::Lagged(7)))));
        let other = SseEvent { event: "message".into(), data: "hi".into() };
        assert!(other.into_change().is_none());
    }
}
