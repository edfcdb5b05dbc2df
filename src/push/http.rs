//! Push connections carried over HTTP.
//!
//! Inbound frames arrive on a server-sent-events stream
//! (`GET {base}/events?connection=<id>`); outbound frames are POSTed to
//! `{base}/messages?connection=<id>`, one JSON document per request.

use std::collections::VecDeque;
use std::time::Duration;

use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::Client;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use url::Url;

use super::ConnectionId;
use super::error::TransportError;
use super::link::{Connector, Link};

#[derive(Debug, Clone)]
pub struct HttpConnector {
    client: Client,
    base_url: Url,
    bearer_token: Option<String>,
}

impl HttpConnector {
    pub fn new(base_url: &str) -> Result<Self, TransportError> {
        // No overall timeout: the event stream is meant to stay open.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        let mut base_url = Url::parse(base_url)?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self {
            client,
            base_url,
            bearer_token: None,
        })
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    fn endpoint(&self, path: &str, connection_id: &ConnectionId) -> Result<Url, TransportError> {
        let mut url = self.base_url.join(path)?;
        url.query_pairs_mut()
            .append_pair("connection", connection_id.as_str());
        Ok(url)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.bearer_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

impl Connector for HttpConnector {
    type Link = HttpLink;

    async fn open(&self, connection_id: &ConnectionId) -> Result<HttpLink, TransportError> {
        let events_url = self.endpoint("events", connection_id)?;
        let messages_url = self.endpoint("messages", connection_id)?;

        let response = self
            .authorized(self.client.get(events_url))
            .header(ACCEPT, "text/event-stream")
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(TransportError::Status(response.status().as_u16()));
        }

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
            .boxed();

        Ok(HttpLink {
            client: self.client.clone(),
            bearer_token: self.bearer_token.clone(),
            messages_url,
            stream: Some(stream),
            buffer: Vec::new(),
            ready: VecDeque::new(),
        })
    }
}

pub struct HttpLink {
    client: Client,
    bearer_token: Option<String>,
    messages_url: Url,
    stream: Option<BoxStream<'static, reqwest::Result<Vec<u8>>>>,
    buffer: Vec<u8>,
    ready: VecDeque<String>,
}

impl Link for HttpLink {
    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        if self.stream.is_none() {
            return Err(TransportError::Closed);
        }
        let mut request = self
            .client
            .post(self.messages_url.clone())
            .header(CONTENT_TYPE, "application/json")
            .timeout(Duration::from_secs(10))
            .body(frame);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(TransportError::Status(response.status().as_u16()));
        }
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            if let Some(frame) = self.ready.pop_front() {
                return Some(Ok(frame));
            }
            while let Some(event) = extract_sse_event(&mut self.buffer) {
                if let Some(data) = sse_data(&event) {
                    self.ready.push_back(data);
                }
            }
            if !self.ready.is_empty() {
                continue;
            }
            let stream = self.stream.as_mut()?;
            match stream.next().await {
                Some(Ok(chunk)) => self
                    .buffer
                    .extend(chunk.into_iter().filter(|byte| *byte != b'\r')),
                Some(Err(err)) => return Some(Err(err.into())),
                None => return None,
            }
        }
    }

    async fn close(&mut self) {
        self.stream = None;
        self.buffer.clear();
        self.ready.clear();
    }
}

/// Splits one complete event (terminated by a blank line) off the buffer.
fn extract_sse_event(buffer: &mut Vec<u8>) -> Option<String> {
    let pos = buffer.windows(2).position(|w| w == b"\n\n")?;
    let event: Vec<u8> = buffer.drain(..pos + 2).collect();
    Some(String::from_utf8_lossy(&event[..pos]).into_owned())
}

/// Joins the `data:` lines of an event. Comment-only events (keep-alives
/// from the server) carry no data.
fn sse_data(event: &str) -> Option<String> {
    let lines: Vec<&str> = event
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|value| value.strip_prefix(' ').unwrap_or(value))
        .collect();
    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn extracts_complete_events_only() {
        let mut buffer = b"data: one\n\ndata: tw".to_vec();
        assert_eq!(extract_sse_event(&mut buffer).as_deref(), Some("data: one"));
        assert_eq!(extract_sse_event(&mut buffer), None);
        assert_eq!(buffer, b"data: tw".to_vec());
    }

    #[test]
    fn data_lines_are_joined_and_comments_skipped() {
        assert_eq!(sse_data("event: message\ndata: {\"a\":1}").as_deref(), Some("{\"a\":1}"));
        assert_eq!(sse_data("data: a\ndata: b").as_deref(), Some("a\nb"));
        assert_eq!(sse_data(": keep-alive"), None);
    }

    #[tokio::test]
    async fn reads_frames_from_event_stream() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/push/events"))
            .and(query_param("connection", "c-1"))
            .and(header("accept", "text/event-stream"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(": hello\n\ndata: {\"n\":1}\r\n\r\ndata: {\"n\":2}\n\n"),
            )
            .mount(&server)
            .await;

        let connector = HttpConnector::new(&format!("{}/push", server.uri())).unwrap();
        let mut link = connector.open(&ConnectionId::from("c-1")).await.unwrap();

        assert_eq!(link.recv().await.unwrap().unwrap(), r#"{"n":1}"#);
        assert_eq!(link.recv().await.unwrap().unwrap(), r#"{"n":2}"#);
        assert!(link.recv().await.is_none());
    }

    #[tokio::test]
    async fn posts_outbound_frames_with_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/events"))
            .respond_with(ResponseTemplate::new(200).set_body_string(""))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/messages"))
            .and(query_param("connection", "c-2"))
            .and(header("authorization", "Bearer secret-token"))
            .and(body_string(r#"{"jsonrpc":"2.0","method":"heartbeat"}"#))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let connector = HttpConnector::new(&server.uri())
            .unwrap()
            .with_bearer_token("secret-token");
        let mut link = connector.open(&ConnectionId::from("c-2")).await.unwrap();
        link.send(r#"{"jsonrpc":"2.0","method":"heartbeat"}"#.into())
            .await
            .unwrap();

        link.close().await;
        assert!(matches!(
            link.send("late".into()).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn rejected_stream_fails_to_open() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let connector = HttpConnector::new(&server.uri()).unwrap();
        let err = connector
            .open(&ConnectionId::from("c-3"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::Status(503)));
    }
}
