//! Client for a Twitter v2 style API: a filtered stream of posts in, status
//! updates and replies out.

use super::{InboundMessage, MessageSource, SourceError};
use crate::{
    config::SocialConfig,
    notify::{SinkError, SocialSink},
};
use async_trait::async_trait;
use futures_util::{stream::BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub(crate) struct SocialClient {
    http: reqwest::Client,
    api_base: String,
    bearer_token: String,
}

impl SocialClient {
    pub(crate) fn new(config: &SocialConfig) -> Result<Self, reqwest::Error> {
        // No overall timeout, the stream request stays open indefinitely
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_owned(),
            bearer_token: config.bearer_token.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path)
    }

    async fn post_tweet(&self, body: &NewPost<'_>) -> Result<(), SinkError> {
        self.http
            .post(self.url("/2/tweets"))
            .bearer_auth(&self.bearer_token)
            .timeout(REQUEST_TIMEOUT)
            .json(body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[derive(Serialize)]
struct NewPost<'a> {
    text: &'a str,

    #[serde(skip_serializing_if = "Option::is_none")]
    reply: Option<ReplyTo<'a>>,
}

#[derive(Serialize)]
struct ReplyTo<'a> {
    in_reply_to_tweet_id: &'a str,
}

#[async_trait]
impl SocialSink for SocialClient {
    async fn post_status(&self, text: &str) -> Result<(), SinkError> {
        self.post_tweet(&NewPost { text, reply: None }).await
    }

    async fn reply(&self, in_reply_to: &str, text: &str) -> Result<(), SinkError> {
        self.post_tweet(&NewPost {
            text,
            reply: Some(ReplyTo {
                in_reply_to_tweet_id: in_reply_to,
            }),
        })
        .await
    }
}

#[derive(Debug, Deserialize)]
struct StreamEvent {
    data: StreamPost,

    #[serde(default)]
    includes: StreamIncludes,
}

#[derive(Debug, Deserialize)]
struct StreamPost {
    id: String,
    text: String,

    #[serde(default)]
    author_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamIncludes {
    #[serde(default)]
    users: Vec<StreamUser>,
}

#[derive(Debug, Deserialize)]
struct StreamUser {
    id: String,
    username: String,
}

impl StreamEvent {
    fn into_message(self) -> InboundMessage {
        let author = self.data.author_id.unwrap_or_default();

        let sender = self
            .includes
            .users
            .into_iter()
            .find(|u| u.id == author)
            .map(|u| u.username)
            .unwrap_or(author);

        InboundMessage {
            id: self.data.id,
            sender,
            text: self.data.text,
        }
    }
}

/// Newline delimited JSON stream of posts matching a search term.
pub(crate) struct SocialStream {
    client: SocialClient,
    search_term: String,
    rule_added: bool,
    body: Option<BoxStream<'static, reqwest::Result<Vec<u8>>>>,
    rx_buffer: Vec<u8>,
}

impl SocialStream {
    pub(crate) fn new(client: SocialClient, search_term: &str) -> Self {
        Self {
            client,
            search_term: search_term.to_owned(),
            rule_added: false,
            body: None,
            rx_buffer: Vec::new(),
        }
    }

    // Takes the client rather than `&self`, the stream body is not `Sync`
    async fn add_rule(client: &SocialClient, search_term: &str) -> Result<(), SourceError> {
        let rules = serde_json::json!({ "add": [{ "value": search_term }] });

        client
            .http
            .post(client.url("/2/tweets/search/stream/rules"))
            .bearer_auth(&client.bearer_token)
            .timeout(REQUEST_TIMEOUT)
            .json(&rules)
            .send()
            .await?
            .error_for_status()?;

        info!("Filtering message stream on {:?}", search_term);
        Ok(())
    }

    async fn connect(&mut self) -> Result<(), SourceError> {
        if !self.rule_added {
            Self::add_rule(&self.client, &self.search_term).await?;
            self.rule_added = true;
        }

        let response = self
            .client
            .http
            .get(self.client.url("/2/tweets/search/stream"))
            .query(&[("expansions", "author_id"), ("user.fields", "username")])
            .bearer_auth(&self.client.bearer_token)
            .send()
            .await?
            .error_for_status()?;

        info!("Connected to message stream");

        self.rx_buffer.clear();
        self.body = Some(
            response
                .bytes_stream()
                .map(|chunk| chunk.map(|b| b.to_vec()))
                .boxed(),
        );
        Ok(())
    }

    fn take_message(&mut self) -> Option<InboundMessage> {
        while let Some(end) = self.rx_buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.rx_buffer.drain(..=end).collect();

            // Blank lines are keep-alives
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            match serde_json::from_slice::<StreamEvent>(&line) {
                Ok(event) => return Some(event.into_message()),
                Err(e) => warn!(
                    "Ignoring unrecognised stream event ({e}): {}",
                    String::from_utf8_lossy(&line).trim()
                ),
            }
        }
        None
    }
}

#[async_trait]
impl MessageSource for SocialStream {
    async fn next_message(&mut self) -> Result<InboundMessage, SourceError> {
        loop {
            if let Some(message) = self.take_message() {
                debug!("Received post {} from {}", message.id, message.sender);
                return Ok(message);
            }

            if self.body.is_none() {
                self.connect().await?;
            }
            let Some(body) = self.body.as_mut() else {
                continue;
            };

            match body.next().await {
                Some(Ok(chunk)) => self.rx_buffer.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    self.body = None;
                    return Err(e.into());
                }
                None => {
                    self.body = None;
                    return Err(SourceError::Closed);
                }
            }
        }
    }
}
