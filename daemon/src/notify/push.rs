use super::{PushSink, SinkError};
use crate::config::PushConfig;
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

#[derive(Clone)]
pub(crate) struct PushbulletClient {
    http: reqwest::Client,
    api_base: String,
    access_token: String,
    channel_tag: Option<String>,
}

impl PushbulletClient {
    pub(crate) fn new(config: &PushConfig) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_owned(),
            access_token: config.access_token.clone(),
            channel_tag: config.channel_tag.clone(),
        })
    }
}

#[derive(Serialize)]
struct Note<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    title: &'a str,
    body: &'a str,

    #[serde(skip_serializing_if = "Option::is_none")]
    channel_tag: Option<&'a str>,
}

#[async_trait]
impl PushSink for PushbulletClient {
    async fn push_note(&self, title: &str, body: &str) -> Result<(), SinkError> {
        self.http
            .post(format!("{}/v2/pushes", self.api_base))
            .header("Access-Token", &self.access_token)
            .json(&Note {
                kind: "note",
                title,
                body,
                channel_tag: self.channel_tag.as_deref(),
            })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
