//! [`IpsmApiClient`] – HTTP client for the translation service's channel API.
//!
//! | Call | Endpoint |
//! |---|---|
//! | list channels | `GET {base}/channels` |
//! | create channel | `POST {base}/channels` with a [`ChannelInput`] body |
//! | remove channel | `DELETE {base}/channels/{id}` |
//!
//! A platform owns at most one channel per direction, identified by its
//! source and sink topics. Each direction is reconciled independently:
//!
//! | Alignments declared | Channel exists | Action |
//! |---|---|---|
//! | no | no | nothing |
//! | no | yes | remove |
//! | yes | no | create |
//! | yes | yes, same alignments | keep |
//! | yes | yes, stale alignments | remove, then create |

use async_trait::async_trait;
use intermesh_types::topic::{
    from_translation_downstream, from_translation_upstream, to_translation_downstream, to_translation_upstream,
};
use intermesh_types::{Alignment, Platform};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::translation::{TranslationError, TranslationService};

/// A channel as listed by the translation service.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelInfo {
    pub id: i64,
    #[serde(default)]
    pub uuid: Option<String>,
    pub source: String,
    pub sink: String,
    #[serde(default)]
    pub inp_alignment_name: String,
    #[serde(default)]
    pub inp_alignment_version: String,
    #[serde(default)]
    pub out_alignment_name: String,
    #[serde(default)]
    pub out_alignment_version: String,
    #[serde(default)]
    pub desc_id: Option<String>,
    #[serde(default)]
    pub parallelism: u32,
}

/// Body of a channel creation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelInput {
    pub source: String,
    pub sink: String,
    pub inp_alignment_name: String,
    pub inp_alignment_version: String,
    pub out_alignment_name: String,
    pub out_alignment_version: String,
    pub parallelism: u32,
}

impl ChannelInput {
    fn new(source: String, sink: String, input: Option<&Alignment>, output: Option<&Alignment>) -> Self {
        let (inp_name, inp_version) = split(input);
        let (out_name, out_version) = split(output);
        Self {
            source,
            sink,
            inp_alignment_name: inp_name,
            inp_alignment_version: inp_version,
            out_alignment_name: out_name,
            out_alignment_version: out_version,
            parallelism: 1,
        }
    }

    fn matches(&self, channel: &ChannelInfo) -> bool {
        self.inp_alignment_name == channel.inp_alignment_name
            && self.inp_alignment_version == channel.inp_alignment_version
            && self.out_alignment_name == channel.out_alignment_name
            && self.out_alignment_version == channel.out_alignment_version
    }
}

fn split(alignment: Option<&Alignment>) -> (String, String) {
    alignment.map_or_else(Default::default, |a| (a.name.clone(), a.version.clone()))
}

/// What reconciling one direction requires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelAction {
    Nothing,
    Keep,
    Create(ChannelInput),
    Remove(i64),
    Replace { remove: i64, create: ChannelInput },
}

/// Decide how to bring `existing` in line with `wanted`.
pub fn plan_channel(existing: Option<&ChannelInfo>, wanted: Option<ChannelInput>) -> ChannelAction {
    match (existing, wanted) {
        (None, None) => ChannelAction::Nothing,
        (Some(channel), None) => ChannelAction::Remove(channel.id),
        (None, Some(input)) => ChannelAction::Create(input),
        (Some(channel), Some(input)) if input.matches(channel) => ChannelAction::Keep,
        (Some(channel), Some(input)) => ChannelAction::Replace {
            remove: channel.id,
            create: input,
        },
    }
}

/// Channels wanted for `platform`, downstream first.
fn wanted_channels(platform: &Platform) -> [(Direction, Option<ChannelInput>); 2] {
    let pid = &platform.platform_id;
    let downstream = platform.has_downstream_alignment().then(|| {
        ChannelInput::new(
            to_translation_downstream(pid),
            from_translation_downstream(pid),
            platform.downstream_input_alignment.as_ref(),
            platform.downstream_output_alignment.as_ref(),
        )
    });
    let upstream = platform.has_upstream_alignment().then(|| {
        ChannelInput::new(
            to_translation_upstream(pid),
            from_translation_upstream(pid),
            platform.upstream_input_alignment.as_ref(),
            platform.upstream_output_alignment.as_ref(),
        )
    });
    [(Direction::Downstream, downstream), (Direction::Upstream, upstream)]
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Downstream,
    Upstream,
}

impl Direction {
    fn topics(self, platform_id: &str) -> (String, String) {
        match self {
            Direction::Downstream => (to_translation_downstream(platform_id), from_translation_downstream(platform_id)),
            Direction::Upstream => (to_translation_upstream(platform_id), from_translation_upstream(platform_id)),
        }
    }

    fn label(self) -> &'static str {
        match self {
            Direction::Downstream => "downstream",
            Direction::Upstream => "upstream",
        }
    }
}

fn find_channel<'a>(channels: &'a [ChannelInfo], platform_id: &str, direction: Direction) -> Option<&'a ChannelInfo> {
    let (source, sink) = direction.topics(platform_id);
    channels.iter().find(|c| c.source == source && c.sink == sink)
}

// ─────────────────────────────────────────────────────────────────────────────
// Client
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct IpsmApiClient {
    base_url: String,
    http: reqwest::Client,
}

impl IpsmApiClient {
    /// # Errors
    ///
    /// Returns [`TranslationError::Http`] if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>) -> Result<Self, TranslationError> {
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::builder().build()?,
        })
    }

    pub async fn list_channels(&self) -> Result<Vec<ChannelInfo>, TranslationError> {
        let response = self.http.get(format!("{}/channels", self.base_url)).send().await?;
        Ok(check(response).await?.json().await?)
    }

    pub async fn create_channel(&self, input: &ChannelInput) -> Result<(), TranslationError> {
        let response = self
            .http
            .post(format!("{}/channels", self.base_url))
            .json(input)
            .send()
            .await?;
        check(response).await?;
        debug!(source = %input.source, sink = %input.sink, "translation channel created");
        Ok(())
    }

    pub async fn remove_channel(&self, id: i64) -> Result<(), TranslationError> {
        let response = self
            .http
            .delete(format!("{}/channels/{id}", self.base_url))
            .send()
            .await?;
        check(response).await?;
        debug!(channel_id = id, "translation channel removed");
        Ok(())
    }

    async fn apply(&self, action: ChannelAction) -> Result<(), TranslationError> {
        match action {
            ChannelAction::Nothing | ChannelAction::Keep => Ok(()),
            ChannelAction::Create(input) => self.create_channel(&input).await,
            ChannelAction::Remove(id) => self.remove_channel(id).await,
            ChannelAction::Replace { remove, create } => {
                self.remove_channel(remove).await?;
                self.create_channel(&create).await
            }
        }
    }
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response, TranslationError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(TranslationError::Status {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl TranslationService for IpsmApiClient {
    async fn setup_channels_for_platform(&self, platform: &Platform) -> Result<(), TranslationError> {
        let channels = self.list_channels().await?;
        for (direction, wanted) in wanted_channels(platform) {
            let existing = find_channel(&channels, &platform.platform_id, direction);
            let action = plan_channel(existing, wanted);
            debug!(
                platform_id = %platform.platform_id,
                direction = direction.label(),
                action = ?action,
                "reconciling translation channel"
            );
            self.apply(action).await?;
        }
        info!(platform_id = %platform.platform_id, "translation channels set up");
        Ok(())
    }

    async fn remove_channels_for_platform(&self, platform_id: &str) -> Result<(), TranslationError> {
        let channels = self.list_channels().await?;
        for direction in [Direction::Downstream, Direction::Upstream] {
            if let Some(channel) = find_channel(&channels, platform_id, direction) {
                self.remove_channel(channel.id).await?;
            }
        }
        info!(platform_id = %platform_id, "translation channels removed");
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
