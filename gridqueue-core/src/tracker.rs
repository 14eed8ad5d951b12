//! Port for the authoritative external request tracker, plus a thin
//! reqwest-based REST binding.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

use gridqueue_model::TrackerStatus;

use crate::error::Result;

/// A request newly assigned to this scheduler by the tracker.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AssignedRequest {
    pub name: String,
    /// Where the full request specification lives: a URL or a local path.
    pub spec_reference: String,
}

/// Tracker-side view of a request's status and progress.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrackerReport {
    pub status: TrackerStatus,
    #[serde(default)]
    pub percent_complete: f32,
    #[serde(default)]
    pub percent_success: f32,
}

/// The external, authoritative service holding each request's canonical
/// status.
#[async_trait]
pub trait Tracker: Send + Sync {
    /// Requests assigned to a team but not yet queued here.
    async fn assigned_requests(&self, team: &str) -> Result<Vec<AssignedRequest>>;

    async fn request_status(&self, name: &str) -> Result<TrackerReport>;

    async fn set_status(&self, name: &str, status: TrackerStatus) -> Result<()>;

    async fn set_progress(
        &self,
        name: &str,
        percent_complete: f32,
        percent_success: f32,
    ) -> Result<()>;

    /// Attaches a diagnostic message to the request for operator visibility.
    async fn attach_message(&self, name: &str, text: &str) -> Result<()>;

    /// Records that this scheduler instance owns the request.
    async fn mark_acquired(&self, name: &str, scheduler_addr: &str) -> Result<()>;
}

/// REST client for the tracker service.
#[derive(Clone, Debug)]
pub struct HttpTracker {
    client: reqwest::Client,
    base: Url,
}

#[derive(Serialize)]
struct StatusPayload {
    status: TrackerStatus,
}

#[derive(Serialize)]
struct ProgressPayload {
    percent_complete: f32,
    percent_success: f32,
}

#[derive(Serialize)]
struct MessagePayload<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct AcquirePayload<'a> {
    scheduler: &'a str,
}

impl HttpTracker {
    pub fn new(client: reqwest::Client, base: Url) -> Self {
        Self { client, base }
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|()| crate::error::QueueError::Internal("tracker base URL cannot be a base".into()))?;
            path.pop_if_empty();
            for segment in segments {
                path.push(segment);
            }
        }
        Ok(url)
    }
}

#[async_trait]
impl Tracker for HttpTracker {
    async fn assigned_requests(&self, team: &str) -> Result<Vec<AssignedRequest>> {
        let url = self.endpoint(&["requests"])?;
        let response = self
            .client
            .get(url)
            .query(&[("team", team)])
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    async fn request_status(&self, name: &str) -> Result<TrackerReport> {
        let url = self.endpoint(&["request", name, "status"])?;
        let response = self.client.get(url).send().await?.error_for_status()?;
        Ok(response.json().await?)
    }

    async fn set_status(&self, name: &str, status: TrackerStatus) -> Result<()> {
        let url = self.endpoint(&["request", name, "status"])?;
        self.client
            .put(url)
            .json(&StatusPayload { status })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn set_progress(
        &self,
        name: &str,
        percent_complete: f32,
        percent_success: f32,
    ) -> Result<()> {
        let url = self.endpoint(&["request", name, "progress"])?;
        self.client
            .put(url)
            .json(&ProgressPayload {
                percent_complete,
                percent_success,
            })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn attach_message(&self, name: &str, text: &str) -> Result<()> {
        let url = self.endpoint(&["request", name, "message"])?;
        self.client
            .post(url)
            .json(&MessagePayload { text })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn mark_acquired(&self, name: &str, scheduler_addr: &str) -> Result<()> {
        let url = self.endpoint(&["request", name, "acquire"])?;
        self.client
            .post(url)
            .json(&AcquirePayload {
                scheduler: scheduler_addr,
            })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
