//! External collaborators: analysis lookups and permission checks
//!
//! The orchestration core only sees the [`AnalysisLookup`] and
//! [`PermissionChecker`] traits. The HTTP implementations here talk to the
//! platform's apps and permissions services.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::http;
use crate::labels::ExternalId;
use crate::Error;

/// Resolves identities, analysis records and concurrency limits.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AnalysisLookup: Send + Sync {
    /// User id for a username
    async fn user_id(&self, username: &str) -> Result<String, Error>;

    /// Last known login IP, `None` if the user never logged in
    async fn login_ip(&self, username: &str) -> Result<Option<String>, Error>;

    /// Tracking-store analysis id for an external id
    async fn analysis_id(&self, external_id: &ExternalId) -> Result<String, Error>;

    /// Tracked status string (`Running`, `Completed`, ...) for an external id
    async fn analysis_status(&self, external_id: &ExternalId) -> Result<String, Error>;

    /// Per-user concurrency limit, `None` when the user has no override
    async fn user_job_limit(&self, username: &str) -> Result<Option<i64>, Error>;

    /// Store-wide default concurrency limit, `None` when unset
    async fn default_job_limit(&self) -> Result<Option<i64>, Error>;
}

/// Answers whether a user may act on an analysis.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PermissionChecker: Send + Sync {
    /// True if `user` may act on analysis `analysis_id`
    async fn is_allowed(&self, user: &str, analysis_id: &str) -> Result<bool, Error>;
}

// =============================================================================
// HTTP implementations
// =============================================================================

#[derive(Deserialize)]
struct UserIdBody {
    id: String,
}

#[derive(Deserialize)]
struct LoginIpBody {
    ip: Option<String>,
}

#[derive(Deserialize)]
struct AnalysisBody {
    id: String,
    status: String,
}

#[derive(Deserialize)]
struct LimitBody {
    limit: Option<i64>,
}

#[derive(Serialize)]
struct PermissionRequest<'a> {
    user: &'a str,
    analysis_id: &'a str,
}

#[derive(Deserialize)]
struct PermissionBody {
    allowed: bool,
}

/// [`AnalysisLookup`] backed by the apps service.
#[derive(Clone)]
pub struct HttpAnalysisLookup {
    base_url: String,
    client: reqwest::Client,
}

impl HttpAnalysisLookup {
    /// Client for the service at `base_url`
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: http::client(),
        }
    }

    /// GET a JSON body; `Ok(None)` on 404.
    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        segments: &[&str],
    ) -> Result<Option<T>, Error> {
        let url = http::endpoint(&self.base_url, segments)?;
        let response = self.client.get(url.clone()).send().await?;

        match response.status() {
            StatusCode::NOT_FOUND => {
                debug!(url = %url, "Lookup returned 404");
                Ok(None)
            }
            s if s.is_success() => Ok(Some(response.json::<T>().await?)),
            _ => Err(Error::lookup(format!(
                "GET {} failed: {}",
                url,
                http::error_message(response).await
            ))),
        }
    }

    async fn analysis(&self, external_id: &ExternalId) -> Result<AnalysisBody, Error> {
        self.get_json(&["analyses", "by-external-id", external_id.as_str()])
            .await?
            .ok_or_else(|| Error::not_found(format!("no analysis with external id {}", external_id)))
    }
}

#[async_trait]
impl AnalysisLookup for HttpAnalysisLookup {
    async fn user_id(&self, username: &str) -> Result<String, Error> {
        self.get_json::<UserIdBody>(&["users", username, "id"])
            .await?
            .map(|b| b.id)
            .ok_or_else(|| Error::not_found(format!("no user id for '{}'", username)))
    }

    async fn login_ip(&self, username: &str) -> Result<Option<String>, Error> {
        Ok(self
            .get_json::<LoginIpBody>(&["users", username, "login-ip"])
            .await?
            .and_then(|b| b.ip))
    }

    async fn analysis_id(&self, external_id: &ExternalId) -> Result<String, Error> {
        Ok(self.analysis(external_id).await?.id)
    }

    async fn analysis_status(&self, external_id: &ExternalId) -> Result<String, Error> {
        Ok(self.analysis(external_id).await?.status)
    }

    async fn user_job_limit(&self, username: &str) -> Result<Option<i64>, Error> {
        Ok(self
            .get_json::<LimitBody>(&["users", username, "job-limit"])
            .await?
            .and_then(|b| b.limit))
    }

    async fn default_job_limit(&self) -> Result<Option<i64>, Error> {
        Ok(self
            .get_json::<LimitBody>(&["job-limits", "default"])
            .await?
            .and_then(|b| b.limit))
    }
}

/// [`PermissionChecker`] backed by the permissions service.
#[derive(Clone)]
pub struct HttpPermissionChecker {
    base_url: String,
    client: reqwest::Client,
}

impl HttpPermissionChecker {
    /// Client for the service at `base_url`
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: http::client(),
        }
    }
}

#[async_trait]
impl PermissionChecker for HttpPermissionChecker {
    async fn is_allowed(&self, user: &str, analysis_id: &str) -> Result<bool, Error> {
        let url = http::endpoint(&self.base_url, &["check"])?;
        let response = self
            .client
            .post(url)
            .json(&PermissionRequest { user, analysis_id })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Error::lookup(format!(
                "permission check failed: {}",
                http::error_message(response).await
            )));
        }
        Ok(response.json::<PermissionBody>().await?.allowed)
    }
}
