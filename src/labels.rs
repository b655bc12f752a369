//! Job labels and the correlation key
//!
//! Every cluster object that belongs to one analysis carries the same
//! `external-id` label. There are no owner references between the objects;
//! that label is the only thing that groups them for listing and teardown.
//! [`ExternalId`] wraps it so selectors are always derived the same way.

use std::collections::BTreeMap;
use std::fmt;

use sha2::{Digest, Sha256};

use crate::job::AnalysisJob;
use crate::Error;

/// Label carrying the invocation id
pub const LABEL_EXTERNAL_ID: &str = "external-id";
/// Label carrying the slugified app name
pub const LABEL_APP_NAME: &str = "app-name";
/// Label carrying the app id
pub const LABEL_APP_ID: &str = "app-id";
/// Label carrying the slugified submitter name
pub const LABEL_USERNAME: &str = "username";
/// Label carrying the submitter's user id
pub const LABEL_USER_ID: &str = "user-id";
/// Label carrying the slugified analysis name
pub const LABEL_ANALYSIS_NAME: &str = "analysis-name";
/// Label marking the workload class
pub const LABEL_APP_TYPE: &str = "app-type";
/// Label carrying the ingress subdomain token
pub const LABEL_SUBDOMAIN: &str = "subdomain";
/// Label carrying the submitter's last known login IP
pub const LABEL_LOGIN_IP: &str = "login-ip";
/// Label carrying the tracking-store analysis id (filled in by relabeling)
pub const LABEL_ANALYSIS_ID: &str = "analysis-id";

/// Value of [`LABEL_APP_TYPE`] for interactive analyses
pub const APP_TYPE_INTERACTIVE: &str = "interactive";

/// Length of the subdomain token, including the leading `a`
pub const SUBDOMAIN_LENGTH: usize = 9;

const MAX_LABEL_VALUE_LEN: usize = 63;

// =============================================================================
// Correlation key
// =============================================================================

/// The invocation id of an analysis, used as the correlation key for every
/// object that belongs to it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExternalId(String);

impl ExternalId {
    /// Validate and wrap an invocation id.
    ///
    /// The id ends up verbatim in a label value, so it must satisfy the
    /// Kubernetes label value grammar.
    pub fn new(id: impl Into<String>) -> Result<Self, Error> {
        let id = id.into();
        if id.is_empty() {
            return Err(Error::validation("invocation id is empty"));
        }
        if !is_valid_label_value(&id) {
            return Err(Error::validation(format!(
                "invocation id '{}' is not a valid label value",
                id
            )));
        }
        Ok(Self(id))
    }

    /// Read the key from an object's labels, if present and well formed.
    pub fn from_labels(labels: &BTreeMap<String, String>) -> Option<Self> {
        labels
            .get(LABEL_EXTERNAL_ID)
            .and_then(|v| Self::new(v.clone()).ok())
    }

    /// The raw id
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Selector matching every object of this analysis
    pub fn selector(&self) -> Selector {
        Selector::new().eq(LABEL_EXTERNAL_ID, &self.0)
    }
}

impl fmt::Display for ExternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Selector
// =============================================================================

/// Equality-only label selector.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Selector {
    terms: BTreeMap<String, String>,
}

impl Selector {
    /// Empty selector (matches everything)
    pub fn new() -> Self {
        Self::default()
    }

    /// Selector for all interactive analyses
    pub fn interactive() -> Self {
        Self::new().eq(LABEL_APP_TYPE, APP_TYPE_INTERACTIVE)
    }

    /// Add a `key=value` term
    pub fn eq(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.terms.insert(key.into(), value.into());
        self
    }

    /// True if `labels` satisfies every term
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.terms
            .iter()
            .all(|(k, v)| labels.get(k).map(|l| l == v).unwrap_or(false))
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self
            .terms
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",");
        f.write_str(&joined)
    }
}

// =============================================================================
// Job labels
// =============================================================================

/// The fixed label set stamped on every object of one analysis.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobLabels {
    /// Correlation key
    pub external_id: ExternalId,
    /// Slugified app name
    pub app_name: String,
    /// App id
    pub app_id: String,
    /// Slugified submitter name
    pub username: String,
    /// Submitter's user id
    pub user_id: String,
    /// Slugified analysis name
    pub analysis_name: String,
    /// Ingress subdomain token
    pub subdomain: String,
    /// Slugified last-known login IP (empty when unknown)
    pub login_ip: String,
}

impl JobLabels {
    /// Build the label set for `job`.
    ///
    /// `user_id` and `login_ip` come from the lookup service; the subdomain is
    /// derived from the user id and invocation id.
    pub fn for_job(
        job: &AnalysisJob,
        user_id: &str,
        login_ip: Option<&str>,
        user_suffix: &str,
    ) -> Result<Self, Error> {
        let external_id = ExternalId::new(job.invocation_id.clone())?;
        if user_id.is_empty() {
            return Err(Error::validation(format!(
                "no user id for submitter '{}'",
                job.submitter
            )));
        }

        Ok(Self {
            subdomain: subdomain(user_id, external_id.as_str()),
            external_id,
            app_name: slugify(&job.app_name),
            app_id: slugify(&job.app_id),
            username: username_label(&job.submitter, user_suffix),
            user_id: slugify(user_id),
            analysis_name: slugify(&job.name),
            login_ip: login_ip.map(slugify).unwrap_or_default(),
        })
    }

    /// Wire representation for object metadata
    pub fn to_map(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (
                LABEL_EXTERNAL_ID.to_string(),
                self.external_id.as_str().to_string(),
            ),
            (LABEL_APP_NAME.to_string(), self.app_name.clone()),
            (LABEL_APP_ID.to_string(), self.app_id.clone()),
            (LABEL_USERNAME.to_string(), self.username.clone()),
            (LABEL_USER_ID.to_string(), self.user_id.clone()),
            (LABEL_ANALYSIS_NAME.to_string(), self.analysis_name.clone()),
            (
                LABEL_APP_TYPE.to_string(),
                APP_TYPE_INTERACTIVE.to_string(),
            ),
            (LABEL_SUBDOMAIN.to_string(), self.subdomain.clone()),
            (LABEL_LOGIN_IP.to_string(), self.login_ip.clone()),
        ])
    }
}

/// Deterministic subdomain token for (user id, invocation id).
///
/// `"a"` followed by the lowercase hex SHA-256 of the concatenation,
/// truncated to [`SUBDOMAIN_LENGTH`] characters. The leading letter keeps
/// the token a valid DNS label.
pub fn subdomain(user_id: &str, invocation_id: &str) -> String {
    let digest = Sha256::digest(format!("{}{}", user_id, invocation_id).as_bytes());
    let mut token = format!("a{:x}", digest);
    token.truncate(SUBDOMAIN_LENGTH);
    token
}

/// Username label value: suffix stripped, then slugified.
pub fn username_label(username: &str, user_suffix: &str) -> String {
    let bare = if user_suffix.is_empty() {
        username
    } else {
        username.strip_suffix(user_suffix).unwrap_or(username)
    };
    slugify(bare)
}

/// Turn arbitrary text into a valid label value.
///
/// Lowercases, maps anything outside `[a-z0-9._-]` to `-`, collapses dash
/// runs, caps the length at 63 and trims non-alphanumeric edges.
pub fn slugify(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars().flat_map(|c| c.to_lowercase()) {
        let mapped = if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '_' {
            c
        } else {
            '-'
        };
        if mapped == '-' && out.ends_with('-') {
            continue;
        }
        out.push(mapped);
    }

    out.truncate(MAX_LABEL_VALUE_LEN);
    out.trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}

fn is_valid_label_value(value: &str) -> bool {
    if value.len() > MAX_LABEL_VALUE_LEN {
        return false;
    }
    let edges_ok = value
        .chars()
        .next()
        .zip(value.chars().last())
        .map(|(a, b)| a.is_ascii_alphanumeric() && b.is_ascii_alphanumeric())
        .unwrap_or(true);
    edges_ok
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}
