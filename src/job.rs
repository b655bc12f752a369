//! Analysis job descriptor
//!
//! The launch request body. Read-only once deserialized; the assembler and
//! the labels are derived from it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Prefix of device paths that identify an NVIDIA GPU
pub const GPU_DEVICE_PREFIX: &str = "/dev/nvidia";

/// An interactive analysis launch request.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AnalysisJob {
    /// Globally unique invocation id (the `external-id` label)
    pub invocation_id: String,
    /// Analysis name chosen by the user
    pub name: String,
    /// Submitting username
    pub submitter: String,
    /// Submitter's user id, resolved through the lookup service when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// App id
    pub app_id: String,
    /// App name
    pub app_name: String,
    /// Remote directory outputs are uploaded to
    pub output_dir: String,
    /// Execution steps; the first one is the interactive step
    pub steps: Vec<JobStep>,
}

/// One execution step.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct JobStep {
    /// Container to run
    pub container: StepContainer,
    /// Environment variables
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// Remote inputs staged or mounted for this step
    #[serde(default)]
    pub inputs: Vec<StepInput>,
}

/// Container definition of a step.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
pub struct StepContainer {
    /// Image reference
    pub image: ContainerImage,
    /// Entry point override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<String>,
    /// Arguments
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory inside the container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
    /// Declared ports; the first one is fronted by the proxy
    #[serde(default)]
    pub ports: Vec<DeclaredPort>,
    /// User and group id the staging containers run as
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<i64>,
    /// CPU request in cores (0 = default)
    #[serde(default)]
    pub min_cpu_cores: f64,
    /// CPU limit in cores (0 = default)
    #[serde(default)]
    pub max_cpu_cores: f64,
    /// Memory request in bytes (0 = default)
    #[serde(default)]
    pub min_memory_limit: i64,
    /// Memory limit in bytes (0 = default)
    #[serde(default)]
    pub memory_limit: i64,
    /// Ephemeral storage request in bytes (0 = default)
    #[serde(default)]
    pub min_disk_space: i64,
    /// Host devices requested by the tool
    #[serde(default)]
    pub devices: Vec<Device>,
}

/// Image name and tag.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
pub struct ContainerImage {
    /// Repository/name
    pub name: String,
    /// Tag (defaults to `latest`)
    #[serde(default)]
    pub tag: String,
}

impl ContainerImage {
    /// `name:tag` reference
    pub fn reference(&self) -> String {
        let tag = if self.tag.is_empty() { "latest" } else { &self.tag };
        format!("{}:{}", self.name, tag)
    }
}

/// A port the analysis listens on.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DeclaredPort {
    /// Container port
    pub container_port: i32,
}

/// A host device mapping.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Device {
    /// Path on the host
    pub host_path: String,
    /// Path in the container
    #[serde(default)]
    pub container_path: String,
}

/// A remote input path, optionally with an access ticket.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StepInput {
    /// Absolute path in the remote store
    pub path: String,
    /// Access ticket for inputs the submitter cannot read directly
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticket: Option<String>,
}

impl StepInput {
    /// Final path component
    pub fn base_name(&self) -> &str {
        self.path
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or_default()
    }
}

impl AnalysisJob {
    /// The interactive step.
    pub fn primary_step(&self) -> Result<&JobStep, Error> {
        self.steps.first().ok_or_else(|| {
            Error::validation(format!("job {} has no steps", self.invocation_id))
        })
    }

    /// All inputs across all steps, in declaration order.
    pub fn inputs(&self) -> impl Iterator<Item = &StepInput> {
        self.steps.iter().flat_map(|s| s.inputs.iter())
    }

    /// True when any device of any step is an NVIDIA GPU.
    pub fn requests_gpu(&self) -> bool {
        self.steps.iter().any(|s| {
            s.container
                .devices
                .iter()
                .any(|d| d.host_path.to_lowercase().starts_with(GPU_DEVICE_PREFIX))
        })
    }

    /// Structural checks the assembler relies on.
    pub fn validate(&self) -> Result<(), Error> {
        if self.invocation_id.is_empty() {
            return Err(Error::validation("invocation id is empty"));
        }
        if self.submitter.is_empty() {
            return Err(Error::validation(format!(
                "job {} has no submitter",
                self.invocation_id
            )));
        }

        let step = self.primary_step()?;
        if step.container.image.name.is_empty() {
            return Err(Error::validation(format!(
                "job {} has no container image",
                self.invocation_id
            )));
        }
        if step.container.ports.is_empty() {
            return Err(Error::validation(format!(
                "job {} declares no ports for its interactive step",
                self.invocation_id
            )));
        }

        for input in self.inputs() {
            if !input.path.starts_with('/') {
                return Err(Error::validation(format!(
                    "input path '{}' is not absolute",
                    input.path
                )));
            }
        }
        if !self.output_dir.starts_with('/') {
            return Err(Error::validation(format!(
                "output directory '{}' is not absolute",
                self.output_dir
            )));
        }

        Ok(())
    }
}
