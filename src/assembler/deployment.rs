//! The analysis deployment: containers, resources and scheduling

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Affinity, Capabilities, Container, ContainerPort, EnvVar, HTTPGetAction,
    LocalObjectReference, NodeAffinity, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm,
    PodSpec, PodTemplateSpec, Probe, ResourceRequirements, SecurityContext, Toleration,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use super::volumes::{analysis_mounts, pod_volumes, staging_mounts, CsiMount};
use super::{
    ANALYSIS_CONTAINER, DEFAULT_RUN_AS, DEFAULT_WORKING_DIR, EXCLUDES_KEY, EXCLUDES_MOUNT,
    INPUT_PATHS_MOUNT, INPUT_PATH_LIST_KEY, PROXY_CONTAINER, PROXY_PORT, PROXY_PORT_NAME,
    STAGING_CONTAINER, STAGING_INIT_CONTAINER, STAGING_PORT, STAGING_PORT_NAME, TICKET_LIST_KEY,
};
use crate::config::ViceConfig;
use crate::job::{AnalysisJob, JobStep};
use crate::labels::{JobLabels, LABEL_EXTERNAL_ID};
use crate::Error;

/// Default CPU request in cores
pub const DEFAULT_CPU_REQUEST: f64 = 1.0;
/// Default CPU limit in cores
pub const DEFAULT_CPU_LIMIT: f64 = 4.0;
/// Default memory request in bytes (2 GiB)
pub const DEFAULT_MEMORY_REQUEST: i64 = 2 * 1024 * 1024 * 1024;
/// Default memory limit in bytes (8 GiB)
pub const DEFAULT_MEMORY_LIMIT: i64 = 8 * 1024 * 1024 * 1024;
/// Default ephemeral storage request in bytes (16 GiB)
pub const DEFAULT_STORAGE_REQUEST: i64 = 16 * 1024 * 1024 * 1024;

/// Extended resource name for NVIDIA GPUs
pub const GPU_RESOURCE: &str = "nvidia.com/gpu";

/// Taint/label key every analysis node carries
pub const ANALYSIS_NODE_KEY: &str = "analysis";
/// Taint/label key GPU nodes carry
pub const GPU_NODE_KEY: &str = "gpu";

fn or_default_f64(value: f64, default: f64) -> f64 {
    if value > 0.0 {
        value
    } else {
        default
    }
}

fn or_default_i64(value: i64, default: i64) -> i64 {
    if value > 0 {
        value
    } else {
        default
    }
}

fn quantity(value: impl ToString) -> Quantity {
    Quantity(value.to_string())
}

/// Requests and limits for the analysis container.
///
/// Zero means "use the default". A limit below its request is raised to
/// the request.
pub fn resource_requirements(job: &AnalysisJob, step: &JobStep) -> ResourceRequirements {
    let c = &step.container;

    let cpu_request = or_default_f64(c.min_cpu_cores, DEFAULT_CPU_REQUEST);
    let cpu_limit = or_default_f64(c.max_cpu_cores, DEFAULT_CPU_LIMIT).max(cpu_request);
    let mem_request = or_default_i64(c.min_memory_limit, DEFAULT_MEMORY_REQUEST);
    let mem_limit = or_default_i64(c.memory_limit, DEFAULT_MEMORY_LIMIT).max(mem_request);
    let storage_request = or_default_i64(c.min_disk_space, DEFAULT_STORAGE_REQUEST);

    let requests = BTreeMap::from([
        ("cpu".to_string(), quantity(cpu_request)),
        ("memory".to_string(), quantity(mem_request)),
        ("ephemeral-storage".to_string(), quantity(storage_request)),
    ]);
    let mut limits = BTreeMap::from([
        ("cpu".to_string(), quantity(cpu_limit)),
        ("memory".to_string(), quantity(mem_limit)),
    ]);
    if job.requests_gpu() {
        limits.insert(GPU_RESOURCE.to_string(), quantity(1));
    }

    ResourceRequirements {
        requests: Some(requests),
        limits: Some(limits),
        ..Default::default()
    }
}

fn scheduling_keys(gpu: bool) -> Vec<&'static str> {
    let mut keys = vec![ANALYSIS_NODE_KEY];
    if gpu {
        keys.push(GPU_NODE_KEY);
    }
    keys
}

/// Tolerations for the analysis (and GPU) taints.
pub fn tolerations(gpu: bool) -> Vec<Toleration> {
    scheduling_keys(gpu)
        .into_iter()
        .map(|key| Toleration {
            key: Some(key.to_string()),
            operator: Some("Equal".to_string()),
            value: Some("true".to_string()),
            effect: Some("NoSchedule".to_string()),
            ..Default::default()
        })
        .collect()
}

/// Required node affinity matching the tolerations.
pub fn affinity(gpu: bool) -> Affinity {
    let expressions = scheduling_keys(gpu)
        .into_iter()
        .map(|key| NodeSelectorRequirement {
            key: key.to_string(),
            operator: "In".to_string(),
            values: Some(vec!["true".to_string()]),
        })
        .collect();

    Affinity {
        node_affinity: Some(NodeAffinity {
            required_during_scheduling_ignored_during_execution: Some(NodeSelector {
                node_selector_terms: vec![NodeSelectorTerm {
                    match_expressions: Some(expressions),
                    ..Default::default()
                }],
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn readiness_probe(port: i32) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some("/".to_string()),
            port: IntOrString::Int(port),
            scheme: Some("HTTP".to_string()),
            ..Default::default()
        }),
        initial_delay_seconds: Some(0),
        period_seconds: Some(5),
        timeout_seconds: Some(30),
        success_threshold: Some(1),
        failure_threshold: Some(10),
        ..Default::default()
    }
}

fn env_vars(vars: BTreeMap<String, String>) -> Vec<EnvVar> {
    vars.into_iter()
        .map(|(name, value)| EnvVar {
            name,
            value: Some(value),
            ..Default::default()
        })
        .collect()
}

/// First declared port of the interactive step
pub(crate) fn backend_port(job: &AnalysisJob) -> Result<i32, Error> {
    job.primary_step()?
        .container
        .ports
        .first()
        .map(|p| p.container_port)
        .ok_or_else(|| {
            Error::validation(format!(
                "job {} declares no ports for its interactive step",
                job.invocation_id
            ))
        })
}

pub(crate) fn working_dir(step: &JobStep) -> &str {
    step.container
        .working_directory
        .as_deref()
        .filter(|d| !d.is_empty())
        .unwrap_or(DEFAULT_WORKING_DIR)
}

fn analysis_container(
    job: &AnalysisJob,
    labels: &JobLabels,
    config: &ViceConfig,
    csi_mounts: Option<&[CsiMount]>,
) -> Result<Container, Error> {
    let step = job.primary_step()?;
    let port = backend_port(job)?;
    let working_dir = working_dir(step);

    let mut env = step.environment.clone();
    env.insert(
        "REDIRECT_URL".to_string(),
        config.frontend_url(&labels.subdomain),
    );
    env.insert("IPLANT_USER".to_string(), job.submitter.clone());
    env.insert("IPLANT_EXECUTION_ID".to_string(), job.invocation_id.clone());

    let ports = step
        .container
        .ports
        .iter()
        .enumerate()
        .map(|(i, p)| ContainerPort {
            name: Some(format!("tcp-a-{}", i)),
            container_port: p.container_port,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        })
        .collect();

    Ok(Container {
        name: ANALYSIS_CONTAINER.to_string(),
        image: Some(step.container.image.reference()),
        image_pull_policy: Some("Always".to_string()),
        command: step.container.entrypoint.clone().map(|e| vec![e]),
        args: (!step.container.args.is_empty()).then(|| step.container.args.clone()),
        working_dir: Some(working_dir.to_string()),
        env: Some(env_vars(env)),
        ports: Some(ports),
        resources: Some(resource_requirements(job, step)),
        volume_mounts: Some(analysis_mounts(labels, working_dir, csi_mounts)),
        readiness_probe: Some(readiness_probe(port)),
        ..Default::default()
    })
}

fn proxy_container(
    job: &AnalysisJob,
    labels: &JobLabels,
    config: &ViceConfig,
) -> Result<Container, Error> {
    let port = backend_port(job)?;
    let backend = format!("http://localhost:{}", port);
    let args = vec![
        "--backend-url".to_string(),
        backend.clone(),
        "--ws-backend-url".to_string(),
        backend,
        "--cas-base-url".to_string(),
        config.cas_base_url.clone(),
        "--cas-validate".to_string(),
        "validate".to_string(),
        "--frontend-url".to_string(),
        config.frontend_url(&labels.subdomain),
        "--external-id".to_string(),
        job.invocation_id.clone(),
        "--get-analysis-id-base".to_string(),
        config.get_analysis_id_base.clone(),
        "--check-resource-access-base".to_string(),
        config.check_resource_access_base.clone(),
    ];

    Ok(Container {
        name: PROXY_CONTAINER.to_string(),
        image: Some(config.proxy_image.clone()),
        command: Some(vec![PROXY_CONTAINER.to_string()]),
        args: Some(args),
        ports: Some(vec![ContainerPort {
            name: Some(PROXY_PORT_NAME.to_string()),
            container_port: PROXY_PORT,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        readiness_probe: Some(readiness_probe(PROXY_PORT)),
        ..Default::default()
    })
}

fn staging_security_context(uid: i64) -> SecurityContext {
    SecurityContext {
        run_as_user: Some(uid),
        run_as_group: Some(uid),
        allow_privilege_escalation: Some(false),
        capabilities: Some(Capabilities {
            drop: Some(vec!["ALL".to_string()]),
            add: None,
        }),
        ..Default::default()
    }
}

fn staging_args(job: &AnalysisJob, working_dir: &str) -> Vec<String> {
    vec![
        "--user".to_string(),
        job.submitter.clone(),
        "--invocation-id".to_string(),
        job.invocation_id.clone(),
        "--download-destination".to_string(),
        working_dir.to_string(),
        "--upload-destination".to_string(),
        job.output_dir.clone(),
        "--excludes-file".to_string(),
        format!("{}/{}", EXCLUDES_MOUNT, EXCLUDES_KEY),
        "--input-path-list".to_string(),
        format!("{}/{}", INPUT_PATHS_MOUNT, INPUT_PATH_LIST_KEY),
        "--ticket-input-path-list".to_string(),
        format!("{}/{}", INPUT_PATHS_MOUNT, TICKET_LIST_KEY),
    ]
}

fn staging_containers(
    job: &AnalysisJob,
    config: &ViceConfig,
) -> Result<(Container, Container), Error> {
    let step = job.primary_step()?;
    let working_dir = working_dir(step);
    let uid = step.container.uid.unwrap_or(DEFAULT_RUN_AS);

    let mut init_args = vec!["--no-service".to_string()];
    init_args.extend(staging_args(job, working_dir));

    let init = Container {
        name: STAGING_INIT_CONTAINER.to_string(),
        image: Some(config.file_transfers_image.clone()),
        args: Some(init_args),
        working_dir: Some(working_dir.to_string()),
        volume_mounts: Some(staging_mounts(working_dir)),
        security_context: Some(staging_security_context(uid)),
        ..Default::default()
    };

    let mut sidecar_args = staging_args(job, working_dir);
    sidecar_args.extend(["--listen-port".to_string(), STAGING_PORT.to_string()]);

    let sidecar = Container {
        name: STAGING_CONTAINER.to_string(),
        image: Some(config.file_transfers_image.clone()),
        args: Some(sidecar_args),
        working_dir: Some(working_dir.to_string()),
        ports: Some(vec![ContainerPort {
            name: Some(STAGING_PORT_NAME.to_string()),
            container_port: STAGING_PORT,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        volume_mounts: Some(staging_mounts(working_dir)),
        security_context: Some(staging_security_context(uid)),
        readiness_probe: Some(readiness_probe(STAGING_PORT)),
        ..Default::default()
    };

    Ok((init, sidecar))
}

/// Build the deployment. `csi_mounts` is `Some` in CSI mode.
pub(crate) fn deployment(
    job: &AnalysisJob,
    labels: &JobLabels,
    config: &ViceConfig,
    csi_mounts: Option<&[CsiMount]>,
) -> Result<Deployment, Error> {
    let gpu = job.requests_gpu();

    let mut containers = vec![
        analysis_container(job, labels, config, csi_mounts)?,
        proxy_container(job, labels, config)?,
    ];
    let mut init_containers = None;
    if csi_mounts.is_none() {
        let (init, sidecar) = staging_containers(job, config)?;
        containers.push(sidecar);
        init_containers = Some(vec![init]);
    }

    let selector = BTreeMap::from([(
        LABEL_EXTERNAL_ID.to_string(),
        labels.external_id.as_str().to_string(),
    )]);

    Ok(Deployment {
        metadata: ObjectMeta {
            name: Some(labels.external_id.as_str().to_string()),
            namespace: Some(config.namespace.clone()),
            labels: Some(labels.to_map()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(selector),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels.to_map()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    restart_policy: Some("Always".to_string()),
                    automount_service_account_token: Some(false),
                    init_containers,
                    containers,
                    volumes: Some(pod_volumes(labels, csi_mounts)),
                    tolerations: Some(tolerations(gpu)),
                    affinity: Some(affinity(gpu)),
                    image_pull_secrets: config.image_pull_secret.as_ref().map(|name| {
                        vec![LocalObjectReference { name: name.clone() }]
                    }),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}
