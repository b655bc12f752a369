//! Config maps, CSI volumes and the pod-level volume wiring

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    CSIPersistentVolumeSource, ConfigMap, ConfigMapVolumeSource, EmptyDirVolumeSource,
    PersistentVolume, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimVolumeSource, PersistentVolumeSpec, Volume, VolumeMount,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};

use super::{
    csi_claim_name, csi_volume_name, excludes_config_name, input_paths_config_name,
    CSI_MOUNT_PREFIX, EXCLUDES_KEY, EXCLUDES_MOUNT, INPUT_PATHS_MOUNT, INPUT_PATH_LIST_KEY,
    TICKET_LIST_KEY,
};
use crate::config::ViceConfig;
use crate::job::AnalysisJob;
use crate::labels::JobLabels;
use crate::mounts::{mount_root, plan_mounts};
use crate::Error;

/// Header line of the plain input path list
pub const INPUT_PATH_LIST_HEADER: &str =
    "# application/vnd.de.multi-input-path-list+csv; version=1";
/// Header line of the ticketed input path list
pub const TICKET_LIST_HEADER: &str = "# application/vnd.de.tickets-path-list+csv; version=1";

/// Label tying a claim to its volume
pub const LABEL_VOLUME_NAME: &str = "volume-name";

/// Pod volume holding the staged working directory
pub const STAGING_VOLUME: &str = "input-files";
/// Pod volume projecting the exclusion list
pub const EXCLUDES_VOLUME: &str = "excludes-file";
/// Pod volume projecting the input path lists
pub const INPUT_PATHS_VOLUME: &str = "input-path-list";

const CSI_CLIENT: &str = "irodsfuse";
const ACCESS_MODE: &str = "ReadWriteMany";

/// One CSI mount root and how the analysis sees it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CsiMount {
    /// Position in the sorted mount plan, used in object names
    pub index: usize,
    /// Remote mount root
    pub root: String,
    /// False for the root containing the output directory
    pub read_only: bool,
}

impl CsiMount {
    /// Path inside the analysis container
    pub fn mount_path(&self) -> String {
        format!("{}{}", CSI_MOUNT_PREFIX, self.root)
    }
}

/// Plan the CSI mounts for `job`: every input root plus the output root.
///
/// The output root is writable; a root shared by inputs and the output
/// appears once, writable.
pub fn plan_csi_mounts(job: &AnalysisJob) -> Result<Vec<CsiMount>, Error> {
    let output_root = mount_root(&job.output_dir)?;
    let mut paths: Vec<&str> = job.inputs().map(|i| i.path.as_str()).collect();
    paths.push(&job.output_dir);

    Ok(plan_mounts(&paths)?
        .into_iter()
        .enumerate()
        .map(|(index, root)| CsiMount {
            index,
            read_only: root != output_root,
            root,
        })
        .collect())
}

fn config_map(
    name: String,
    labels: &JobLabels,
    namespace: &str,
    data: BTreeMap<String, String>,
) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.to_map()),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    }
}

/// Base names of every input, one per line.
pub(crate) fn excludes_config_map(
    job: &AnalysisJob,
    labels: &JobLabels,
    namespace: &str,
) -> ConfigMap {
    let body: String = job
        .inputs()
        .map(|i| format!("{}\n", i.base_name()))
        .collect();
    config_map(
        excludes_config_name(&labels.external_id),
        labels,
        namespace,
        BTreeMap::from([(EXCLUDES_KEY.to_string(), body)]),
    )
}

/// Plain and ticketed input path lists.
pub(crate) fn input_path_list_config_map(
    job: &AnalysisJob,
    labels: &JobLabels,
    namespace: &str,
) -> ConfigMap {
    let mut plain = format!("{}\n", INPUT_PATH_LIST_HEADER);
    let mut ticketed = format!("{}\n", TICKET_LIST_HEADER);
    for input in job.inputs() {
        match &input.ticket {
            Some(ticket) => ticketed.push_str(&format!("{},{}\n", ticket, input.path)),
            None => plain.push_str(&format!("{}\n", input.path)),
        }
    }

    config_map(
        input_paths_config_name(&labels.external_id),
        labels,
        namespace,
        BTreeMap::from([
            (INPUT_PATH_LIST_KEY.to_string(), plain),
            (TICKET_LIST_KEY.to_string(), ticketed),
        ]),
    )
}

/// One CSI volume per mount root.
pub(crate) fn persistent_volumes(
    job: &AnalysisJob,
    labels: &JobLabels,
    mounts: &[CsiMount],
    config: &ViceConfig,
) -> Vec<PersistentVolume> {
    let user = job
        .submitter
        .strip_suffix(config.user_suffix.as_str())
        .unwrap_or(&job.submitter);

    mounts
        .iter()
        .map(|mount| {
            let name = csi_volume_name(&labels.external_id, mount.index);
            let mut volume_labels = labels.to_map();
            volume_labels.insert(LABEL_VOLUME_NAME.to_string(), name.clone());

            PersistentVolume {
                metadata: ObjectMeta {
                    name: Some(name.clone()),
                    labels: Some(volume_labels),
                    ..Default::default()
                },
                spec: Some(PersistentVolumeSpec {
                    capacity: Some(BTreeMap::from([(
                        "storage".to_string(),
                        Quantity(config.csi_capacity.clone()),
                    )])),
                    access_modes: Some(vec![ACCESS_MODE.to_string()]),
                    persistent_volume_reclaim_policy: Some("Retain".to_string()),
                    storage_class_name: Some(config.csi_storage_class.clone()),
                    csi: Some(CSIPersistentVolumeSource {
                        driver: config.csi_driver.clone(),
                        volume_handle: name,
                        read_only: Some(mount.read_only),
                        volume_attributes: Some(BTreeMap::from([
                            ("client".to_string(), CSI_CLIENT.to_string()),
                            ("path".to_string(), mount.root.clone()),
                            ("user".to_string(), user.to_string()),
                        ])),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }
        })
        .collect()
}

/// One claim per CSI volume, bound by name and by label selector.
pub(crate) fn persistent_volume_claims(
    labels: &JobLabels,
    mounts: &[CsiMount],
    config: &ViceConfig,
) -> Vec<PersistentVolumeClaim> {
    mounts
        .iter()
        .map(|mount| {
            let volume = csi_volume_name(&labels.external_id, mount.index);
            PersistentVolumeClaim {
                metadata: ObjectMeta {
                    name: Some(csi_claim_name(&labels.external_id, mount.index)),
                    namespace: Some(config.namespace.clone()),
                    labels: Some(labels.to_map()),
                    ..Default::default()
                },
                spec: Some(PersistentVolumeClaimSpec {
                    access_modes: Some(vec![ACCESS_MODE.to_string()]),
                    storage_class_name: Some(config.csi_storage_class.clone()),
                    volume_name: Some(volume.clone()),
                    selector: Some(LabelSelector {
                        match_labels: Some(BTreeMap::from([(
                            LABEL_VOLUME_NAME.to_string(),
                            volume,
                        )])),
                        ..Default::default()
                    }),
                    resources: Some(VolumeResourceRequirements {
                        requests: Some(BTreeMap::from([(
                            "storage".to_string(),
                            Quantity(config.csi_capacity.clone()),
                        )])),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }
        })
        .collect()
}

/// Pod volumes. Staging mode and CSI mode never share a volume.
pub(crate) fn pod_volumes(labels: &JobLabels, csi_mounts: Option<&[CsiMount]>) -> Vec<Volume> {
    match csi_mounts {
        Some(mounts) => mounts
            .iter()
            .map(|mount| {
                let claim = csi_claim_name(&labels.external_id, mount.index);
                Volume {
                    name: claim.clone(),
                    persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                        claim_name: claim,
                        read_only: Some(mount.read_only),
                    }),
                    ..Default::default()
                }
            })
            .collect(),
        None => vec![
            Volume {
                name: STAGING_VOLUME.to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            },
            Volume {
                name: EXCLUDES_VOLUME.to_string(),
                config_map: Some(ConfigMapVolumeSource {
                    name: excludes_config_name(&labels.external_id),
                    ..Default::default()
                }),
                ..Default::default()
            },
            Volume {
                name: INPUT_PATHS_VOLUME.to_string(),
                config_map: Some(ConfigMapVolumeSource {
                    name: input_paths_config_name(&labels.external_id),
                    ..Default::default()
                }),
                ..Default::default()
            },
        ],
    }
}

fn mount(name: &str, path: &str, read_only: bool) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        read_only: read_only.then_some(true),
        ..Default::default()
    }
}

/// Mounts of the analysis container.
pub(crate) fn analysis_mounts(
    labels: &JobLabels,
    working_dir: &str,
    csi_mounts: Option<&[CsiMount]>,
) -> Vec<VolumeMount> {
    match csi_mounts {
        Some(mounts) => mounts
            .iter()
            .map(|m| {
                mount(
                    &csi_claim_name(&labels.external_id, m.index),
                    &m.mount_path(),
                    m.read_only,
                )
            })
            .collect(),
        None => vec![mount(STAGING_VOLUME, working_dir, false)],
    }
}

/// Mounts shared by the staging init container and sidecar.
pub(crate) fn staging_mounts(working_dir: &str) -> Vec<VolumeMount> {
    vec![
        mount(STAGING_VOLUME, working_dir, false),
        mount(EXCLUDES_VOLUME, EXCLUDES_MOUNT, true),
        mount(INPUT_PATHS_VOLUME, INPUT_PATHS_MOUNT, true),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::tests::sample_job;
    use crate::job::StepInput;

    fn labels_for(job: &AnalysisJob) -> JobLabels {
        JobLabels::for_job(job, "alice-id", None, "").unwrap()
    }

    #[test]
    fn test_output_root_is_writable_and_inputs_are_not() {
        let mut job = sample_job("abc123", "alice");
        job.steps[0].inputs.push(StepInput {
            path: "/zoneA/data/shared/ref.fa".to_string(),
            ticket: None,
        });

        let mounts = plan_csi_mounts(&job).unwrap();
        assert_eq!(
            mounts,
            vec![
                CsiMount {
                    index: 0,
                    root: "/zoneA/data".to_string(),
                    read_only: true,
                },
                CsiMount {
                    index: 1,
                    root: "/zoneA/home/alice".to_string(),
                    read_only: false,
                },
            ]
        );
        assert_eq!(mounts[1].mount_path(), "/data/zoneA/home/alice");
    }

    #[test]
    fn test_shared_input_and_output_root_is_mounted_once() {
        let job = sample_job("abc123", "alice");
        let mounts = plan_csi_mounts(&job).unwrap();
        assert_eq!(mounts.len(), 1);
        assert!(!mounts[0].read_only);
    }

    #[test]
    fn test_input_lists_split_ticketed_inputs() {
        let mut job = sample_job("abc123", "alice");
        job.steps[0].inputs.push(StepInput {
            path: "/zoneA/home/bob/shared.csv".to_string(),
            ticket: Some("t-42".to_string()),
        });
        let cm = input_path_list_config_map(&job, &labels_for(&job), "vice-apps");
        let data = cm.data.unwrap();

        let plain = &data[INPUT_PATH_LIST_KEY];
        assert!(plain.starts_with(INPUT_PATH_LIST_HEADER));
        assert!(plain.contains("/zoneA/home/alice/in.txt\n"));
        assert!(!plain.contains("shared.csv"));

        let ticketed = &data[TICKET_LIST_KEY];
        assert!(ticketed.starts_with(TICKET_LIST_HEADER));
        assert!(ticketed.contains("t-42,/zoneA/home/bob/shared.csv\n"));
        assert_eq!(cm.metadata.name.as_deref(), Some("input-path-list-abc123"));
    }

    #[test]
    fn test_excludes_lists_input_base_names() {
        let job = sample_job("abc123", "alice");
        let cm = excludes_config_map(&job, &labels_for(&job), "vice-apps");
        assert_eq!(cm.data.unwrap()[EXCLUDES_KEY], "in.txt\n");
    }

    #[test]
    fn test_claims_bind_to_their_volumes() {
        let job = sample_job("abc123", "alice");
        let labels = labels_for(&job);
        let config = ViceConfig::default();
        let mounts = plan_csi_mounts(&job).unwrap();

        let pvs = persistent_volumes(&job, &labels, &mounts, &config);
        let pvcs = persistent_volume_claims(&labels, &mounts, &config);

        let pv_name = pvs[0].metadata.name.clone().unwrap();
        assert_eq!(pv_name, "csi-data-volume-abc123-0");
        let csi = pvs[0].spec.as_ref().unwrap().csi.as_ref().unwrap();
        assert_eq!(csi.driver, "irods.csi.cyverse.org");
        assert_eq!(
            csi.volume_attributes.as_ref().unwrap()["path"],
            "/zoneA/home/alice"
        );

        let claim_spec = pvcs[0].spec.as_ref().unwrap();
        assert_eq!(claim_spec.volume_name.as_deref(), Some(pv_name.as_str()));
        assert_eq!(
            pvcs[0].metadata.name.as_deref(),
            Some("csi-data-volume-claim-abc123-0")
        );
        assert_eq!(
            pvcs[0].metadata.labels.as_ref().unwrap()["external-id"],
            "abc123"
        );
    }

    #[test]
    fn test_staging_and_csi_volumes_are_disjoint() {
        let job = sample_job("abc123", "alice");
        let labels = labels_for(&job);
        let mounts = plan_csi_mounts(&job).unwrap();

        let staging: Vec<String> = pod_volumes(&labels, None).into_iter().map(|v| v.name).collect();
        let csi: Vec<String> = pod_volumes(&labels, Some(&mounts))
            .into_iter()
            .map(|v| v.name)
            .collect();

        assert_eq!(staging, vec!["input-files", "excludes-file", "input-path-list"]);
        assert!(csi.iter().all(|name| !staging.contains(name)));
    }
}
