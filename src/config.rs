//! Static configuration
//!
//! Every setting has a long flag and a `VICE_*` environment variable. The
//! `Default` impl mirrors the clap defaults so tests can build a config
//! without parsing arguments.

use std::net::SocketAddr;
use std::time::Duration;

use clap::{ArgAction, Args};

/// Default namespace for analysis workloads
pub const DEFAULT_NAMESPACE: &str = "vice-apps";
/// Default staging image (init container and sidecar)
pub const DEFAULT_FILE_TRANSFERS_IMAGE: &str = "discoenv/vice-file-transfers:latest";
/// Default proxy image
pub const DEFAULT_PROXY_IMAGE: &str = "discoenv/vice-proxy:latest";
/// Default base domain for analysis hosts
pub const DEFAULT_VICE_DOMAIN: &str = "cyverse.run";
/// Default CAS base URL
pub const DEFAULT_CAS_BASE_URL: &str = "https://auth.cyverse.org/cas5";
/// Default analysis-id lookup endpoint used by the proxy
pub const DEFAULT_GET_ANALYSIS_ID_BASE: &str = "http://get-analysis-id";
/// Default resource-access endpoint used by the proxy
pub const DEFAULT_CHECK_RESOURCE_ACCESS_BASE: &str = "http://check-resource-access";
/// Default status tracker base URL
pub const DEFAULT_STATUS_BASE_URL: &str = "http://job-status-listener";
/// Default lookup service base URL
pub const DEFAULT_LOOKUP_BASE_URL: &str = "http://apps";
/// Default permission service base URL
pub const DEFAULT_PERMISSIONS_BASE_URL: &str = "http://permissions";
/// Default ingress class
pub const DEFAULT_INGRESS_CLASS: &str = "nginx";
/// Default suffix stripped from usernames in labels
pub const DEFAULT_USER_SUFFIX: &str = "@iplantcollaborative.org";
/// Default CSI driver
pub const DEFAULT_CSI_DRIVER: &str = "irods.csi.cyverse.org";
/// Default CSI storage class
pub const DEFAULT_CSI_STORAGE_CLASS: &str = "irods-sc";
/// Default CSI volume capacity
pub const DEFAULT_CSI_CAPACITY: &str = "5Gi";
/// Default per-user concurrency limit when the lookup service has none
pub const DEFAULT_JOB_LIMIT: i64 = 2;
/// Default delay between transfer status checks
pub const DEFAULT_TRANSFER_POLL_SECS: u64 = 5;
/// Default watch restart delay
pub const DEFAULT_WATCH_RESTART_SECS: u64 = 5;
/// Default number of finished tasks kept for inspection
pub const DEFAULT_TASK_HISTORY: usize = 256;
/// Default listen address for the HTTP surface
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:60000";
/// Default host name reported to the status tracker
pub const DEFAULT_HOSTNAME: &str = "vice";

/// Settings shared by every component.
#[derive(Args, Clone, Debug)]
pub struct ViceConfig {
    /// Namespace analyses run in
    #[arg(long, env = "VICE_NAMESPACE", default_value = DEFAULT_NAMESPACE)]
    pub namespace: String,

    /// Mount remote storage through the CSI driver instead of staging files
    #[arg(long, env = "VICE_USE_CSI_DRIVER", action = ArgAction::Set, default_value_t = false)]
    pub use_csi_driver: bool,

    /// Image for the input staging init container and sidecar
    #[arg(long, env = "VICE_FILE_TRANSFERS_IMAGE", default_value = DEFAULT_FILE_TRANSFERS_IMAGE)]
    pub file_transfers_image: String,

    /// Image for the authenticating proxy
    #[arg(long, env = "VICE_PROXY_IMAGE", default_value = DEFAULT_PROXY_IMAGE)]
    pub proxy_image: String,

    /// Base domain analysis hosts live under (`<subdomain>.<domain>`)
    #[arg(long, env = "VICE_DOMAIN", default_value = DEFAULT_VICE_DOMAIN)]
    pub vice_domain: String,

    /// CAS base URL handed to the proxy
    #[arg(long, env = "VICE_CAS_BASE_URL", default_value = DEFAULT_CAS_BASE_URL)]
    pub cas_base_url: String,

    /// Analysis-id endpoint handed to the proxy
    #[arg(long, env = "VICE_GET_ANALYSIS_ID_BASE", default_value = DEFAULT_GET_ANALYSIS_ID_BASE)]
    pub get_analysis_id_base: String,

    /// Resource-access endpoint handed to the proxy
    #[arg(long, env = "VICE_CHECK_RESOURCE_ACCESS_BASE", default_value = DEFAULT_CHECK_RESOURCE_ACCESS_BASE)]
    pub check_resource_access_base: String,

    /// Status tracker base URL
    #[arg(long, env = "VICE_STATUS_BASE_URL", default_value = DEFAULT_STATUS_BASE_URL)]
    pub status_base_url: String,

    /// Lookup service base URL
    #[arg(long, env = "VICE_LOOKUP_BASE_URL", default_value = DEFAULT_LOOKUP_BASE_URL)]
    pub lookup_base_url: String,

    /// Permission service base URL
    #[arg(long, env = "VICE_PERMISSIONS_BASE_URL", default_value = DEFAULT_PERMISSIONS_BASE_URL)]
    pub permissions_base_url: String,

    /// Ingress class for analysis ingresses
    #[arg(long, env = "VICE_INGRESS_CLASS", default_value = DEFAULT_INGRESS_CLASS)]
    pub ingress_class: String,

    /// Image pull secret attached to analysis pods
    #[arg(long, env = "VICE_IMAGE_PULL_SECRET")]
    pub image_pull_secret: Option<String>,

    /// Suffix stripped from usernames before labeling
    #[arg(long, env = "VICE_USER_SUFFIX", default_value = DEFAULT_USER_SUFFIX)]
    pub user_suffix: String,

    /// CSI driver name
    #[arg(long, env = "VICE_CSI_DRIVER", default_value = DEFAULT_CSI_DRIVER)]
    pub csi_driver: String,

    /// Storage class for CSI volumes and claims
    #[arg(long, env = "VICE_CSI_STORAGE_CLASS", default_value = DEFAULT_CSI_STORAGE_CLASS)]
    pub csi_storage_class: String,

    /// Capacity declared on CSI volumes and claims
    #[arg(long, env = "VICE_CSI_CAPACITY", default_value = DEFAULT_CSI_CAPACITY)]
    pub csi_capacity: String,

    /// Concurrency limit when neither the user nor the store has one
    #[arg(long, env = "VICE_DEFAULT_JOB_LIMIT", default_value_t = DEFAULT_JOB_LIMIT)]
    pub default_job_limit: i64,

    /// Seconds between transfer status checks
    #[arg(long, env = "VICE_TRANSFER_POLL_SECS", default_value_t = DEFAULT_TRANSFER_POLL_SECS)]
    pub transfer_poll_secs: u64,

    /// Maximum status checks per transfer (0 = unlimited)
    #[arg(long, env = "VICE_TRANSFER_MAX_ATTEMPTS", default_value_t = 0)]
    pub transfer_max_attempts: u32,

    /// Seconds to wait before restarting an ended deployment watch
    #[arg(long, env = "VICE_WATCH_RESTART_SECS", default_value_t = DEFAULT_WATCH_RESTART_SECS)]
    pub watch_restart_secs: u64,

    /// Finished background tasks kept for inspection
    #[arg(long, env = "VICE_TASK_HISTORY", default_value_t = DEFAULT_TASK_HISTORY)]
    pub task_history: usize,

    /// Address the HTTP surface listens on
    #[arg(long, env = "VICE_LISTEN_ADDR", default_value = DEFAULT_LISTEN_ADDR)]
    pub listen_addr: SocketAddr,

    /// Host name reported with status updates
    #[arg(long = "status-hostname", env = "HOSTNAME", default_value = DEFAULT_HOSTNAME)]
    pub hostname: String,
}

impl Default for ViceConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            use_csi_driver: false,
            file_transfers_image: DEFAULT_FILE_TRANSFERS_IMAGE.to_string(),
            proxy_image: DEFAULT_PROXY_IMAGE.to_string(),
            vice_domain: DEFAULT_VICE_DOMAIN.to_string(),
            cas_base_url: DEFAULT_CAS_BASE_URL.to_string(),
            get_analysis_id_base: DEFAULT_GET_ANALYSIS_ID_BASE.to_string(),
            check_resource_access_base: DEFAULT_CHECK_RESOURCE_ACCESS_BASE.to_string(),
            status_base_url: DEFAULT_STATUS_BASE_URL.to_string(),
            lookup_base_url: DEFAULT_LOOKUP_BASE_URL.to_string(),
            permissions_base_url: DEFAULT_PERMISSIONS_BASE_URL.to_string(),
            ingress_class: DEFAULT_INGRESS_CLASS.to_string(),
            image_pull_secret: None,
            user_suffix: DEFAULT_USER_SUFFIX.to_string(),
            csi_driver: DEFAULT_CSI_DRIVER.to_string(),
            csi_storage_class: DEFAULT_CSI_STORAGE_CLASS.to_string(),
            csi_capacity: DEFAULT_CSI_CAPACITY.to_string(),
            default_job_limit: DEFAULT_JOB_LIMIT,
            transfer_poll_secs: DEFAULT_TRANSFER_POLL_SECS,
            transfer_max_attempts: 0,
            watch_restart_secs: DEFAULT_WATCH_RESTART_SECS,
            task_history: DEFAULT_TASK_HISTORY,
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 60000)),
            hostname: DEFAULT_HOSTNAME.to_string(),
        }
    }
}

impl ViceConfig {
    /// Externally routable host for a subdomain token
    pub fn host_for(&self, subdomain: &str) -> String {
        if self.vice_domain.is_empty() {
            subdomain.to_string()
        } else {
            format!("{}.{}", subdomain, self.vice_domain)
        }
    }

    /// Frontend URL the proxy redirects to after login
    pub fn frontend_url(&self, subdomain: &str) -> String {
        format!("https://{}", self.host_for(subdomain))
    }

    /// Delay between transfer status checks
    pub fn transfer_poll_interval(&self) -> Duration {
        Duration::from_secs(self.transfer_poll_secs)
    }

    /// Delay before restarting an ended watch
    pub fn watch_restart_delay(&self) -> Duration {
        Duration::from_secs(self.watch_restart_secs)
    }
}
