//! Service and ingress routing traffic to the proxy

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use super::{
    service_name, PROXY_PORT, PROXY_PORT_NAME, SERVICE_PROXY_PORT, STAGING_PORT,
    STAGING_PORT_NAME,
};
use crate::config::ViceConfig;
use crate::labels::{JobLabels, LABEL_EXTERNAL_ID};

fn service_port(name: &str, port: i32, target: i32) -> ServicePort {
    ServicePort {
        name: Some(name.to_string()),
        protocol: Some("TCP".to_string()),
        port,
        target_port: Some(IntOrString::Int(target)),
        ..Default::default()
    }
}

/// Service exposing the proxy and, in staging mode, the sidecar.
pub(crate) fn service(labels: &JobLabels, config: &ViceConfig, staging: bool) -> Service {
    let mut ports = Vec::with_capacity(2);
    if staging {
        ports.push(service_port(STAGING_PORT_NAME, STAGING_PORT, STAGING_PORT));
    }
    ports.push(service_port(PROXY_PORT_NAME, SERVICE_PROXY_PORT, PROXY_PORT));

    Service {
        metadata: ObjectMeta {
            name: Some(service_name(&labels.external_id)),
            namespace: Some(config.namespace.clone()),
            labels: Some(labels.to_map()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(BTreeMap::from([(
                LABEL_EXTERNAL_ID.to_string(),
                labels.external_id.as_str().to_string(),
            )])),
            ports: Some(ports),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Ingress for `<subdomain>.<domain>`; the default path and the default
/// backend both go to the service's proxy port.
pub(crate) fn ingress(labels: &JobLabels, config: &ViceConfig) -> Ingress {
    let backend = IngressBackend {
        service: Some(IngressServiceBackend {
            name: service_name(&labels.external_id),
            port: Some(ServiceBackendPort {
                number: Some(SERVICE_PROXY_PORT),
                ..Default::default()
            }),
        }),
        ..Default::default()
    };

    Ingress {
        metadata: ObjectMeta {
            name: Some(labels.subdomain.clone()),
            namespace: Some(config.namespace.clone()),
            labels: Some(labels.to_map()),
            ..Default::default()
        },
        spec: Some(IngressSpec {
            ingress_class_name: Some(config.ingress_class.clone()),
            default_backend: Some(backend.clone()),
            rules: Some(vec![IngressRule {
                host: Some(config.host_for(&labels.subdomain)),
                http: Some(HTTPIngressRuleValue {
                    paths: vec![HTTPIngressPath {
                        path: Some("/".to_string()),
                        path_type: "Prefix".to_string(),
                        backend,
                    }],
                }),
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}
