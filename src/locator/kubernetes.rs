//! Kubernetes-backed discovery of Prometheus backends.
//!
//! Two modes share one locator: service mode enumerates the ready addresses
//! of a named service's `Endpoints` object, pod mode lists pods matching a
//! `k=v` label selector. Both apply the same port-picking rule: prefer a TCP
//! port whose name or number matches the configured `port`, else take the
//! first TCP port.

use std::path::Path;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ContainerPort, EndpointPort, Endpoints, Pod};
use kube::api::{Api, ListParams};
use kube::config::{Config, KubeConfigOptions, Kubeconfig};

use super::{Locator, LocatorError, PrometheusEndpoint, to_prometheus_clients};

pub struct KubernetesLocator {
    kube: kube::Client,
    http: reqwest::Client,
    namespace: String,
    service_name: Option<String>,
    label_selector: Option<String>,
    port: PortSelector,
}

/// The configured `--kube-port` value, matched against port names and
/// numbers alike.
#[derive(Debug, Clone, Default)]
struct PortSelector {
    raw: Option<String>,
    number: Option<i32>,
}

impl PortSelector {
    fn new(port: Option<String>) -> Self {
        let number = port.as_deref().and_then(|p| p.parse().ok());
        Self { raw: port, number }
    }

    fn matches(&self, name: Option<&str>, number: i32) -> bool {
        match &self.raw {
            // No selector configured: the first TCP port wins.
            None => true,
            Some(raw) => name == Some(raw.as_str()) || self.number == Some(number),
        }
    }
}

fn is_tcp(protocol: Option<&str>) -> bool {
    protocol.is_none_or(|p| p == "TCP")
}

impl KubernetesLocator {
    /// Build a locator talking to the cluster described by `kubeconfig`, or
    /// to the ambient (in-cluster or local) configuration when absent.
    pub async fn new(
        http: reqwest::Client,
        kubeconfig: Option<&Path>,
        namespace: impl Into<String>,
        service_name: Option<String>,
        label_selector: Option<String>,
        port: Option<String>,
    ) -> Result<Self, LocatorError> {
        let config = match kubeconfig {
            Some(path) => {
                let kubeconfig =
                    Kubeconfig::read_from(path).map_err(|err| LocatorError::KubeConfig {
                        reason: err.to_string(),
                    })?;
                Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .map_err(|err| LocatorError::KubeConfig {
                        reason: err.to_string(),
                    })?
            }
            None => Config::infer()
                .await
                .map_err(|err| LocatorError::KubeConfig {
                    reason: err.to_string(),
                })?,
        };
        let kube = kube::Client::try_from(config).map_err(LocatorError::Kubernetes)?;
        Ok(Self {
            kube,
            http,
            namespace: namespace.into(),
            service_name,
            label_selector,
            port: PortSelector::new(port),
        })
    }

    async fn service_urls(&self, service_name: &str) -> Result<Vec<String>, LocatorError> {
        let api: Api<Endpoints> = Api::namespaced(self.kube.clone(), &self.namespace);
        let endpoints = api.get(service_name).await?;

        let mut urls = Vec::new();
        // Only the first subset is consulted.
        if let Some(subset) = endpoints.subsets.as_deref().and_then(<[_]>::first) {
            let port = pick_endpoint_port(subset.ports.as_deref().unwrap_or_default(), &self.port);
            for address in subset.addresses.as_deref().unwrap_or_default() {
                urls.push(format!("http://{}:{}", address.ip, port));
            }
        }
        Ok(urls)
    }

    async fn pod_urls(&self, label_selector: &str) -> Result<Vec<String>, LocatorError> {
        let api: Api<Pod> = Api::namespaced(self.kube.clone(), &self.namespace);
        let pods = api
            .list(&ListParams::default().labels(label_selector))
            .await?;

        let mut urls = Vec::new();
        for pod in pods {
            let ports = pod
                .spec
                .iter()
                .flat_map(|spec| spec.containers.iter())
                .flat_map(|container| container.ports.iter().flatten());
            let port = pick_container_port(ports, &self.port);
            let pod_ip = pod
                .status
                .as_ref()
                .and_then(|status| status.pod_ip.as_deref())
                .unwrap_or_default();
            urls.push(format!("http://{pod_ip}:{port}"));
        }
        Ok(urls)
    }
}

/// Pick one TCP port from a service endpoint subset.
fn pick_endpoint_port(ports: &[EndpointPort], selector: &PortSelector) -> i32 {
    ports
        .iter()
        .filter(|p| is_tcp(p.protocol.as_deref()))
        .find(|p| selector.matches(p.name.as_deref(), p.port))
        .map_or(0, |p| p.port)
}

/// Pick one TCP container port across a pod's containers.
fn pick_container_port<'a>(
    ports: impl Iterator<Item = &'a ContainerPort>,
    selector: &PortSelector,
) -> i32 {
    ports
        .filter(|p| is_tcp(p.protocol.as_deref()))
        .find(|p| selector.matches(p.name.as_deref(), p.container_port))
        .map_or(0, |p| p.container_port)
}

#[async_trait]
impl Locator for KubernetesLocator {
    async fn endpoints(&self) -> Result<Vec<PrometheusEndpoint>, LocatorError> {
        let urls = match (&self.service_name, &self.label_selector) {
            (Some(service_name), _) => self.service_urls(service_name).await?,
            (None, Some(label_selector)) => self.pod_urls(label_selector).await?,
            (None, None) => Vec::new(),
        };
        to_prometheus_clients(&self.http, &urls).await
    }

    fn describe(&self) -> String {
        match (&self.service_name, &self.label_selector) {
            (Some(service), _) => format!(
                "kubernetes{{namespace: {}, service: {service}}}",
                self.namespace
            ),
            (_, Some(selector)) => format!(
                "kubernetes{{namespace: {}, selector: {selector}}}",
                self.namespace
            ),
            _ => format!("kubernetes{{namespace: {}}}", self.namespace),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint_port(name: Option<&str>, port: i32, protocol: Option<&str>) -> EndpointPort {
        EndpointPort {
            name: name.map(str::to_string),
            port,
            protocol: protocol.map(str::to_string),
            app_protocol: None,
        }
    }

    fn container_port(name: Option<&str>, port: i32, protocol: Option<&str>) -> ContainerPort {
        ContainerPort {
            container_port: port,
            name: name.map(str::to_string),
            protocol: protocol.map(str::to_string),
            host_ip: None,
            host_port: None,
        }
    }

    #[test]
    fn test_pick_endpoint_port_prefers_name_match() {
        let ports = vec![
            endpoint_port(Some("metrics"), 8080, Some("TCP")),
            endpoint_port(Some("web"), 9090, Some("TCP")),
        ];
        let selector = PortSelector::new(Some("web".to_string()));
        assert_eq!(pick_endpoint_port(&ports, &selector), 9090);
    }

    #[test]
    fn test_pick_endpoint_port_matches_by_number() {
        let ports = vec![
            endpoint_port(Some("metrics"), 8080, Some("TCP")),
            endpoint_port(None, 9090, Some("TCP")),
        ];
        let selector = PortSelector::new(Some("9090".to_string()));
        assert_eq!(pick_endpoint_port(&ports, &selector), 9090);
    }

    #[test]
    fn test_pick_endpoint_port_defaults_to_first_tcp() {
        let ports = vec![
            endpoint_port(Some("dns"), 53, Some("UDP")),
            endpoint_port(Some("web"), 9090, Some("TCP")),
            endpoint_port(Some("metrics"), 8080, Some("TCP")),
        ];
        assert_eq!(pick_endpoint_port(&ports, &PortSelector::default()), 9090);
    }

    #[test]
    fn test_pick_endpoint_port_unmatched_is_zero() {
        let ports = vec![endpoint_port(Some("web"), 9090, Some("UDP"))];
        assert_eq!(pick_endpoint_port(&ports, &PortSelector::default()), 0);
    }

    #[test]
    fn test_pick_container_port_applies_same_rule() {
        let ports = vec![
            container_port(Some("dns"), 53, Some("UDP")),
            container_port(Some("metrics"), 8080, None),
        ];
        let selector = PortSelector::new(Some("metrics".to_string()));
        assert_eq!(pick_container_port(ports.iter(), &selector), 8080);
    }

    #[test]
    fn test_missing_protocol_counts_as_tcp() {
        let ports = vec![endpoint_port(None, 9090, None)];
        assert_eq!(pick_endpoint_port(&ports, &PortSelector::default()), 9090);
    }
}
