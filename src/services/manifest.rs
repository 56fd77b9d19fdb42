//! 清单渲染
//!
//! 纯函数：相同输入产生逐字节相同的 YAML

use std::collections::BTreeMap;
use thiserror::Error;

use crate::domain::deploy::{DeployRequest, WorkloadKind};
use crate::domain::manifest::{
    Container, ContainerPort, EnvVar, LabelSelector, Manifest, ObjectMeta, PodSpec, PodTemplate,
    Probe, Resource, ServicePort, ServiceSpec, TcpSocketAction, TemplateMeta, WorkloadSpec,
};

/// 渲染时使用的集群默认值
#[derive(Clone, Debug)]
pub struct ManifestDefaults {
    pub default_namespace: String,
    pub max_replicas: u32,
}

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to serialize manifest: {0}")]
    Serialize(#[from] serde_yaml::Error),
}

/// Service 名称
pub fn service_name(app_name: &str) -> String {
    format!("{}-svc", app_name)
}

/// 渲染工作负载与 Service 清单
pub fn render(
    request: &DeployRequest,
    image_reference: &str,
    defaults: &ManifestDefaults,
) -> Result<Manifest, ManifestError> {
    let app_name = request.app_name.trim();
    let namespace = request.namespace_or(&defaults.default_namespace).to_string();
    let replicas = request.replica_count.clamp(1, defaults.max_replicas.max(1));
    let port = request.container_port.clamp(1, u16::MAX as u32) as u16;

    let labels: BTreeMap<String, String> =
        BTreeMap::from([("app".to_string(), app_name.to_string())]);
    let svc_name = request
        .service_exposure
        .creates_service()
        .then(|| service_name(app_name));

    let workload = Resource {
        api_version: "apps/v1".to_string(),
        kind: request.workload_kind.as_str().to_string(),
        metadata: ObjectMeta {
            name: app_name.to_string(),
            namespace: namespace.clone(),
            labels: labels.clone(),
        },
        spec: WorkloadSpec {
            replicas,
            service_name: match request.workload_kind {
                WorkloadKind::StatefulSet => Some(svc_name.clone().unwrap_or_else(|| app_name.to_string())),
                WorkloadKind::Deployment => None,
            },
            selector: LabelSelector {
                match_labels: labels.clone(),
            },
            template: PodTemplate {
                metadata: TemplateMeta {
                    labels: labels.clone(),
                },
                spec: PodSpec {
                    containers: vec![Container {
                        name: app_name.to_string(),
                        image: image_reference.to_string(),
                        ports: vec![ContainerPort {
                            container_port: port,
                            protocol: "TCP".to_string(),
                        }],
                        env: vec![EnvVar {
                            name: "PORT".to_string(),
                            value: port.to_string(),
                        }],
                        readiness_probe: Probe {
                            tcp_socket: TcpSocketAction { port },
                            initial_delay_seconds: 2,
                            period_seconds: 5,
                        },
                    }],
                },
            },
        },
    };

    let mut documents = vec![serde_yaml::to_string(&workload)?];

    if let Some(ref svc) = svc_name {
        let service = Resource {
            api_version: "v1".to_string(),
            kind: "Service".to_string(),
            metadata: ObjectMeta {
                name: svc.clone(),
                namespace: namespace.clone(),
                labels: labels.clone(),
            },
            spec: ServiceSpec {
                service_type: request.service_exposure.as_str().to_string(),
                selector: labels,
                ports: vec![ServicePort {
                    port,
                    target_port: port,
                    protocol: "TCP".to_string(),
                }],
            },
        };
        documents.push(serde_yaml::to_string(&service)?);
    }

    Ok(Manifest {
        kind: request.workload_kind,
        namespace,
        workload_name: app_name.to_string(),
        service_name: svc_name,
        rendered_text: documents.join("---\n"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::deploy::ServiceExposure;
    use serde_yaml::Value;

    fn defaults() -> ManifestDefaults {
        ManifestDefaults {
            default_namespace: "default".to_string(),
            max_replicas: 10,
        }
    }

    fn request() -> DeployRequest {
        DeployRequest {
            app_name: "hello".to_string(),
            source_code: "print('hi')".to_string(),
            workload_kind: WorkloadKind::Deployment,
            replica_count: 2,
            service_exposure: ServiceExposure::ClusterIP,
            container_port: 5000,
            target_namespace: None,
        }
    }

    fn documents(manifest: &Manifest) -> Vec<Value> {
        manifest
            .rendered_text
            .split("---\n")
            .map(|doc| serde_yaml::from_str(doc).unwrap())
            .collect()
    }

    const IMAGE: &str = "docker.io/alice/hello:20240101000000-abcdef01";

    #[test]
    fn test_render_deployment_with_service() {
        let manifest = render(&request(), IMAGE, &defaults()).unwrap();
        assert_eq!(manifest.namespace, "default");
        assert_eq!(manifest.service_name.as_deref(), Some("hello-svc"));
        assert_eq!(
            manifest.resources(),
            vec!["deployment/hello".to_string(), "service/hello-svc".to_string()]
        );

        let docs = documents(&manifest);
        assert_eq!(docs.len(), 2);

        let workload = &docs[0];
        assert_eq!(workload["kind"], "Deployment");
        assert_eq!(workload["metadata"]["name"], "hello");
        assert_eq!(workload["metadata"]["namespace"], "default");
        assert_eq!(workload["spec"]["replicas"], 2);
        assert_eq!(workload["spec"]["selector"]["matchLabels"]["app"], "hello");
        let container = &workload["spec"]["template"]["spec"]["containers"][0];
        assert_eq!(container["image"], IMAGE);
        assert_eq!(container["ports"][0]["containerPort"], 5000);
        assert_eq!(container["readinessProbe"]["tcpSocket"]["port"], 5000);
        assert_eq!(container["env"][0]["name"], "PORT");

        let service = &docs[1];
        assert_eq!(service["kind"], "Service");
        assert_eq!(service["spec"]["type"], "ClusterIP");
        assert_eq!(service["spec"]["selector"]["app"], "hello");
        assert_eq!(service["spec"]["ports"][0]["targetPort"], 5000);
        assert!(service["spec"]["ports"][0].get("nodePort").is_none());
    }

    #[test]
    fn test_render_is_deterministic() {
        let first = render(&request(), IMAGE, &defaults()).unwrap();
        let second = render(&request(), IMAGE, &defaults()).unwrap();
        assert_eq!(first.rendered_text, second.rendered_text);
        assert_eq!(first, second);
    }

    #[test]
    fn test_render_without_service() {
        let mut req = request();
        req.service_exposure = ServiceExposure::None;
        let manifest = render(&req, IMAGE, &defaults()).unwrap();
        assert!(manifest.service_name.is_none());
        assert_eq!(documents(&manifest).len(), 1);
        assert_eq!(manifest.resources(), vec!["deployment/hello".to_string()]);
    }

    #[test]
    fn test_render_statefulset() {
        let mut req = request();
        req.workload_kind = WorkloadKind::StatefulSet;
        req.target_namespace = Some("apps".to_string());
        let manifest = render(&req, IMAGE, &defaults()).unwrap();

        let docs = documents(&manifest);
        assert_eq!(docs[0]["kind"], "StatefulSet");
        assert_eq!(docs[0]["spec"]["serviceName"], "hello-svc");
        assert_eq!(docs[0]["metadata"]["namespace"], "apps");
        assert_eq!(manifest.resources()[0], "statefulset/hello");
    }

    #[test]
    fn test_render_clamps_replicas() {
        let mut req = request();
        req.replica_count = 50;
        let docs = documents(&render(&req, IMAGE, &defaults()).unwrap());
        assert_eq!(docs[0]["spec"]["replicas"], 10);

        req.replica_count = 0;
        let docs = documents(&render(&req, IMAGE, &defaults()).unwrap());
        assert_eq!(docs[0]["spec"]["replicas"], 1);
    }
}
