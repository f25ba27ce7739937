use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;

use crate::default_attr_func;
use crate::namespace_key_func;
use crate::AttrFunc;
use crate::KeyFunc;
use crate::Object;
use crate::ObjectMeta;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSpec {
    #[serde(default)]
    pub node_name: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub replicas: u32,
}

/// Minimal namespaced object used across the test suites
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pod {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: PodSpec,
}

impl Object for Pod {
    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

pub fn make_pod(
    namespace: &str,
    name: &str,
) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: name.to_string(),
            namespace: namespace.to_string(),
            uid: format!("uid-{namespace}-{name}"),
            ..Default::default()
        },
        spec: PodSpec {
            image: "nginx".to_string(),
            ..Default::default()
        },
    }
}

pub fn pod_with_rv(
    namespace: &str,
    name: &str,
    resource_version: u64,
) -> Pod {
    let mut pod = make_pod(namespace, name);
    pod.metadata.resource_version = resource_version.to_string();
    pod
}

pub fn labeled_pod(
    namespace: &str,
    name: &str,
    labels: &[(&str, &str)],
) -> Pod {
    let mut pod = make_pod(namespace, name);
    for (k, v) in labels {
        pod.metadata.labels.insert(k.to_string(), v.to_string());
    }
    pod
}

pub fn pod_key_func() -> KeyFunc<Pod> {
    namespace_key_func("/pods")
}

/// Default attributes plus `spec.nodeName`
pub fn pod_attrs() -> AttrFunc<Pod> {
    let base = default_attr_func::<Pod>();
    Arc::new(move |pod: &Pod| {
        let (labels, mut fields) = base(pod)?;
        fields.insert("spec.nodeName".to_string(), pod.spec.node_name.clone());
        Ok((labels, fields))
    })
}
