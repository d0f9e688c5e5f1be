//! Building the JSON patch which injects `kvinject-init` into a pod.
//!
//! We edit a working copy of the pod spec step by step, and then emit each
//! patch operation from the finished working copy. That way the container
//! list we send back always includes the volume mounts we added.

use std::collections::BTreeMap;

use json_patch::{AddOperation, PatchOperation, ReplaceOperation};
use jsonptr::PointerBuf;
use k8s_openapi::{
    api::core::v1::{
        Container, EmptyDirVolumeSource, Pod, PodSpec, ResourceRequirements, Volume,
        VolumeMount,
    },
    apimachinery::pkg::api::resource::Quantity,
};
use kvinject_common::{prelude::*, serde_json};

use crate::{config::InjectorConfig, decision::Injection};

/// The name of the in-memory volume holding our secrets.
pub const SECRETS_VOLUME: &str = "vault-secrets";

/// Where the secrets volume is mounted in every container.
pub const SECRETS_MOUNT_PATH: &str = "/var/run/secrets/vault";

/// The name of the init container we add.
pub const INIT_CONTAINER_NAME: &str = "vault-init";

/// Emptydir medium which keeps the volume in RAM.
const MEMORY_MEDIUM: &str = "Memory";

/// Build the patch operations which inject secrets into `pod`, in the order
/// they must be applied.
pub fn build_patch(
    pod: &Pod,
    injection: &Injection,
    config: &InjectorConfig,
) -> serde_json::Result<Vec<PatchOperation>> {
    let original = pod.spec.clone().unwrap_or_default();

    // Placeholders are read from the containers as the user wrote them.
    let mappings = placeholder_mappings(&original);
    debug!(
        "found {} secret placeholders in pod {:?}",
        mappings.len(),
        pod.metadata.name,
    );

    let mut working = original;
    let volumes = working.volumes.get_or_insert_with(Vec::new);
    volumes.push(secrets_volume());
    for container in &mut working.containers {
        container
            .volume_mounts
            .get_or_insert_with(Vec::new)
            .push(secrets_mount(true));
    }
    let init_containers = working.init_containers.get_or_insert_with(Vec::new);
    init_containers.push(init_container(&mappings, injection, config));

    Ok(vec![
        PatchOperation::Add(AddOperation {
            path: spec_pointer("volumes"),
            value: serde_json::to_value(&working.volumes)?,
        }),
        PatchOperation::Replace(ReplaceOperation {
            path: spec_pointer("containers"),
            value: serde_json::to_value(&working.containers)?,
        }),
        PatchOperation::Add(AddOperation {
            path: spec_pointer("initContainers"),
            value: serde_json::to_value(&working.init_containers)?,
        }),
    ])
}

/// Collect secret placeholders from the environment of every regular
/// container, in declaration order.
pub fn placeholder_mappings(spec: &PodSpec) -> Vec<SecretMapping> {
    spec.containers
        .iter()
        .flat_map(|container| container.env.iter().flatten())
        .filter_map(|env| {
            let value = env.value.as_deref()?;
            SecretMapping::from_placeholder(&env.name, value)
        })
        .collect()
}

/// Build the arguments for `kvinject-init`.
pub fn init_args(mappings: &[SecretMapping], address: &str, role: &str) -> Vec<String> {
    let mut args = mappings
        .iter()
        .map(|mapping| format!("--secret={}", mapping))
        .collect::<Vec<_>>();
    args.push(format!("--address={}", address));
    args.push(format!("--role={}", role));
    args
}

/// A pointer to a field of `/spec`.
fn spec_pointer(field: &str) -> PointerBuf {
    PointerBuf::from_tokens(["spec", field])
}

/// The in-memory volume we share between `kvinject-init` and the workload.
fn secrets_volume() -> Volume {
    Volume {
        name: SECRETS_VOLUME.to_owned(),
        empty_dir: Some(EmptyDirVolumeSource {
            medium: Some(MEMORY_MEDIUM.to_owned()),
            ..EmptyDirVolumeSource::default()
        }),
        ..Volume::default()
    }
}

/// A mount of our secrets volume.
fn secrets_mount(read_only: bool) -> VolumeMount {
    VolumeMount {
        name: SECRETS_VOLUME.to_owned(),
        mount_path: SECRETS_MOUNT_PATH.to_owned(),
        read_only: Some(read_only),
        ..VolumeMount::default()
    }
}

/// The container which fetches our secrets before the workload starts.
fn init_container(
    mappings: &[SecretMapping],
    injection: &Injection,
    config: &InjectorConfig,
) -> Container {
    let address = injection.store_address_or(&config.default_address);
    let resources = |cpu: &str, memory: &str| -> BTreeMap<String, Quantity> {
        let mut list = BTreeMap::new();
        list.insert("cpu".to_owned(), Quantity(cpu.to_owned()));
        list.insert("memory".to_owned(), Quantity(memory.to_owned()));
        list
    };
    Container {
        name: INIT_CONTAINER_NAME.to_owned(),
        image: Some(config.init_image.clone()),
        image_pull_policy: Some(config.image_pull_policy.clone()),
        args: Some(init_args(mappings, address, &injection.role)),
        resources: Some(ResourceRequirements {
            requests: Some(resources(&config.cpu_request, &config.memory_request)),
            limits: Some(resources(&config.cpu_limit, &config.memory_limit)),
            ..ResourceRequirements::default()
        }),
        volume_mounts: Some(vec![secrets_mount(false)]),
        ..Container::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    /// A pod with two containers, one of which asks for a secret.
    fn two_container_pod() -> Pod {
        serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": { "name": "billing" },
            "spec": {
                "containers": [
                    {
                        "name": "app",
                        "image": "billing:1.0",
                        "env": [
                            { "name": "LOG_LEVEL", "value": "debug" },
                            { "name": "PGPASSWORD", "value": "vault:/secret/sql:password" }
                        ]
                    },
                    {
                        "name": "proxy",
                        "image": "proxy:1.0",
                        "volumeMounts": [
                            { "name": "config", "mountPath": "/etc/proxy" }
                        ]
                    }
                ],
                "volumes": [
                    { "name": "config", "configMap": { "name": "proxy-config" } }
                ]
            }
        }))
        .expect("invalid test pod")
    }

    fn injection() -> Injection {
        Injection {
            role: "billing".to_owned(),
            store_address: None,
        }
    }

    fn patch_json(pod: &Pod, injection: &Injection) -> Vec<Value> {
        let ops = build_patch(pod, injection, &InjectorConfig::for_tests()).unwrap();
        match serde_json::to_value(&ops).unwrap() {
            Value::Array(ops) => ops,
            other => panic!("patch is not an array: {}", other),
        }
    }

    #[test]
    fn emits_three_operations_in_order() {
        let ops = patch_json(&two_container_pod(), &injection());
        assert_eq!(ops.len(), 3);
        assert_eq!((&ops[0]["op"], &ops[0]["path"]), (&json!("add"), &json!("/spec/volumes")));
        assert_eq!(
            (&ops[1]["op"], &ops[1]["path"]),
            (&json!("replace"), &json!("/spec/containers"))
        );
        assert_eq!(
            (&ops[2]["op"], &ops[2]["path"]),
            (&json!("add"), &json!("/spec/initContainers"))
        );
    }

    #[test]
    fn keeps_existing_volumes_and_adds_memory_volume() {
        let ops = patch_json(&two_container_pod(), &injection());
        assert_eq!(
            ops[0]["value"],
            json!([
                { "name": "config", "configMap": { "name": "proxy-config" } },
                { "name": SECRETS_VOLUME, "emptyDir": { "medium": "Memory" } }
            ])
        );
    }

    #[test]
    fn every_container_gets_a_read_only_mount() {
        let ops = patch_json(&two_container_pod(), &injection());
        let containers = ops[1]["value"].as_array().unwrap();
        assert_eq!(containers.len(), 2);
        for container in containers {
            let mounts = container["volumeMounts"].as_array().unwrap();
            assert_eq!(
                mounts.last().unwrap(),
                &json!({
                    "name": SECRETS_VOLUME,
                    "mountPath": SECRETS_MOUNT_PATH,
                    "readOnly": true
                })
            );
        }
        // Existing mounts survive.
        assert_eq!(containers[1]["volumeMounts"][0]["name"], json!("config"));
        // So do untouched fields.
        assert_eq!(containers[0]["env"][0]["value"], json!("debug"));
    }

    #[test]
    fn init_container_runs_materializer() {
        let ops = patch_json(&two_container_pod(), &injection());
        let init_containers = ops[2]["value"].as_array().unwrap();
        assert_eq!(init_containers.len(), 1);
        let init = &init_containers[0];
        assert_eq!(init["name"], json!(INIT_CONTAINER_NAME));
        assert_eq!(init["image"], json!("kvinject/kvinject-init:test"));
        assert_eq!(
            init["args"],
            json!([
                "--secret=PGPASSWORD:/secret/sql:password",
                "--address=http://vault:8200",
                "--role=billing"
            ])
        );
        assert_eq!(
            init["volumeMounts"],
            json!([{ "name": SECRETS_VOLUME, "mountPath": SECRETS_MOUNT_PATH, "readOnly": false }])
        );
        assert_eq!(init["resources"]["requests"], json!({ "cpu": "100m", "memory": "64Mi" }));
        assert_eq!(init["resources"]["limits"], json!({ "cpu": "200m", "memory": "128Mi" }));

        let args = init["args"].as_array().unwrap();
        let count = |prefix: &str| {
            args.iter()
                .filter(|arg| arg.as_str().unwrap().starts_with(prefix))
                .count()
        };
        assert_eq!(count("--secret="), 1);
        assert_eq!(count("--address="), 1);
    }

    #[test]
    fn address_override_reaches_init_container() {
        let injection = Injection {
            role: "billing".to_owned(),
            store_address: Some("https://vault.other:8200".to_owned()),
        };
        let ops = patch_json(&two_container_pod(), &injection);
        let args = &ops[2]["value"][0]["args"];
        assert_eq!(args[1], json!("--address=https://vault.other:8200"));
    }

    #[test]
    fn appends_to_existing_init_containers() {
        let mut pod = two_container_pod();
        pod.spec.as_mut().unwrap().init_containers = Some(vec![Container {
            name: "migrate".to_owned(),
            image: Some("billing-migrate:1.0".to_owned()),
            env: Some(vec![k8s_openapi::api::core::v1::EnvVar {
                name: "IGNORED".to_owned(),
                value: Some("vault:/secret/init:key".to_owned()),
                ..Default::default()
            }]),
            ..Container::default()
        }]);
        let ops = patch_json(&pod, &injection());
        let init_containers = ops[2]["value"].as_array().unwrap();
        assert_eq!(init_containers.len(), 2);
        assert_eq!(init_containers[0]["name"], json!("migrate"));
        assert_eq!(init_containers[1]["name"], json!(INIT_CONTAINER_NAME));
        // Init containers aren't scanned for placeholders.
        assert_eq!(init_containers[1]["args"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn placeholders_follow_declaration_order() {
        let spec: PodSpec = serde_json::from_value(json!({
            "containers": [
                {
                    "name": "a",
                    "env": [
                        { "name": "FIRST", "value": "vault:secret/a:one" },
                        { "name": "FROM_FIELD", "valueFrom": { "fieldRef": { "fieldPath": "metadata.name" } } },
                        { "name": "NOT_A_SECRET", "value": "vault:missing-key" }
                    ]
                },
                {
                    "name": "b",
                    "env": [
                        { "name": "SECOND", "value": "vault:secret/b:two" },
                        { "name": "FIRST", "value": "vault:secret/b:one" }
                    ]
                }
            ]
        }))
        .unwrap();
        let mappings = placeholder_mappings(&spec);
        let directives = mappings.iter().map(|m| m.to_string()).collect::<Vec<_>>();
        assert_eq!(
            directives,
            &["FIRST:secret/a:one", "SECOND:secret/b:two", "FIRST:secret/b:one"]
        );
    }

    #[test]
    fn pod_without_placeholders_still_gets_address_and_role() {
        assert_eq!(
            init_args(&[], "http://vault:8200", "billing"),
            &["--address=http://vault:8200", "--role=billing"]
        );
    }
}
