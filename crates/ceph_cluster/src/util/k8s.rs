use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams, PostParams, PropagationPolicy},
    Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};
use std::{collections::BTreeMap, fmt::Debug};
use tracing::{debug, info};

use crate::util::errors::{Error, Result, StdError};

pub const FIELD_MANAGER: &str = "ceph-operator";

/// Label every operator managed object carries
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

pub fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

pub fn is_not_found(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(resp) if resp.code == 404)
}

pub fn is_conflict(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(resp) if resp.code == 409)
}

/// Controller owner reference for objects created on behalf of `owner`
pub fn owner_reference<K: Resource<DynamicType = ()>>(owner: &K) -> Result<OwnerReference> {
    owner.controller_owner_ref(&()).ok_or_else(|| {
        Error::StdError(StdError::MetadataMissing(format!(
            "{} has no uid yet",
            K::kind(&())
        )))
    })
}

/// Namespace of a namespaced object
pub fn namespace_of<K: ResourceExt>(obj: &K) -> Result<String> {
    obj.namespace().ok_or_else(|| {
        Error::StdError(StdError::MetadataMissing(format!(
            "{} has no namespace",
            obj.name_any()
        )))
    })
}

pub async fn get_opt<K>(api: &Api<K>, name: &str) -> Result<Option<K>>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug,
{
    match api.get(name).await {
        Ok(obj) => Ok(Some(obj)),
        Err(e) if is_not_found(&e) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Creates `desired` when absent; when present and `needs_update(existing, desired)` holds,
/// applies it with the operator's field manager
pub async fn create_or_update<K, F>(api: &Api<K>, desired: &K, needs_update: F) -> Result<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Serialize + Debug,
    F: Fn(&K, &K) -> bool,
{
    let name = desired.meta().name.clone().ok_or_else(|| {
        Error::StdError(StdError::MetadataMissing("desired object has no name".to_string()))
    })?;
    match api.get(&name).await {
        Ok(existing) => {
            if needs_update(&existing, desired) {
                info!("Updating {} '{}'", K::kind(&()), name);
                Ok(api
                    .patch(&name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(desired))
                    .await?)
            } else {
                debug!("{} '{}' is up to date", K::kind(&()), name);
                Ok(existing)
            }
        }
        Err(e) if is_not_found(&e) => {
            info!("Creating {} '{}'", K::kind(&()), name);
            Ok(api.create(&PostParams::default(), desired).await?)
        }
        Err(e) => Err(e.into()),
    }
}

/// Deletes `name`, treating a missing object as success. Returns whether anything was deleted.
pub async fn delete_if_exists<K>(api: &Api<K>, name: &str, params: &DeleteParams) -> Result<bool>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug,
{
    match api.delete(name, params).await {
        Ok(_) => {
            info!("Deleted {} '{}'", K::kind(&()), name);
            Ok(true)
        }
        Err(e) if is_not_found(&e) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Foreground deletion without a grace period
pub fn delete_now() -> DeleteParams {
    DeleteParams {
        grace_period_seconds: Some(0),
        propagation_policy: Some(PropagationPolicy::Foreground),
        ..Default::default()
    }
}

/// Scales a deployment through the scale subresource
pub async fn scale_deployment(
    api: &Api<k8s_openapi::api::apps::v1::Deployment>,
    name: &str,
    replicas: i32,
) -> Result<()> {
    let patch = serde_json::json!({ "spec": { "replicas": replicas } });
    api.patch_scale(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    info!("Scaled deployment '{}' to {}", name, replicas);
    Ok(())
}
