//! OwnerReference helpers, after apimachinery's controller_ref.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::Resource;

/// Returns the controlling owner reference of `resource`, if any.
pub fn controller_of<T: Resource>(resource: &T) -> Option<&OwnerReference> {
    resource
        .meta()
        .owner_references
        .as_deref()
        .unwrap_or_default()
        .iter()
        .find(|owner| matches!(owner.controller, Some(true)))
}

/// True when the controller of `resource` is an object of kind `kind`.
pub fn is_controlled_by_kind<T: Resource>(resource: &T, kind: &str) -> bool {
    matches!(controller_of(resource), Some(owner) if owner.kind == kind)
}

/// Controller reference pointing at `owner`, as set on objects it creates.
/// Missing name or uid become empty strings; the store rejects those.
pub fn controller_ref<K>(owner: &K) -> OwnerReference
where
    K: Resource<DynamicType = ()>,
{
    let meta = owner.meta();
    OwnerReference {
        api_version: K::api_version(&()).into_owned(),
        kind: K::kind(&()).into_owned(),
        name: meta.name.clone().unwrap_or_default(),
        uid: meta.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}
