use ceph_cluster::api::v1::{
    cephcluster::CephCluster,
    luascript::CephLuaScript,
    notifications::{CephBucketNotification, CephBucketTopic},
    object::{CephObjectRealm, CephObjectZoneGroup},
    pools::{CephBlockPool, CephFilesystem, CephObjectStore},
};
use kube::CustomResourceExt as _;

fn main() -> Result<(), serde_yaml::Error> {
    let crds = [
        CephCluster::crd(),
        CephBlockPool::crd(),
        CephFilesystem::crd(),
        CephObjectStore::crd(),
        CephObjectRealm::crd(),
        CephObjectZoneGroup::crd(),
        CephBucketTopic::crd(),
        CephBucketNotification::crd(),
        CephLuaScript::crd(),
    ];
    let docs = crds
        .iter()
        .map(serde_yaml::to_string)
        .collect::<Result<Vec<_>, _>>()?;
    print!("{}", docs.join("---\n"));
    Ok(())
}
