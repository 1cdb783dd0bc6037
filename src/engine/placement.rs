use log::debug;

use commissioner_api::{
    error::{CommissionError, PlatformFault, ReportError, ResourceExhaustionError},
    ObjectId,
};

use crate::platform::{Cluster, Datastore, Host, PlatformClient};

/// Where a new appliance VM goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub host: ObjectId,
    pub datastore: ObjectId,
    pub resource_pool: ObjectId,
}

/// Chooses a datastore for an appliance on `host`.
///
/// With several active hosts in the cluster, the appliance must live on a datastore shared by all
/// of them; the one with most free space wins. With a single active host, any datastore of that
/// host with at least `min_free_bytes` free is acceptable.
pub fn resolve(
    platform: &dyn PlatformClient,
    cluster: &Cluster,
    cluster_hosts: &[Host],
    host: &Host,
    min_free_bytes: u64,
) -> Result<Placement, CommissionError> {
    let mut active: Vec<&Host> = cluster_hosts.iter().filter(|h| h.is_active()).collect();
    if !active.iter().any(|h| h.id == host.id) {
        active.push(host);
    }

    let candidates = platform
        .datastores(&host.datastores)
        .structured(PlatformFault::Query {
            kind: "datastores of host".into(),
            name: host.name.clone(),
        })?;

    let chosen = if active.len() > 1 {
        pick(candidates.iter().filter(|ds| {
            ds.multiple_host_access && active.iter().all(|h| ds.hosts.contains(&h.id))
        }))
        .structured(ResourceExhaustionError::NoSharedDatastore {
            cluster: cluster.name.clone(),
        })?
    } else {
        pick(
            candidates
                .iter()
                .filter(|ds| ds.free_space >= min_free_bytes),
        )
        .structured(ResourceExhaustionError::NoLocalDatastore {
            host: host.name.clone(),
            required: min_free_bytes,
        })?
    };

    debug!(
        "Placing appliance on host '{}' with datastore '{}' ({} bytes free)",
        host.name, chosen.name, chosen.free_space
    );
    Ok(Placement {
        host: host.id.clone(),
        datastore: chosen.id.clone(),
        resource_pool: cluster.resource_pool.clone(),
    })
}

fn pick<'a>(datastores: impl Iterator<Item = &'a Datastore>) -> Option<&'a Datastore> {
    datastores
        .filter(|ds| ds.accessible)
        .max_by_key(|ds| ds.free_space)
}

#[cfg(test)]
mod tests {
    use commissioner_api::error::ErrorKind;

    use super::*;
    use crate::platform::{
        simulator::{fixtures, SimulatedPlatform},
        Inventory,
    };

    #[test]
    fn test_shared_datastore_for_multiple_hosts() {
        let platform = SimulatedPlatform::new(fixtures::cluster(3));
        let cluster = platform.cluster("domain-c7").unwrap().unwrap();
        let hosts = platform.hosts("domain-c7").unwrap();

        let placement = resolve(&platform, &cluster, &hosts, &hosts[1], 0).unwrap();
        assert_eq!(
            placement,
            Placement {
                host: "host-2".into(),
                datastore: "datastore-shared".into(),
                resource_pool: "resgroup-8".into(),
            }
        );
    }

    #[test]
    fn test_local_datastore_for_single_host() {
        let platform = SimulatedPlatform::new(fixtures::cluster(1));
        platform.with_inventory(|inv| {
            inv.datastores
                .iter_mut()
                .find(|ds| ds.id == "datastore-shared")
                .unwrap()
                .free_space = 10;
        });
        let cluster = platform.cluster("domain-c7").unwrap().unwrap();
        let hosts = platform.hosts("domain-c7").unwrap();

        let placement =
            resolve(&platform, &cluster, &hosts, &hosts[0], 40 * fixtures::GIB).unwrap();
        assert_eq!(placement.datastore, "datastore-local-1");

        let err = resolve(&platform, &cluster, &hosts, &hosts[0], 100 * fixtures::GIB).unwrap_err();
        assert_eq!(
            err.kind(),
            &ErrorKind::ResourceExhaustion(ResourceExhaustionError::NoLocalDatastore {
                host: "esx1.example.com".into(),
                required: 100 * fixtures::GIB,
            })
        );
    }

    #[test]
    fn test_no_shared_datastore() {
        let platform = SimulatedPlatform::new(fixtures::cluster(2));
        platform.with_inventory(|inv| {
            inv.datastores
                .iter_mut()
                .find(|ds| ds.id == "datastore-shared")
                .unwrap()
                .accessible = false;
        });
        let cluster = platform.cluster("domain-c7").unwrap().unwrap();
        let hosts = platform.hosts("domain-c7").unwrap();

        let err = resolve(&platform, &cluster, &hosts, &hosts[0], 0).unwrap_err();
        assert_eq!(err.category(), "resource-exhaustion");
    }

    #[test]
    fn test_maintenance_hosts_do_not_count() {
        let platform = SimulatedPlatform::new(fixtures::cluster(2));
        platform.with_inventory(|inv| inv.hosts[1].in_maintenance_mode = true);
        let cluster = platform.cluster("domain-c7").unwrap().unwrap();
        let hosts = platform.hosts("domain-c7").unwrap();

        // Only host-1 is active, so its local datastore (60 GiB free) is acceptable, but the
        // shared one has more space.
        let placement = resolve(&platform, &cluster, &hosts, &hosts[0], 40 * fixtures::GIB).unwrap();
        assert_eq!(placement.datastore, "datastore-shared");
    }
}
