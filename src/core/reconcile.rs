//! Resource reconciler - Orphaned resources and pending updates

use std::collections::BTreeSet;

use serde::Serialize;

use super::catalog::Catalog;
use super::resource::{ResourceKind, ResourceRecord};
use super::service::ServiceId;

/// Facts derived from diffing runtime resources against the catalog
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Resources bound to no declared service
    pub orphans: BTreeSet<ResourceRecord>,
    /// Services whose container runs an image other than the catalog version
    pub updatable: BTreeSet<ServiceId>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.orphans.is_empty() && self.updatable.is_empty()
    }
}

/// Diff `resources` against the declared services in `catalog`
pub fn reconcile(catalog: &Catalog, resources: &[ResourceRecord]) -> ReconcileReport {
    let mut report = ReconcileReport::default();

    for record in resources {
        let definition = record
            .bound_service_id
            .as_ref()
            .and_then(|id| catalog.get(id));

        let Some(definition) = definition else {
            report.orphans.insert(record.clone());
            continue;
        };

        if record.kind != ResourceKind::Container {
            continue;
        }
        // Containers without a parseable tag cannot be compared
        if let Some(installed) = record.image_version() {
            if installed != definition.version {
                report.updatable.insert(definition.id.clone());
            }
        }
    }

    report
}

/// Counts for a presentation badge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Badge {
    pub orphans: usize,
    pub updates: usize,
}

impl Badge {
    /// `None` when there is nothing to show
    pub fn from_report(report: &ReconcileReport) -> Option<Self> {
        if report.is_clean() {
            None
        } else {
            Some(Self {
                orphans: report.orphans.len(),
                updates: report.updatable.len(),
            })
        }
    }

    pub fn total(&self) -> usize {
        self.orphans + self.updates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ServiceConfig, ServiceDefinition};

    fn def(id: &str, version: &str) -> ServiceDefinition {
        ServiceDefinition {
            id: ServiceId::from(id),
            display_name: id.to_string(),
            image: id.to_string(),
            version: version.to_string(),
            default_config: ServiceConfig::default(),
            post_install_message: None,
        }
    }

    fn catalog() -> Catalog {
        Catalog::new([def("mysql", "8.4"), def("redis", "7.4")])
    }

    fn record(kind: ResourceKind, id: &str, bound: Option<&str>) -> ResourceRecord {
        ResourceRecord::new(kind, id, bound.map(ServiceId::from))
    }

    #[test]
    fn test_orphan_volume_detected() {
        let resources = vec![
            record(ResourceKind::Container, "mysql", Some("mysql")),
            record(ResourceKind::Volume, "orphan-1", None),
        ];
        let report = reconcile(&catalog(), &resources);
        assert_eq!(
            report.orphans,
            BTreeSet::from([record(ResourceKind::Volume, "orphan-1", None)])
        );
        assert!(report.updatable.is_empty());
    }

    #[test]
    fn test_binding_to_undeclared_service_is_orphan() {
        let resources = vec![record(ResourceKind::Network, "net", Some("mongo"))];
        let report = reconcile(&catalog(), &resources);
        assert_eq!(report.orphans.len(), 1);
    }

    #[test]
    fn test_version_drift_marks_updatable() {
        let resources = vec![
            record(ResourceKind::Container, "dockyard-redis", Some("redis")).with_image("redis:7.2"),
            record(ResourceKind::Container, "dockyard-mysql", Some("mysql")).with_image("mysql:8.4"),
            // Volumes carry no image and never count as updatable
            record(ResourceKind::Volume, "dockyard-redis-data", Some("redis")),
        ];
        let report = reconcile(&catalog(), &resources);
        assert!(report.orphans.is_empty());
        assert_eq!(report.updatable, BTreeSet::from([ServiceId::from("redis")]));
    }

    #[test]
    fn test_badge() {
        assert_eq!(Badge::from_report(&ReconcileReport::default()), None);

        let resources = vec![
            record(ResourceKind::Volume, "orphan-1", None),
            record(ResourceKind::Container, "dockyard-redis", Some("redis")).with_image("redis:6"),
        ];
        let badge = Badge::from_report(&reconcile(&catalog(), &resources)).unwrap();
        assert_eq!(badge.orphans, 1);
        assert_eq!(badge.updates, 1);
        assert_eq!(badge.total(), 2);
    }
}
