//! Service catalog - The static set of installable service definitions

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::service::{ServiceConfig, ServiceDefinition, ServiceId};

/// Declared services, keyed by id. Never mutated after construction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Catalog {
    definitions: BTreeMap<ServiceId, ServiceDefinition>,
}

impl Catalog {
    pub fn new(definitions: impl IntoIterator<Item = ServiceDefinition>) -> Self {
        Self {
            definitions: definitions
                .into_iter()
                .map(|d| (d.id.clone(), d))
                .collect(),
        }
    }

    /// Catalog shipped with the binary
    pub fn builtin() -> Self {
        Self::new([
            definition(
                "mysql",
                "MySQL",
                "mysql",
                "8.4",
                ServiceConfig::default()
                    .with_port(3306, 3306)
                    .with_env("MYSQL_ALLOW_EMPTY_PASSWORD", "yes")
                    .with_volume("dockyard-mysql-data", "/var/lib/mysql"),
                Some("Connect with: mysql -h 127.0.0.1 -P 3306 -u root"),
            ),
            definition(
                "postgres",
                "PostgreSQL",
                "postgres",
                "17",
                ServiceConfig::default()
                    .with_port(5432, 5432)
                    .with_env("POSTGRES_HOST_AUTH_METHOD", "trust")
                    .with_volume("dockyard-postgres-data", "/var/lib/postgresql/data"),
                Some("Connect with: psql -h 127.0.0.1 -U postgres"),
            ),
            definition(
                "redis",
                "Redis",
                "redis",
                "7.4",
                ServiceConfig::default()
                    .with_port(6379, 6379)
                    .with_volume("dockyard-redis-data", "/data"),
                None,
            ),
            definition(
                "mailpit",
                "Mailpit",
                "axllent/mailpit",
                "v1.21",
                ServiceConfig::default()
                    .with_port(1025, 1025)
                    .with_port(8025, 8025),
                Some("Web UI available at http://127.0.0.1:8025"),
            ),
            definition(
                "meilisearch",
                "Meilisearch",
                "getmeili/meilisearch",
                "v1.11",
                ServiceConfig::default()
                    .with_port(7700, 7700)
                    .with_volume("dockyard-meilisearch-data", "/meili_data"),
                None,
            ),
            definition(
                "minio",
                "MinIO",
                "minio/minio",
                "RELEASE.2024-11-07T00-52-20Z",
                ServiceConfig::default()
                    .with_port(9000, 9000)
                    .with_port(9001, 9001)
                    .with_volume("dockyard-minio-data", "/data"),
                Some("Console available at http://127.0.0.1:9001"),
            ),
        ])
    }

    pub fn get(&self, id: &ServiceId) -> Option<&ServiceDefinition> {
        self.definitions.get(id)
    }

    pub fn contains(&self, id: &ServiceId) -> bool {
        self.definitions.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServiceDefinition> {
        self.definitions.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = &ServiceId> {
        self.definitions.keys()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

fn definition(
    id: &str,
    display_name: &str,
    image: &str,
    version: &str,
    default_config: ServiceConfig,
    post_install_message: Option<&str>,
) -> ServiceDefinition {
    ServiceDefinition {
        id: ServiceId::from(id),
        display_name: display_name.to_string(),
        image: image.to_string(),
        version: version.to_string(),
        default_config,
        post_install_message: post_install_message.map(str::to_string),
    }
}
