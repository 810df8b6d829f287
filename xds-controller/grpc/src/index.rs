use crate::resource::{type_url, PerType, Resource, ResourceType};
use ahash::AHashMap as HashMap;
use envoy_types::pb::envoy::{
    config::listener::v3::{filter::ConfigType, Listener},
    extensions::filters::network::http_connection_manager::v3::{
        http_connection_manager::RouteSpecifier, HttpConnectionManager,
    },
};
use prost::Message;
use tracing::debug;

mod digest;

/// Content versions, by type and name.
pub type Versions = PerType<HashMap<String, String>>;

/// Generated resources, keyed by type and name, along with the names of the
/// child resources that each parent refers to.
#[derive(Clone, Debug, Default)]
pub struct IndexedResources {
    resources: PerType<HashMap<String, Resource>>,
    children: PerType<HashMap<String, Vec<String>>>,
}

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("generated a {resource_type} resource without a name")]
    Unnamed { resource_type: ResourceType },

    #[error("generated {found} resource {name:?} as a {expected}")]
    MismatchedType {
        name: String,
        found: ResourceType,
        expected: ResourceType,
    },

    #[error("listener {listener:?} has an invalid HttpConnectionManager: {error}")]
    InvalidConnectionManager {
        listener: String,
        #[source]
        error: prost::DecodeError,
    },
}

// === impl IndexedResources ===

impl IndexedResources {
    pub fn index(generated: PerType<Vec<Resource>>) -> Result<Self, IndexError> {
        let mut index = Self::default();
        for (expected, resources) in generated.iter() {
            for resource in resources {
                let found = resource.resource_type();
                let name = resource.name();
                if found != expected {
                    return Err(IndexError::MismatchedType {
                        name: name.to_string(),
                        found,
                        expected,
                    });
                }
                if name.is_empty() {
                    return Err(IndexError::Unnamed {
                        resource_type: found,
                    });
                }

                let children = match resource {
                    Resource::Listener(l) => rds_route_names(l)?,
                    Resource::Cluster(c) => vec![c.name.clone()],
                    Resource::Route(_) | Resource::Endpoint(_) => vec![],
                };
                if !children.is_empty() {
                    index.children[found].insert(name.to_string(), children);
                }

                if index.resources[found]
                    .insert(name.to_string(), resource.clone())
                    .is_some()
                {
                    debug!(resource_type = %found, %name, "Duplicate resource replaced");
                }
            }
        }
        Ok(index)
    }

    pub fn get(&self, resource_type: ResourceType, name: &str) -> Option<&Resource> {
        self.resources[resource_type].get(name)
    }

    pub fn len(&self, resource_type: ResourceType) -> usize {
        self.resources[resource_type].len()
    }

    /// Names of the resources of the child type that the named resource
    /// refers to.
    pub fn children(&self, resource_type: ResourceType, name: &str) -> &[String] {
        self.children[resource_type]
            .get(name)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Computes a content version for every resource.
    pub fn versions(&self) -> Versions {
        PerType::from_fn(|t| {
            self.resources[t]
                .iter()
                .map(|(name, resource)| (name.clone(), digest::version(resource)))
                .collect()
        })
    }
}

/// Lists the route configurations a listener's connection managers load
/// over RDS.
fn rds_route_names(listener: &Listener) -> Result<Vec<String>, IndexError> {
    let mut names = Vec::new();
    let chains = listener
        .filter_chains
        .iter()
        .chain(listener.default_filter_chain.as_ref());
    for chain in chains {
        for filter in &chain.filters {
            let Some(ConfigType::TypedConfig(any)) = &filter.config_type else {
                continue;
            };
            if any.type_url != type_url::HTTP_CONNECTION_MANAGER {
                continue;
            }
            let hcm = HttpConnectionManager::decode(any.value.as_slice()).map_err(|error| {
                IndexError::InvalidConnectionManager {
                    listener: listener.name.clone(),
                    error,
                }
            })?;
            if let Some(RouteSpecifier::Rds(rds)) = hcm.route_specifier {
                names.push(rds.route_config_name);
            }
        }
    }
    names.sort();
    names.dedup();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use envoy_types::pb::{
        envoy::{
            config::{
                cluster::v3::Cluster,
                endpoint::v3::ClusterLoadAssignment,
                listener::v3::{Filter, FilterChain},
                route::v3::RouteConfiguration,
            },
            extensions::filters::network::http_connection_manager::v3::Rds,
        },
        google::protobuf::Any,
    };

    fn cluster(name: &str, timeout_secs: i64) -> Resource {
        Cluster {
            name: name.to_string(),
            connect_timeout: Some(envoy_types::pb::google::protobuf::Duration {
                seconds: timeout_secs,
                nanos: 0,
            }),
            ..Default::default()
        }
        .into()
    }

    fn http_listener(name: &str, route: &str) -> Resource {
        let hcm = HttpConnectionManager {
            stat_prefix: name.to_string(),
            route_specifier: Some(RouteSpecifier::Rds(Rds {
                route_config_name: route.to_string(),
                ..Default::default()
            })),
            ..Default::default()
        };
        Listener {
            name: name.to_string(),
            filter_chains: vec![FilterChain {
                filters: vec![Filter {
                    name: "envoy.filters.network.http_connection_manager".to_string(),
                    config_type: Some(ConfigType::TypedConfig(Any {
                        type_url: type_url::HTTP_CONNECTION_MANAGER.to_string(),
                        value: hcm.encode_to_vec(),
                    })),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        }
        .into()
    }

    fn generated(resources: Vec<Resource>) -> PerType<Vec<Resource>> {
        let mut per = PerType::<Vec<Resource>>::default();
        for r in resources {
            per[r.resource_type()].push(r);
        }
        per
    }

    #[test]
    fn versions_are_content_hashes() {
        let a = IndexedResources::index(generated(vec![cluster("web", 5), cluster("db", 5)]))
            .expect("must index");
        let b = IndexedResources::index(generated(vec![cluster("db", 5), cluster("web", 5)]))
            .expect("must index");
        assert_eq!(a.versions(), b.versions());

        let c = IndexedResources::index(generated(vec![cluster("web", 10), cluster("db", 5)]))
            .expect("must index");
        let (va, vc) = (a.versions(), c.versions());
        assert_ne!(
            va[ResourceType::Cluster]["web"],
            vc[ResourceType::Cluster]["web"]
        );
        assert_eq!(va[ResourceType::Cluster]["db"], vc[ResourceType::Cluster]["db"]);
        assert_eq!(va[ResourceType::Cluster]["db"].len(), 64);
    }

    #[test]
    fn versions_ignore_map_order() {
        use envoy_types::pb::{
            envoy::config::core::v3::Metadata,
            google::protobuf::{value::Kind, Struct, Value},
        };

        let cluster = || -> Resource {
            let fields = (0..8)
                .map(|i| {
                    let value = Value {
                        kind: Some(Kind::NumberValue(i as f64)),
                    };
                    (format!("key-{i}"), value)
                })
                .collect::<std::collections::HashMap<_, _>>();
            let filter_metadata = (0..9)
                .map(|i| {
                    let s = Struct {
                        fields: fields.clone(),
                    };
                    (format!("envoy.lb.{i}"), s)
                })
                .collect();
            Cluster {
                name: "web".to_string(),
                metadata: Some(Metadata {
                    filter_metadata,
                    ..Default::default()
                }),
                ..Default::default()
            }
            .into()
        };

        let versions = (0..20)
            .map(|_| {
                let index =
                    IndexedResources::index(generated(vec![cluster()])).expect("must index");
                index.versions()[ResourceType::Cluster]["web"].clone()
            })
            .collect::<ahash::AHashSet<_>>();
        assert_eq!(versions.len(), 1, "{versions:?}");
    }

    #[test]
    fn endpoints_are_named_by_cluster() {
        let index = IndexedResources::index(generated(vec![ClusterLoadAssignment {
            cluster_name: "web".to_string(),
            ..Default::default()
        }
        .into()]))
        .expect("must index");
        assert!(index.get(ResourceType::Endpoint, "web").is_some());
    }

    #[test]
    fn rejects_unnamed_resources() {
        let err = IndexedResources::index(generated(vec![RouteConfiguration::default().into()]))
            .expect_err("must fail");
        assert!(matches!(
            err,
            IndexError::Unnamed {
                resource_type: ResourceType::Route
            }
        ));
    }

    #[test]
    fn rejects_resources_in_the_wrong_bucket() {
        let mut per = PerType::<Vec<Resource>>::default();
        per[ResourceType::Listener].push(cluster("web", 5));
        let err = IndexedResources::index(per).expect_err("must fail");
        assert!(matches!(
            err,
            IndexError::MismatchedType {
                found: ResourceType::Cluster,
                expected: ResourceType::Listener,
                ..
            }
        ));
    }

    #[test]
    fn indexes_children() {
        let index = IndexedResources::index(generated(vec![
            http_listener("web:127.0.0.1:8080", "web"),
            cluster("db", 5),
        ]))
        .expect("must index");
        assert_eq!(
            index.children(ResourceType::Listener, "web:127.0.0.1:8080"),
            ["web".to_string()]
        );
        assert_eq!(index.children(ResourceType::Cluster, "db"), ["db".to_string()]);
        assert!(index.children(ResourceType::Cluster, "web").is_empty());
    }
}
