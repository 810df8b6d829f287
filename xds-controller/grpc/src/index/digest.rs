//! Content versions that do not depend on map iteration order.
//!
//! Protobuf maps decode into `HashMap`s, so two equal resources may encode
//! their map entries in different orders. Map-bearing fields are taken out of
//! a copy of the resource, the remainder is encoded as usual, and each map is
//! then hashed entry by entry in key order.

use crate::resource::Resource;
use envoy_types::pb::{
    envoy::config::{
        cluster::v3::Cluster,
        core::v3::Metadata,
        endpoint::v3::{ClusterLoadAssignment, Endpoint},
        listener::v3::Listener,
        route::v3::{route::Action, route_action::ClusterSpecifier, RouteConfiguration},
    },
    google::protobuf::{value::Kind, Any, Struct, Value},
};
use prost::Message;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

pub(super) fn version(resource: &Resource) -> String {
    let mut maps = Maps::default();
    let rest = match resource.clone() {
        Resource::Listener(mut l) => {
            listener(&mut maps, &mut l);
            Resource::Listener(l)
        }
        Resource::Route(mut r) => {
            route_config(&mut maps, &mut r);
            Resource::Route(r)
        }
        Resource::Cluster(mut c) => {
            cluster(&mut maps, &mut c);
            Resource::Cluster(c)
        }
        Resource::Endpoint(mut e) => {
            load_assignment(&mut maps, "", &mut e);
            Resource::Endpoint(e)
        }
    };

    let mut w = Writer::default();
    w.bytes(&rest.encode_to_vec());
    for (path, taken) in maps.0 {
        w.bytes(path.as_bytes());
        match taken {
            Taken::Metadata(md) => {
                w.entries(&md.filter_metadata, Writer::structure);
                w.entries(&md.typed_filter_metadata, Writer::message);
            }
            Taken::Configs(configs) => w.entries(&configs, Writer::message),
            Taken::Endpoints(endpoints) => w.entries(&endpoints, Writer::message),
        }
    }
    hex::encode(w.0.finalize())
}

/// Map-bearing fields removed from a resource, by field path.
#[derive(Default)]
struct Maps(Vec<(String, Taken)>);

enum Taken {
    Metadata(Metadata),
    Configs(HashMap<String, Any>),
    Endpoints(HashMap<String, Endpoint>),
}

#[derive(Default)]
struct Writer(Sha256);

// === impl Maps ===

impl Maps {
    fn metadata(&mut self, path: String, metadata: &mut Option<Metadata>) {
        if let Some(md) = metadata.take() {
            self.0.push((path, Taken::Metadata(md)));
        }
    }

    fn configs(&mut self, path: String, configs: &mut HashMap<String, Any>) {
        if !configs.is_empty() {
            self.0.push((path, Taken::Configs(std::mem::take(configs))));
        }
    }
}

fn listener(maps: &mut Maps, l: &mut Listener) {
    maps.metadata("metadata".to_string(), &mut l.metadata);
    for (i, chain) in l.filter_chains.iter_mut().enumerate() {
        maps.metadata(format!("filter_chains[{i}].metadata"), &mut chain.metadata);
    }
    if let Some(chain) = l.default_filter_chain.as_mut() {
        maps.metadata("default_filter_chain.metadata".to_string(), &mut chain.metadata);
    }
}

fn route_config(maps: &mut Maps, r: &mut RouteConfiguration) {
    maps.metadata("metadata".to_string(), &mut r.metadata);
    maps.configs(
        "typed_per_filter_config".to_string(),
        &mut r.typed_per_filter_config,
    );
    for (i, vh) in r.virtual_hosts.iter_mut().enumerate() {
        let vh_path = format!("virtual_hosts[{i}]");
        maps.metadata(format!("{vh_path}.metadata"), &mut vh.metadata);
        maps.configs(
            format!("{vh_path}.typed_per_filter_config"),
            &mut vh.typed_per_filter_config,
        );
        for (j, route) in vh.routes.iter_mut().enumerate() {
            let path = format!("{vh_path}.routes[{j}]");
            maps.metadata(format!("{path}.metadata"), &mut route.metadata);
            maps.configs(
                format!("{path}.typed_per_filter_config"),
                &mut route.typed_per_filter_config,
            );
            let Some(Action::Route(action)) = route.action.as_mut() else {
                continue;
            };
            maps.metadata(format!("{path}.metadata_match"), &mut action.metadata_match);
            if let Some(ClusterSpecifier::WeightedClusters(weighted)) =
                action.cluster_specifier.as_mut()
            {
                for (k, cw) in weighted.clusters.iter_mut().enumerate() {
                    let cw_path = format!("{path}.weighted_clusters[{k}]");
                    maps.metadata(format!("{cw_path}.metadata_match"), &mut cw.metadata_match);
                    maps.configs(
                        format!("{cw_path}.typed_per_filter_config"),
                        &mut cw.typed_per_filter_config,
                    );
                }
            }
        }
    }
}

fn cluster(maps: &mut Maps, c: &mut Cluster) {
    maps.metadata("metadata".to_string(), &mut c.metadata);
    maps.configs(
        "typed_extension_protocol_options".to_string(),
        &mut c.typed_extension_protocol_options,
    );
    if let Some(cla) = c.load_assignment.as_mut() {
        load_assignment(maps, "load_assignment.", cla);
    }
}

fn load_assignment(maps: &mut Maps, prefix: &str, cla: &mut ClusterLoadAssignment) {
    if !cla.named_endpoints.is_empty() {
        maps.0.push((
            format!("{prefix}named_endpoints"),
            Taken::Endpoints(std::mem::take(&mut cla.named_endpoints)),
        ));
    }
    for (i, locality) in cla.endpoints.iter_mut().enumerate() {
        let path = format!("{prefix}endpoints[{i}]");
        maps.metadata(format!("{path}.metadata"), &mut locality.metadata);
        for (j, lb) in locality.lb_endpoints.iter_mut().enumerate() {
            maps.metadata(format!("{path}.lb_endpoints[{j}].metadata"), &mut lb.metadata);
        }
    }
}

// === impl Writer ===

impl Writer {
    fn len(&mut self, len: usize) {
        self.0.update((len as u64).to_le_bytes());
    }

    fn bytes(&mut self, bytes: &[u8]) {
        self.len(bytes.len());
        self.0.update(bytes);
    }

    fn message<M: Message>(&mut self, msg: &M) {
        self.bytes(&msg.encode_to_vec());
    }

    fn entries<V>(&mut self, map: &HashMap<String, V>, mut value: impl FnMut(&mut Self, &V)) {
        let mut entries = map.iter().collect::<Vec<_>>();
        entries.sort_unstable_by(|(a, _), (b, _)| a.cmp(b));
        self.len(entries.len());
        for (key, v) in entries {
            self.bytes(key.as_bytes());
            value(self, v);
        }
    }

    fn structure(&mut self, s: &Struct) {
        self.entries(&s.fields, Self::value);
    }

    fn value(&mut self, v: &Value) {
        match &v.kind {
            Some(Kind::StructValue(s)) => {
                self.0.update([1]);
                self.structure(s);
            }
            Some(Kind::ListValue(list)) => {
                self.0.update([2]);
                self.len(list.values.len());
                for v in &list.values {
                    self.value(v);
                }
            }
            _ => {
                self.0.update([0]);
                self.message(v);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use envoy_types::pb::{
        envoy::config::endpoint::v3::{LbEndpoint, LocalityLbEndpoints},
        google::protobuf::ListValue,
    };

    fn string(s: &str) -> Value {
        Value {
            kind: Some(Kind::StringValue(s.to_string())),
        }
    }

    /// Builds the same metadata with entries inserted in the given order.
    fn metadata(order: &[usize]) -> Metadata {
        let mut fields = HashMap::new();
        for i in order {
            fields.insert(format!("field-{i}"), string(&format!("value-{i}")));
        }
        fields.insert(
            "nested".to_string(),
            Value {
                kind: Some(Kind::ListValue(ListValue {
                    values: vec![string("a"), string("b")],
                })),
            },
        );
        let mut filter_metadata = HashMap::new();
        for i in order {
            filter_metadata.insert(
                format!("envoy.filters.{i}"),
                Struct {
                    fields: fields.clone(),
                },
            );
        }
        Metadata {
            filter_metadata,
            ..Default::default()
        }
    }

    fn cluster(order: &[usize]) -> Resource {
        Cluster {
            name: "web".to_string(),
            metadata: Some(metadata(order)),
            ..Default::default()
        }
        .into()
    }

    #[test]
    fn ignores_map_order() {
        let forward = (0..9).collect::<Vec<_>>();
        let reverse = (0..9).rev().collect::<Vec<_>>();
        let expected = version(&cluster(&forward));
        for _ in 0..20 {
            assert_eq!(version(&cluster(&forward)), expected);
            assert_eq!(version(&cluster(&reverse)), expected);
        }
    }

    #[test]
    fn distinguishes_map_contents() {
        let base = version(&cluster(&[0, 1, 2]));
        assert_ne!(version(&cluster(&[0, 1])), base);
        assert_ne!(
            version(
                &Cluster {
                    name: "web".to_string(),
                    ..Default::default()
                }
                .into()
            ),
            base
        );

        let mut moved = Cluster {
            name: "web".to_string(),
            ..Default::default()
        };
        moved.load_assignment = Some(ClusterLoadAssignment {
            cluster_name: "web".to_string(),
            endpoints: vec![LocalityLbEndpoints {
                lb_endpoints: vec![LbEndpoint {
                    metadata: Some(metadata(&[0, 1, 2])),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        });
        assert_ne!(version(&moved.into()), base);
    }

    #[test]
    fn hashes_nested_endpoint_metadata() {
        let cla = |order: &[usize]| -> Resource {
            ClusterLoadAssignment {
                cluster_name: "web".to_string(),
                endpoints: vec![LocalityLbEndpoints {
                    metadata: Some(metadata(order)),
                    lb_endpoints: vec![LbEndpoint {
                        metadata: Some(metadata(order)),
                        ..Default::default()
                    }],
                    ..Default::default()
                }],
                ..Default::default()
            }
            .into()
        };
        assert_eq!(version(&cla(&[3, 1, 2])), version(&cla(&[2, 3, 1])));
    }
}
