use crate::resource::{PerType, Resource, ResourceType};
use ahash::AHashSet as HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use xds_controller_core::{ConfigSnapshot, Protocol, ProxyKind, Upstream};

mod cluster;
mod listener;

/// Renders a proxy's configuration snapshot into xDS resources.
pub trait GenerateResources {
    fn generate(&self, snapshot: &ConfigSnapshot) -> Result<PerType<Vec<Resource>>, GenerateError>;
}

#[derive(Debug, thiserror::Error)]
pub enum GenerateError {
    #[error("upstream {0:?} is configured more than once")]
    DuplicateUpstream(String),

    #[error("upstreams {first:?} and {second:?} both bind port {port}")]
    PortConflict {
        port: u16,
        first: String,
        second: String,
    },

    #[error("upstream name must not be empty")]
    UnnamedUpstream,

    #[error("upstream name {0:?} is reserved")]
    ReservedName(String),
}

/// Generates a fixed layout: one cluster and load assignment per upstream,
/// and listeners that forward to them.
#[derive(Copy, Clone, Debug, Default)]
pub struct Generator(());

const LOCAL_APP_CLUSTER: &str = "local_app";

impl<T: GenerateResources + ?Sized> GenerateResources for std::sync::Arc<T> {
    fn generate(&self, snapshot: &ConfigSnapshot) -> Result<PerType<Vec<Resource>>, GenerateError> {
        (**self).generate(snapshot)
    }
}

// === impl Generator ===

impl GenerateResources for Generator {
    fn generate(&self, snapshot: &ConfigSnapshot) -> Result<PerType<Vec<Resource>>, GenerateError> {
        check_upstreams(&snapshot.upstreams)?;

        let mut out = PerType::<Vec<Resource>>::default();
        for upstream in &snapshot.upstreams {
            out[ResourceType::Cluster].push(cluster::eds(&upstream.name).into());
            out[ResourceType::Endpoint]
                .push(cluster::load_assignment(&upstream.name, &upstream.endpoints).into());
        }

        match snapshot.kind {
            ProxyKind::ConnectProxy => {
                if let Some(port) = snapshot.local_app_port {
                    let local = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), port.get());
                    out[ResourceType::Cluster]
                        .push(cluster::static_cluster(LOCAL_APP_CLUSTER, local).into());
                    out[ResourceType::Listener].push(
                        listener::tcp(
                            &format!("public_listener:{}", snapshot.address),
                            snapshot.address,
                            LOCAL_APP_CLUSTER,
                        )
                        .into(),
                    );
                }
                for upstream in &snapshot.upstreams {
                    let addr = SocketAddr::new(
                        Ipv4Addr::LOCALHOST.into(),
                        upstream.local_bind_port.get(),
                    );
                    upstream_listener(upstream, addr, &mut out);
                }
            }

            ProxyKind::IngressGateway => {
                for upstream in &snapshot.upstreams {
                    let addr =
                        SocketAddr::new(snapshot.address.ip(), upstream.local_bind_port.get());
                    upstream_listener(upstream, addr, &mut out);
                }
            }

            ProxyKind::MeshGateway | ProxyKind::TerminatingGateway | ProxyKind::ApiGateway => {
                if let Some(upstream) = snapshot.upstreams.first() {
                    out[ResourceType::Listener].push(
                        listener::tcp(
                            &format!("{}:{}", snapshot.kind, snapshot.address),
                            snapshot.address,
                            &upstream.name,
                        )
                        .into(),
                    );
                }
            }
        }

        Ok(out)
    }
}

fn upstream_listener(upstream: &Upstream, addr: SocketAddr, out: &mut PerType<Vec<Resource>>) {
    let name = format!("{}:{addr}", upstream.name);
    match upstream.protocol {
        Protocol::Tcp => {
            out[ResourceType::Listener].push(listener::tcp(&name, addr, &upstream.name).into());
        }
        Protocol::Http => {
            out[ResourceType::Listener]
                .push(listener::http(&name, addr, &upstream.name).into());
            out[ResourceType::Route].push(listener::route_config(&upstream.name).into());
        }
    }
}

fn check_upstreams(upstreams: &[Upstream]) -> Result<(), GenerateError> {
    let mut names = HashSet::with_capacity(upstreams.len());
    let mut ports = ahash::AHashMap::<u16, &str>::with_capacity(upstreams.len());
    for upstream in upstreams {
        if upstream.name.is_empty() {
            return Err(GenerateError::UnnamedUpstream);
        }
        if upstream.name == LOCAL_APP_CLUSTER {
            return Err(GenerateError::ReservedName(upstream.name.clone()));
        }
        if !names.insert(upstream.name.as_str()) {
            return Err(GenerateError::DuplicateUpstream(upstream.name.clone()));
        }
        let port = upstream.local_bind_port.get();
        if let Some(first) = ports.insert(port, &upstream.name) {
            return Err(GenerateError::PortConflict {
                port,
                first: first.to_string(),
                second: upstream.name.clone(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexedResources;
    use std::num::NonZeroU16;
    use xds_controller_core::ProxyId;

    fn upstream(name: &str, port: u16, protocol: Protocol) -> Upstream {
        Upstream {
            name: name.to_string(),
            protocol,
            local_bind_port: NonZeroU16::new(port).expect("port must be non-zero"),
            endpoints: vec!["10.0.0.1:8080".parse().expect("valid address")],
        }
    }

    fn snapshot(kind: ProxyKind, upstreams: Vec<Upstream>) -> ConfigSnapshot {
        ConfigSnapshot {
            proxy_id: ProxyId::from("web-sidecar-proxy"),
            kind,
            service: "web".to_string(),
            address: "10.0.0.2:21000".parse().expect("valid address"),
            local_app_port: NonZeroU16::new(8080),
            upstreams,
        }
    }

    fn names(out: &PerType<Vec<Resource>>, t: ResourceType) -> Vec<&str> {
        let mut names = out[t].iter().map(Resource::name).collect::<Vec<_>>();
        names.sort_unstable();
        names
    }

    #[test]
    fn connect_proxy() {
        let out = Generator::default()
            .generate(&snapshot(
                ProxyKind::ConnectProxy,
                vec![
                    upstream("db", 5432, Protocol::Tcp),
                    upstream("api", 9191, Protocol::Http),
                ],
            ))
            .expect("must generate");

        assert_eq!(
            names(&out, ResourceType::Cluster),
            ["api", "db", "local_app"]
        );
        assert_eq!(names(&out, ResourceType::Endpoint), ["api", "db"]);
        assert_eq!(
            names(&out, ResourceType::Listener),
            [
                "api:127.0.0.1:9191",
                "db:127.0.0.1:5432",
                "public_listener:10.0.0.2:21000"
            ]
        );
        assert_eq!(names(&out, ResourceType::Route), ["api"]);

        let index = IndexedResources::index(out).expect("must index");
        assert_eq!(
            index.children(ResourceType::Listener, "api:127.0.0.1:9191"),
            ["api".to_string()]
        );
        assert!(index
            .children(ResourceType::Listener, "db:127.0.0.1:5432")
            .is_empty());
    }

    #[test]
    fn ingress_gateway() {
        let mut snap = snapshot(
            ProxyKind::IngressGateway,
            vec![upstream("api", 8443, Protocol::Http)],
        );
        snap.local_app_port = None;
        let out = Generator::default().generate(&snap).expect("must generate");
        assert_eq!(names(&out, ResourceType::Listener), ["api:10.0.0.2:8443"]);
        assert_eq!(names(&out, ResourceType::Cluster), ["api"]);

        snap.upstreams.clear();
        let out = Generator::default().generate(&snap).expect("must generate");
        for t in ResourceType::ALL {
            assert!(out[t].is_empty());
        }
    }

    #[test]
    fn terminating_gateway() {
        let out = Generator::default()
            .generate(&snapshot(
                ProxyKind::TerminatingGateway,
                vec![upstream("legacy", 9000, Protocol::Tcp)],
            ))
            .expect("must generate");
        assert_eq!(
            names(&out, ResourceType::Listener),
            ["terminating-gateway:10.0.0.2:21000"]
        );
        assert!(out[ResourceType::Route].is_empty());
    }

    #[test]
    fn rejects_conflicting_upstreams() {
        let err = Generator::default()
            .generate(&snapshot(
                ProxyKind::ConnectProxy,
                vec![
                    upstream("db", 5432, Protocol::Tcp),
                    upstream("db", 5433, Protocol::Tcp),
                ],
            ))
            .expect_err("must fail");
        assert!(matches!(err, GenerateError::DuplicateUpstream(name) if name == "db"));

        let err = Generator::default()
            .generate(&snapshot(
                ProxyKind::ConnectProxy,
                vec![
                    upstream("db", 5432, Protocol::Tcp),
                    upstream("cache", 5432, Protocol::Tcp),
                ],
            ))
            .expect_err("must fail");
        assert!(matches!(err, GenerateError::PortConflict { port: 5432, .. }));
    }

    #[test]
    fn rejects_reserved_upstream_name() {
        let err = Generator::default()
            .generate(&snapshot(
                ProxyKind::ConnectProxy,
                vec![
                    upstream("db", 5432, Protocol::Tcp),
                    upstream("local_app", 9000, Protocol::Tcp),
                ],
            ))
            .expect_err("must fail");
        assert!(matches!(err, GenerateError::ReservedName(name) if name == "local_app"));
    }
}
