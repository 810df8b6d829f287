use envoy_types::pb::{
    envoy::config::{
        cluster::v3::Cluster, endpoint::v3::ClusterLoadAssignment, listener::v3::Listener,
        route::v3::RouteConfiguration,
    },
    google::protobuf::Any,
};
use prost::Message;
use std::{
    fmt,
    ops::{Index, IndexMut},
};
use xds_controller_core::ProxyKind;

pub(crate) mod type_url {
    pub const LISTENER: &str = "type.googleapis.com/envoy.config.listener.v3.Listener";
    pub const ROUTE: &str = "type.googleapis.com/envoy.config.route.v3.RouteConfiguration";
    pub const CLUSTER: &str = "type.googleapis.com/envoy.config.cluster.v3.Cluster";
    pub const ENDPOINT: &str = "type.googleapis.com/envoy.config.endpoint.v3.ClusterLoadAssignment";

    pub const HTTP_CONNECTION_MANAGER: &str =
        "type.googleapis.com/envoy.extensions.filters.network.http_connection_manager.v3.HttpConnectionManager";
    pub const TCP_PROXY: &str =
        "type.googleapis.com/envoy.extensions.filters.network.tcp_proxy.v3.TcpProxy";
    pub const ROUTER: &str = "type.googleapis.com/envoy.extensions.filters.http.router.v3.Router";
}

/// The resource types served over the aggregated stream.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceType {
    Listener,
    Route,
    Cluster,
    Endpoint,
}

/// A value for each [`ResourceType`].
///
/// Every type always has an entry, so lookups never fail.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PerType<T>([T; 4]);

/// A typed resource payload.
#[derive(Clone, Debug, PartialEq)]
pub enum Resource {
    Listener(Listener),
    Route(RouteConfiguration),
    Cluster(Cluster),
    Endpoint(ClusterLoadAssignment),
}

// === impl ResourceType ===

impl ResourceType {
    pub const ALL: [Self; 4] = [Self::Listener, Self::Route, Self::Cluster, Self::Endpoint];

    pub fn type_url(&self) -> &'static str {
        match self {
            Self::Listener => type_url::LISTENER,
            Self::Route => type_url::ROUTE,
            Self::Cluster => type_url::CLUSTER,
            Self::Endpoint => type_url::ENDPOINT,
        }
    }

    pub fn from_type_url(url: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.type_url() == url)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Listener => "listener",
            Self::Route => "route",
            Self::Cluster => "cluster",
            Self::Endpoint => "endpoint",
        }
    }

    /// The type whose resources the proxy stores inside resources of this
    /// type. Updating a parent implicitly discards the proxy's copy of its
    /// children.
    pub fn child(&self) -> Option<Self> {
        match self {
            Self::Listener => Some(Self::Route),
            Self::Cluster => Some(Self::Endpoint),
            Self::Route | Self::Endpoint => None,
        }
    }

    /// Indicates whether an empty set of resources is a meaningful
    /// configuration for this type, rather than a sign that the snapshot has
    /// not been populated yet.
    pub fn allows_empty(&self, kind: ProxyKind) -> bool {
        match self {
            Self::Listener | Self::Route => kind == ProxyKind::IngressGateway,
            Self::Cluster => matches!(
                kind,
                ProxyKind::MeshGateway | ProxyKind::TerminatingGateway | ProxyKind::IngressGateway
            ),
            Self::Endpoint => false,
        }
    }

    fn slot(self) -> usize {
        match self {
            Self::Listener => 0,
            Self::Route => 1,
            Self::Cluster => 2,
            Self::Endpoint => 3,
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// === impl PerType ===

impl<T> PerType<T> {
    pub fn from_fn(mut f: impl FnMut(ResourceType) -> T) -> Self {
        Self(ResourceType::ALL.map(&mut f))
    }

    pub fn iter(&self) -> impl Iterator<Item = (ResourceType, &T)> {
        ResourceType::ALL.into_iter().zip(self.0.iter())
    }
}

impl<T> Index<ResourceType> for PerType<T> {
    type Output = T;

    fn index(&self, t: ResourceType) -> &T {
        &self.0[t.slot()]
    }
}

impl<T> IndexMut<ResourceType> for PerType<T> {
    fn index_mut(&mut self, t: ResourceType) -> &mut T {
        &mut self.0[t.slot()]
    }
}

// === impl Resource ===

impl Resource {
    pub fn resource_type(&self) -> ResourceType {
        match self {
            Self::Listener(_) => ResourceType::Listener,
            Self::Route(_) => ResourceType::Route,
            Self::Cluster(_) => ResourceType::Cluster,
            Self::Endpoint(_) => ResourceType::Endpoint,
        }
    }

    /// The well-known name by which other resources and the proxy refer to
    /// this resource.
    pub fn name(&self) -> &str {
        match self {
            Self::Listener(l) => &l.name,
            Self::Route(r) => &r.name,
            Self::Cluster(c) => &c.name,
            Self::Endpoint(e) => &e.cluster_name,
        }
    }

    /// Encodes the resource. Map entries are written in iteration order, so
    /// equal resources may encode differently.
    pub fn encode_to_vec(&self) -> Vec<u8> {
        match self {
            Self::Listener(l) => l.encode_to_vec(),
            Self::Route(r) => r.encode_to_vec(),
            Self::Cluster(c) => c.encode_to_vec(),
            Self::Endpoint(e) => e.encode_to_vec(),
        }
    }

    pub fn to_any(&self) -> Any {
        Any {
            type_url: self.resource_type().type_url().to_string(),
            value: self.encode_to_vec(),
        }
    }
}

impl From<Listener> for Resource {
    fn from(l: Listener) -> Self {
        Self::Listener(l)
    }
}

impl From<RouteConfiguration> for Resource {
    fn from(r: RouteConfiguration) -> Self {
        Self::Route(r)
    }
}

impl From<Cluster> for Resource {
    fn from(c: Cluster) -> Self {
        Self::Cluster(c)
    }
}

impl From<ClusterLoadAssignment> for Resource {
    fn from(e: ClusterLoadAssignment) -> Self {
        Self::Endpoint(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_urls_round_trip() {
        for t in ResourceType::ALL {
            assert_eq!(ResourceType::from_type_url(t.type_url()), Some(t));
        }
        assert_eq!(
            ResourceType::from_type_url(
                "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.Secret"
            ),
            None
        );
        assert_eq!(ResourceType::from_type_url(""), None);
    }

    #[test]
    fn empty_responses_by_proxy_kind() {
        use ProxyKind::*;
        assert!(ResourceType::Listener.allows_empty(IngressGateway));
        assert!(!ResourceType::Listener.allows_empty(ConnectProxy));
        assert!(ResourceType::Cluster.allows_empty(MeshGateway));
        assert!(ResourceType::Cluster.allows_empty(TerminatingGateway));
        assert!(!ResourceType::Cluster.allows_empty(ConnectProxy));
        for kind in [ConnectProxy, MeshGateway, TerminatingGateway, IngressGateway, ApiGateway] {
            assert!(!ResourceType::Endpoint.allows_empty(kind));
        }
    }

    #[test]
    fn per_type_slots_are_distinct() {
        let mut per = PerType::<usize>::default();
        for (i, t) in ResourceType::ALL.into_iter().enumerate() {
            per[t] = i;
        }
        let seen = per.iter().map(|(_, v)| *v).collect::<Vec<_>>();
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }
}
