use std::{fmt, net::SocketAddr, num::NonZeroU16, str::FromStr};

/// Identifies a single proxy instance, as reported in its streaming node
/// descriptor.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProxyId(String);

/// Discriminates the shape of configuration a proxy receives.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ProxyKind {
    ConnectProxy,
    MeshGateway,
    TerminatingGateway,
    IngressGateway,
    ApiGateway,
}

/// An immutable description of the desired state of the world for one proxy
/// at one instant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigSnapshot {
    pub proxy_id: ProxyId,
    pub kind: ProxyKind,

    /// The service on whose behalf the proxy runs. For sidecars this is the
    /// destination service; gateways name themselves.
    pub service: String,

    /// The address on which the proxy accepts inbound (or gateway) traffic.
    pub address: SocketAddr,

    /// The port of the local application, when the proxy fronts one.
    pub local_app_port: Option<NonZeroU16>,

    pub upstreams: Vec<Upstream>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Upstream {
    pub name: String,
    pub protocol: Protocol,

    /// For sidecars, the loopback port on which the upstream is exposed to the
    /// local application. Ingress gateways expose it on their own address.
    pub local_bind_port: NonZeroU16,

    pub endpoints: Vec<SocketAddr>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum Protocol {
    #[default]
    Tcp,
    Http,
}

#[derive(Debug, thiserror::Error)]
#[error("unknown proxy kind: {0}")]
pub struct InvalidProxyKind(String);

// === impl ProxyId ===

impl ProxyId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProxyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for ProxyId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

// === impl ProxyKind ===

impl ProxyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConnectProxy => "connect-proxy",
            Self::MeshGateway => "mesh-gateway",
            Self::TerminatingGateway => "terminating-gateway",
            Self::IngressGateway => "ingress-gateway",
            Self::ApiGateway => "api-gateway",
        }
    }
}

impl fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProxyKind {
    type Err = InvalidProxyKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "connect-proxy" | "" => Ok(Self::ConnectProxy),
            "mesh-gateway" => Ok(Self::MeshGateway),
            "terminating-gateway" => Ok(Self::TerminatingGateway),
            "ingress-gateway" => Ok(Self::IngressGateway),
            "api-gateway" => Ok(Self::ApiGateway),
            s => Err(InvalidProxyKind(s.to_string())),
        }
    }
}

// === impl Protocol ===

impl FromStr for Protocol {
    type Err = InvalidProtocol;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" | "" => Ok(Self::Tcp),
            "http" | "http2" | "grpc" => Ok(Self::Http),
            s => Err(InvalidProtocol(s.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown upstream protocol: {0}")]
pub struct InvalidProtocol(String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_proxy_kinds() {
        for kind in [
            ProxyKind::ConnectProxy,
            ProxyKind::MeshGateway,
            ProxyKind::TerminatingGateway,
            ProxyKind::IngressGateway,
            ProxyKind::ApiGateway,
        ] {
            assert_eq!(kind.as_str().parse::<ProxyKind>().unwrap(), kind);
        }
        assert_eq!("".parse::<ProxyKind>().unwrap(), ProxyKind::ConnectProxy);
        assert!("sidecar".parse::<ProxyKind>().is_err());
    }

    #[test]
    fn parses_protocols() {
        assert_eq!("grpc".parse::<Protocol>().unwrap(), Protocol::Http);
        assert_eq!("".parse::<Protocol>().unwrap(), Protocol::Tcp);
        assert!("udp".parse::<Protocol>().is_err());
    }
}
