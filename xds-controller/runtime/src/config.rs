//! The JSON document that describes registered proxies.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::{net::SocketAddr, num::NonZeroU16};
use xds_controller_core::{ConfigSnapshot, Protocol, ProxyId, ProxyKind, Upstream};

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct ConfigFile {
    #[serde(default)]
    proxies: Vec<Proxy>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Proxy {
    id: String,
    #[serde(default)]
    kind: String,
    service: String,
    address: SocketAddr,
    #[serde(default)]
    local_app_port: Option<NonZeroU16>,
    #[serde(default)]
    upstreams: Vec<ProxyUpstream>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProxyUpstream {
    name: String,
    #[serde(default)]
    protocol: String,
    local_bind_port: NonZeroU16,
    #[serde(default)]
    endpoints: Vec<SocketAddr>,
}

impl ConfigFile {
    pub(crate) fn parse(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).context("invalid proxy config")
    }

    pub(crate) fn into_snapshots(self) -> Result<Vec<ConfigSnapshot>> {
        self.proxies.into_iter().map(Proxy::into_snapshot).collect()
    }
}

impl Proxy {
    fn into_snapshot(self) -> Result<ConfigSnapshot> {
        let Self {
            id,
            kind,
            service,
            address,
            local_app_port,
            upstreams,
        } = self;
        anyhow::ensure!(!id.is_empty(), "proxy id must not be empty");
        let kind = kind
            .parse::<ProxyKind>()
            .with_context(|| format!("proxy {id:?} has an invalid kind"))?;
        let upstreams = upstreams
            .into_iter()
            .map(|u| {
                let protocol = u
                    .protocol
                    .parse::<Protocol>()
                    .with_context(|| format!("upstream {:?} of proxy {id:?}", u.name))?;
                Ok(Upstream {
                    name: u.name,
                    protocol,
                    local_bind_port: u.local_bind_port,
                    endpoints: u.endpoints,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(ConfigSnapshot {
            proxy_id: ProxyId::new(id),
            kind,
            service,
            address,
            local_app_port,
            upstreams,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_proxies() {
        let file = ConfigFile::parse(
            br#"{
                "proxies": [
                    {
                        "id": "web-sidecar-proxy",
                        "service": "web",
                        "address": "10.0.0.2:21000",
                        "local_app_port": 8080,
                        "upstreams": [
                            {
                                "name": "api",
                                "protocol": "http",
                                "local_bind_port": 9191,
                                "endpoints": ["10.0.1.1:8080", "10.0.1.2:8080"]
                            }
                        ]
                    },
                    {
                        "id": "ingress",
                        "kind": "ingress-gateway",
                        "service": "ingress",
                        "address": "10.0.0.3:8443"
                    }
                ]
            }"#,
        )
        .expect("must parse");
        let snapshots = file.into_snapshots().expect("must convert");
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].kind, ProxyKind::ConnectProxy);
        assert_eq!(snapshots[0].upstreams[0].protocol, Protocol::Http);
        assert_eq!(snapshots[0].upstreams[0].endpoints.len(), 2);
        assert_eq!(snapshots[1].kind, ProxyKind::IngressGateway);
        assert_eq!(snapshots[1].local_app_port, None);
    }

    #[test]
    fn rejects_invalid_proxies() {
        let file = ConfigFile::parse(
            br#"{"proxies": [{"id": "", "service": "web", "address": "10.0.0.2:21000"}]}"#,
        )
        .expect("must parse");
        assert!(file.into_snapshots().is_err());

        let file = ConfigFile::parse(
            br#"{"proxies": [{"id": "x", "kind": "sidecar", "service": "web", "address": "10.0.0.2:21000"}]}"#,
        )
        .expect("must parse");
        assert!(file.into_snapshots().is_err());

        assert!(ConfigFile::parse(br#"{"proxy": []}"#).is_err());
    }
}
