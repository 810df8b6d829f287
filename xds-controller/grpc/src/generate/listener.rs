use super::cluster;
use crate::resource::type_url;
use envoy_types::pb::{
    envoy::{
        config::{
            listener::v3::{filter::ConfigType, Filter, FilterChain, Listener},
            route::v3::{
                route::Action, route_action::ClusterSpecifier as RouteCluster,
                route_match::PathSpecifier, Route, RouteAction, RouteConfiguration, RouteMatch,
                VirtualHost,
            },
        },
        extensions::filters::{
            http::router::v3::Router,
            network::{
                http_connection_manager::v3::{
                    http_connection_manager::RouteSpecifier, http_filter, HttpConnectionManager,
                    HttpFilter, Rds,
                },
                tcp_proxy::v3::{tcp_proxy::ClusterSpecifier, TcpProxy},
            },
        },
    },
    google::protobuf::Any,
};
use prost::Message;
use std::net::SocketAddr;

/// A listener that proxies raw TCP to a cluster.
pub(super) fn tcp(name: &str, addr: SocketAddr, cluster: &str) -> Listener {
    let proxy = TcpProxy {
        stat_prefix: cluster.to_string(),
        cluster_specifier: Some(ClusterSpecifier::Cluster(cluster.to_string())),
        ..Default::default()
    };
    listener(
        name,
        addr,
        Filter {
            name: "envoy.filters.network.tcp_proxy".to_string(),
            config_type: Some(ConfigType::TypedConfig(any(type_url::TCP_PROXY, &proxy))),
            ..Default::default()
        },
    )
}

/// A listener that loads its routes over RDS, by the given route name.
pub(super) fn http(name: &str, addr: SocketAddr, route: &str) -> Listener {
    let router = HttpFilter {
        name: "envoy.filters.http.router".to_string(),
        config_type: Some(http_filter::ConfigType::TypedConfig(any(
            type_url::ROUTER,
            &Router::default(),
        ))),
        ..Default::default()
    };
    let hcm = HttpConnectionManager {
        stat_prefix: route.to_string(),
        route_specifier: Some(RouteSpecifier::Rds(Rds {
            config_source: Some(cluster::ads()),
            route_config_name: route.to_string(),
            ..Default::default()
        })),
        http_filters: vec![router],
        ..Default::default()
    };
    listener(
        name,
        addr,
        Filter {
            name: "envoy.filters.network.http_connection_manager".to_string(),
            config_type: Some(ConfigType::TypedConfig(any(
                type_url::HTTP_CONNECTION_MANAGER,
                &hcm,
            ))),
            ..Default::default()
        },
    )
}

/// Routes every request to the cluster of the same name.
pub(super) fn route_config(name: &str) -> RouteConfiguration {
    let route = Route {
        r#match: Some(RouteMatch {
            path_specifier: Some(PathSpecifier::Prefix("/".to_string())),
            ..Default::default()
        }),
        action: Some(Action::Route(RouteAction {
            cluster_specifier: Some(RouteCluster::Cluster(name.to_string())),
            ..Default::default()
        })),
        ..Default::default()
    };
    RouteConfiguration {
        name: name.to_string(),
        virtual_hosts: vec![VirtualHost {
            name: name.to_string(),
            domains: vec!["*".to_string()],
            routes: vec![route],
            ..Default::default()
        }],
        ..Default::default()
    }
}

fn listener(name: &str, addr: SocketAddr, filter: Filter) -> Listener {
    Listener {
        name: name.to_string(),
        address: Some(cluster::socket_address(addr)),
        filter_chains: vec![FilterChain {
            filters: vec![filter],
            ..Default::default()
        }],
        ..Default::default()
    }
}

fn any(type_url: &str, msg: &impl Message) -> Any {
    Any {
        type_url: type_url.to_string(),
        value: msg.encode_to_vec(),
    }
}
