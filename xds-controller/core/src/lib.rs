#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod authz;
pub mod snapshot;
pub mod watch;

pub use self::{
    authz::{AllowAll, Authorizer, AuthzError, ResolveAuthorizer},
    snapshot::{ConfigSnapshot, Protocol, ProxyId, ProxyKind, Upstream},
    watch::{ConfigSnapshotStream, ConfigWatch, WatchCancel, WatchConfig, WatchError},
};
