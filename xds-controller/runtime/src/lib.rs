#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use xds_controller_core as core;
pub use xds_controller_grpc as grpc;

mod args;
mod config;
mod file;
mod source;
mod tokens;

pub use self::{
    args::Args,
    source::{ConfigSource, Index, SharedIndex},
    tokens::{ServiceAcl, TokenTable},
};
