#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod order;
mod session;
mod tracker;

pub mod generate;
pub mod index;
pub mod metrics;
pub mod resource;
pub mod server;

pub use self::{
    generate::{GenerateError, GenerateResources, Generator},
    index::{IndexError, IndexedResources, Versions},
    metrics::StreamMetricsFamily,
    resource::{PerType, Resource, ResourceType},
    server::{DeltaAdsServer, TOKEN_METADATA_KEY},
};
