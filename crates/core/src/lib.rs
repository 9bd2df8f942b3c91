//! Data model of a cirrus cluster and the contract of the compute providers
//! it runs on.

pub mod cluster;
pub mod compute;
pub mod predicate;
pub mod spec;

pub use {
    cluster::{Cluster, Instance, Lookup},
    compute::{Compute, Connector},
    predicate::Predicate,
    spec::{ClusterSpec, Credentials, InstanceTemplate},
};
