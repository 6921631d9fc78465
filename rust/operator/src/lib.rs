//! Turns `LogForwarder` resources into a collector configuration document and the pod that
//! runs the collector.
//!
//! [`config::compile`] and [`pod::build_pod_spec`] are pure functions of the forwarder, its
//! output secrets and the cluster facts. [`controller`] wires them into a reconcile pass.

pub mod cluster;
pub mod collector;
pub mod config;
pub mod controller;
pub mod pod;
pub mod secrets;
pub mod status;
pub mod tls;
