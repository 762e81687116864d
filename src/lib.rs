//! # Bundler
//!
//! A Kubernetes controller that reconciles declarative `Instance` records
//! into a running cluster. Each Instance names a packaged workload: a helm
//! chart, a kustomize overlay, or a template bundle.
//!
//! The control loop watches Instances, fetches the referenced package,
//! materializes object manifests, diffs them against previously managed
//! resources, applies the delta with server-side apply, and reports a
//! computed lifecycle phase plus extracted endpoints and workload states
//! back onto the Instance status.

pub mod api;
pub mod apply;
pub mod constants;
pub mod controller;
pub mod error;
pub mod observability;
pub mod server;

pub use error::{Error, Result};
