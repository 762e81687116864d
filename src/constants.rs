//! # Constants
//!
//! Shared constants used throughout the controller.

/// API group of the Instance custom resource.
pub const GROUP_NAME: &str = "apps.bundler.dev";

/// Finalizer placed on every Instance while it is managed.
pub const FINALIZER_NAME: &str = "apps.bundler.dev/finalizer";

/// Field owner used for server-side apply patches.
pub const FIELD_OWNER: &str = "bundler";

/// Annotation holding an expression that yields the endpoint list.
pub const ANNOTATION_ENDPOINTS_EXPRESSION: &str = "app.kubernetes.io/endpoints-expression";

/// Annotation holding an expression that yields the workload state list.
pub const ANNOTATION_STATES_EXPRESSION: &str = "app.kubernetes.io/states-expression";

/// Annotation that keeps an already-applied resource from being re-applied.
pub const ANNOTATION_SKIP_UPDATE: &str = "apps.bundler.dev/skip-update";

/// Annotation that keeps a managed resource from being pruned.
pub const ANNOTATION_SKIP_DELETE: &str = "apps.bundler.dev/skip-delete";

/// Placeholder substituted by callers with a reachable node address.
pub const NODE_IP_PLACEHOLDER: &str = "{NodeIP}";

/// Maximum number of Instance keys reconciled in parallel.
pub const MAX_CONCURRENT_RECONCILES: usize = 5;

/// Default timeout for helm install/upgrade operations.
pub const HELM_APPLY_TIMEOUT_SECS: u64 = 600;

/// Default timeout for helm uninstall operations.
pub const HELM_REMOVE_TIMEOUT_SECS: u64 = 300;

/// Default number of release revisions kept in storage.
pub const HELM_MAX_HISTORY: usize = 5;

/// Exponential backoff starting value for failed reconciles (seconds).
pub const BACKOFF_START_SECS: u64 = 1;

/// Exponential backoff ceiling for failed reconciles (seconds).
pub const BACKOFF_MAX_SECS: u64 = 300;
