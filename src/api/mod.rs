//! API types for the `apps.bundler.dev/v1` group.

pub mod instance;
pub mod values;

pub use instance::{
    Condition, DependencyReference, Endpoint, EndpointKind, Instance, InstanceKind,
    InstanceOption, InstanceSpec, InstanceStatus, ManagedResource, Phase, State, ValuesFrom,
    CONDITION_DEPENDENCIES_READY, CONDITION_INSTALLED, CONDITION_READY,
    VALUES_FROM_KIND_CONFIGMAP, VALUES_FROM_KIND_SECRET,
};
pub use values::{equal_values, merge_into, merge_maps, Values};
