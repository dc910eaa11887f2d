//! Boxcutter rolls out, reconciles and tears down *sets* of Kubernetes
//! objects as coordinated units called revisions.
//!
//! A [`revision::Revision`] declares ordered phases of objects on behalf of
//! an owning object. The [`engine::RevisionEngine`] converts that
//! declaration into a convergent sequence of server-side apply operations
//! while preserving ownership discipline, field-level conflict recovery and
//! revision linearity: older revisions never overwrite newer ones, newer
//! revisions may take control from named predecessors.
//!
//! The engines talk to the cluster through the capability traits in
//! [`client`]; everything they persist on managed objects is listed in
//! [`constants`].

pub mod client;
pub mod compare;
pub mod constants;
pub mod engine;
pub mod fieldset;
pub mod ownership;
pub mod probe;
pub mod revision;
pub mod validation;

// External re-exports
pub use k8s_openapi;
pub use kube;
