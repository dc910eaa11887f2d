//! Field-path sets over unstructured Kubernetes objects.
//!
//! This is the subset of structured-merge-diff machinery the comparator
//! needs: path elements with a total order, set trees with the usual set
//! algebra, the `fieldsV1` wire codec used by `metadata.managedFields`, and
//! extraction of the field set an unstructured document would claim under
//! server-side apply.

mod path;
mod set;

pub use path::{Path, PathElement};
pub(crate) use set::lookup;
pub use set::{FieldSet, FieldsV1Error, ListKeys};
