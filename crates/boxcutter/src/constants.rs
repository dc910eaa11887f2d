//! Well-known keys stamped on every object the engine manages.

use const_format::concatcp;

/// The general key prefix for all engine-owned metadata.
pub const SYSTEM_PREFIX: &str = "boxcutter.dev";

/// The annotation key `boxcutter.dev/revision`. It carries the revision
/// number of the revision that last reconciled the object, as a decimal
/// `i64`. The value on a live object is monotonically non-decreasing across
/// successful reconciliations.
pub const REVISION_ANNOTATION: &str = concatcp!(SYSTEM_PREFIX, "/revision");

/// The label key `boxcutter.dev-managed`. It marks objects that were produced
/// by *some* engine instance and is consulted when an object carries no
/// resolvable controller reference (the cross-namespace case).
pub const MANAGED_LABEL: &str = concatcp!(SYSTEM_PREFIX, "-managed");

/// The value stamped under [`MANAGED_LABEL`].
pub const MANAGED_LABEL_VALUE: &str = "True";

/// The annotation key `boxcutter.dev/owner-references`. Used by the
/// annotation ownership strategy to carry a JSON-encoded owner list for
/// objects a native `OwnerReference` cannot express (cross-namespace and
/// cross-cluster owners).
pub const OWNERS_ANNOTATION: &str = concatcp!(SYSTEM_PREFIX, "/owner-references");

/// The default field manager under which the engine issues server-side
/// apply requests. Overridable at engine construction.
pub const DEFAULT_FIELD_MANAGER: &str = "boxcutter";
