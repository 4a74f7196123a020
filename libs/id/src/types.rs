//! Generated identifiers used across the cluster.

use crate::define_id;

// =============================================================================
// Cluster
// =============================================================================

define_id!(NodeId, "node");

// =============================================================================
// Upstreams and Requests
// =============================================================================

define_id!(ConnectionId, "conn");
define_id!(CorrelationId, "req");
