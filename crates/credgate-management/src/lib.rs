//! Operator-facing management plane.
//!
//! Every route lives under `/v0/management` and requires the management
//! password as a bearer token. Responses are stable JSON objects; record
//! views carry the computed fields (priority, quota state, model cooldowns,
//! session counts, latest quota snapshot) but never the storage blob.

mod router;

pub use router::{ManagementState, management_router};
