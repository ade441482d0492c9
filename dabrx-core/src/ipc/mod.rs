//! Observer event types.
//!
//! All types derive `serde::Serialize` + `serde::Deserialize` so a host
//! application can forward them over its own transport unchanged.

pub mod events;
