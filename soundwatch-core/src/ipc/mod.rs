//! Event types published by the engine.
//!
//! All types derive `serde::Serialize` + `serde::Deserialize` so hosts can
//! forward them as JSON (desktop notifications, log shippers, UI bridges).

pub mod events;
