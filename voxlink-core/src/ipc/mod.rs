//! Types published to embedders (UI shells, host binaries).
//!
//! Everything derives `serde::Serialize` + `serde::Deserialize` so a host can
//! forward events over its own bus unchanged.

pub mod events;
