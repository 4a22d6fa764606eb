pub mod client;

pub use client::{purge_orphan_sidecars, SqliteClient, SqlitePool, SqliteTuning, VacuumMode};
