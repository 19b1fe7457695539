//! KV backend implementations living in-core.
//!
//! The production backend is `gpufleet_redis`; [`memory::MemoryBackend`]
//! implements the same port for tests and embedded single-process runs.

pub mod memory;

pub use memory::MemoryBackend;
