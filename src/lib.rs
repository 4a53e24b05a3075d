//! Purpose: Lock-free write path for shared-memory append-only log terms.
//! Exports: `core` (buffer access, frame layout, tail counter, appender, claims, term log file).
//! Role: Library backing the `termlog` CLI; producers link it directly.
//! Invariants: Space in a term is only ever reserved through the tail counter fetch-add.
//! Invariants: A frame becomes visible to readers only through a release store of its length.
#[cfg(target_endian = "big")]
compile_error!("termlog requires a little-endian target");

pub mod core;
