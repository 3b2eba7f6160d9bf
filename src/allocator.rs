//! Global memory allocator configuration.
//!
//! The export phases allocate and free page buffers and row blobs across
//! dozens of worker threads at once; `mimalloc` keeps contention and
//! fragmentation low under exactly that load.

use mimalloc::MiMalloc;

/// The global allocator instance.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;
