//! Bowl Core: cell layout and heap arena for a relocating runtime
//!
//! This crate is the language-agnostic foundation of the Bowl VM:
//!
//! - `cell`: the tagged, variable-sized cell layout every value lives in.
//!   The header and the first variant fields are C ABI — native modules may
//!   embed static cells in their data sections.
//! - `heap`: the two-space bump arena the collector copies between.
//! - `stats`: a cross-thread registry of per-VM heap statistics.
//!
//! Policy — when to collect, how roots are found, what grows — lives in
//! `bowl-runtime`. This crate only knows how cells are shaped and where
//! they sit.

pub mod cell;
pub mod heap;
pub mod stats;

// Re-export key types and functions
pub use cell::{
    BooleanCell, CELL_ALIGN, ExceptionCell, FunctionCell, HEADER_SIZE, Header, KIND_BOOLEAN,
    KIND_EXCEPTION, KIND_FUNCTION, KIND_LIBRARY, KIND_LIST, KIND_MAP, KIND_NUMBER, KIND_STRING,
    KIND_SYMBOL, KIND_VECTOR, LibraryCell, ListCell, MapCell, NumberCell, Ref, TextCell,
    VectorCell, align_size, byte_size, fixed_size, kind_name, library_name, library_name_init,
    library_size, map_buckets, map_buckets_mut, map_size, text_bytes, text_init, text_size,
    vector_elements, vector_elements_mut, vector_size,
};

pub use heap::{DEFAULT_HEAP_CAPACITY, Heap, MIN_HEAP_CAPACITY, Semispace};

pub use stats::{
    AggregateHeapStats, HeapSlot, HeapStatsRegistry, get_or_register_slot, heap_registry,
    update_collection_stats, update_heap_stats,
};
