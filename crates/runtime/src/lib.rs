//! Bowl Runtime: the core of an embeddable stack-oriented VM
//!
//! Programs run over a uniform heap of tagged cells; a relocating
//! two-space collector moves live values and rewrites every reference it
//! can reach from the frame chain. Native modules loaded from shared
//! libraries extend the dictionary with new primitives through a C ABI.
//!
//! Key design principles:
//! - Values are single contiguous cells (`bowl-core`); one memcpy moves one
//!   value, so collection is a copy loop
//! - Frames are the root set: primitives pin intermediates in frame
//!   registers, and the collector rewrites registers and slots in place
//! - Exceptions are values: fallible operations return `Result<Ref, Ref>`
//!   inside Rust and the tagged [`exception::BowlResult`] at the ABI
//! - Containers are persistent: lists and maps update functionally and
//!   share structure
//!
//! # Modules
//!
//! - `frame`: activation records, the current-top register, link/unlink
//! - `gc`: the allocator and the Cheney copying collector
//! - `value`: constructors, hashing, equality, clone
//! - `printer`: human-readable rendering of values
//! - `exception`: singletons, formatted exceptions, cause chains
//! - `stack_ops`: datastack push/pop and typed pops
//! - `list_ops`, `map_ops`: the persistent containers
//! - `loader`: dynamic loading and lifetime coupling of native modules
//! - `dictionary`: primitive registration and dispatch
//! - `config`: process-wide startup settings and logging
//! - `vm`: setup and teardown of the per-thread runtime

pub mod config;
pub mod dictionary;
pub mod exception;
pub mod frame;
pub mod gc;
pub mod list_ops;
pub mod loader;
pub mod map_ops;
pub mod printer;
pub mod stack_ops;
pub mod value;
pub mod vm;

#[cfg(test)]
mod test_support;

// Re-export the cell layout so embedders depend on one crate.
pub use bowl_core::cell::{
    KIND_BOOLEAN, KIND_EXCEPTION, KIND_FUNCTION, KIND_LIBRARY, KIND_LIST, KIND_MAP, KIND_NUMBER,
    KIND_STRING, KIND_SYMBOL, KIND_VECTOR, Ref, byte_size, kind_name,
};
pub use bowl_core::heap::{DEFAULT_HEAP_CAPACITY, MIN_HEAP_CAPACITY};

pub use config::{Config, config, configure, init_logging};
pub use dictionary::{RegistryEntry, dispatch, lookup, register_all, register_function};
pub use exception::{
    BowlResult, finalization_failure, format_exception, out_of_heap, rethrow, sentinel_value,
};
pub use frame::{Frame, NativeFn, current_frame, link, unlink};
pub use gc::{allocate, collect, collection_count, heap_capacity, heap_used};
pub use list_ops::{head, length as list_length, reverse, tail};
pub use loader::{ModuleEntry, library};
pub use map_ops::{
    delete as map_delete, get_or_else as map_get_or_else, length as map_length, merge as map_merge,
    put as map_put, subset_of as map_subset_of,
};
pub use printer::{dump, dump_stream, show};
pub use stack_ops::{
    depth, peek, pop, pop_boolean, pop_function, pop_list, pop_map, pop_number, pop_string,
    pop_symbol, push,
};
pub use value::{
    boolean, boolean_value, clone_value, equals, exception as exception_value, function, hash,
    list, map, number, number_value, string, symbol, text_str, vector,
};
pub use vm::{is_initialized, setup, teardown};
