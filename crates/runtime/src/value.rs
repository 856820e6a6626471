//! Value Construction and Structural Operations
//!
//! Constructors for all ten cell kinds, plus the content operations the
//! rest of the runtime leans on: lazy cached hashing, structural equality,
//! and deep clone.
//!
//! Every constructor that takes references pins them in an inheriting
//! frame's registers before allocating and re-reads them afterwards — the
//! allocation may run a collection that moves every argument. Constructors
//! that only consume Rust-side data (text bytes, floats) need no pinning.
//!
//! # Hashing
//!
//! FNV-1a based, cached in the cell (`0` = uncomputed, re-keyed to 1 on the
//! rare collision with the sentinel):
//!
//! - symbols/strings: over the UTF-8 bytes
//! - numbers: over the canonical bit pattern (one NaN, −0 ≡ +0)
//! - booleans: a fixed offset constant plus the bit
//! - lists/vectors: order-sensitive fold; list suffix hashes are cached on
//!   every cell of the spine
//! - maps: order-insensitive XOR of mixed entry hashes, so equal maps hash
//!   equally regardless of bucket layout
//! - functions: code pointer mixed with the library hash; libraries: their
//!   name bytes. Heap addresses never enter a hash — the collector moves
//!   cells, cached hashes must survive the move.
//! - exceptions: fold of cause and message

use crate::frame::{Frame, NativeFn, with_roots};
use crate::gc::allocate;
use crate::{list_ops, map_ops};
use bowl_core::cell::{
    BooleanCell, ExceptionCell, FunctionCell, KIND_BOOLEAN, KIND_EXCEPTION, KIND_FUNCTION,
    KIND_LIBRARY, KIND_LIST, KIND_MAP, KIND_NUMBER, KIND_STRING, KIND_SYMBOL, KIND_VECTOR,
    ListCell, MapCell, NumberCell, Ref, VectorCell, library_name, map_buckets_mut, text_bytes,
    text_init, vector_elements, vector_elements_mut,
};
use std::ffi::c_void;
use std::mem::size_of;
use std::ptr;

// =============================================================================
// Constructors
// =============================================================================

/// Allocate a symbol cell holding `name`.
///
/// # Safety
/// The runtime must be set up and a frame linked on this thread.
pub unsafe fn symbol(name: &str) -> Result<Ref, Ref> {
    unsafe {
        let value = allocate(KIND_SYMBOL, name.len())?;
        text_init(value, name.as_bytes());
        Ok(value)
    }
}

/// Allocate a string cell holding `text`.
///
/// # Safety
/// The runtime must be set up and a frame linked on this thread.
pub unsafe fn string(text: &str) -> Result<Ref, Ref> {
    unsafe {
        let value = allocate(KIND_STRING, text.len())?;
        text_init(value, text.as_bytes());
        Ok(value)
    }
}

/// Allocate a number cell.
///
/// # Safety
/// The runtime must be set up and a frame linked on this thread.
pub unsafe fn number(value: f64) -> Result<Ref, Ref> {
    unsafe {
        let cell = allocate(KIND_NUMBER, 0)?;
        (*(cell as *mut NumberCell)).value = value;
        Ok(cell)
    }
}

/// Allocate a boolean cell.
///
/// # Safety
/// The runtime must be set up and a frame linked on this thread.
pub unsafe fn boolean(value: bool) -> Result<Ref, Ref> {
    unsafe {
        let cell = allocate(KIND_BOOLEAN, 0)?;
        (*(cell as *mut BooleanCell)).value = u8::from(value);
        Ok(cell)
    }
}

/// Allocate a list cell `head : tail`. The empty list is the null
/// reference, so `tail` may be null; a zero-length list cell is never
/// created.
///
/// # Safety
/// `frame` must be a valid linked frame; `tail` must be a list or null.
pub unsafe fn list(frame: *mut Frame, head: Ref, tail: Ref) -> Result<Ref, Ref> {
    unsafe {
        debug_assert!(tail.is_null() || (*tail).kind == KIND_LIST);
        with_roots(frame, [head, tail, ptr::null_mut()], |child| {
            let cell = allocate(KIND_LIST, 0)? as *mut ListCell;
            let tail = (*child).registers[1];
            (*cell).head = (*child).registers[0];
            (*cell).tail = tail;
            (*cell).length = 1 + if tail.is_null() {
                0
            } else {
                (*(tail as *mut ListCell)).length
            };
            Ok(cell as Ref)
        })
    }
}

/// Allocate an empty map with at least one bucket (power of two preferred
/// and enforced by the growth path; the constructor only clamps to ≥ 1).
///
/// # Safety
/// The runtime must be set up and a frame linked on this thread.
pub unsafe fn map(capacity: usize) -> Result<Ref, Ref> {
    unsafe {
        let capacity = capacity.max(1);
        let value = allocate(KIND_MAP, capacity * size_of::<Ref>())?;
        let cell = value as *mut MapCell;
        (*cell).length = 0;
        (*cell).capacity = capacity as u64;
        for bucket in map_buckets_mut(value) {
            *bucket = ptr::null_mut();
        }
        Ok(value)
    }
}

/// Allocate a vector of `length` slots, every one filled with `fill`.
///
/// # Safety
/// `frame` must be a valid linked frame.
pub unsafe fn vector(frame: *mut Frame, length: usize, fill: Ref) -> Result<Ref, Ref> {
    unsafe {
        with_roots(frame, [fill, ptr::null_mut(), ptr::null_mut()], |child| {
            let value = allocate(KIND_VECTOR, length * size_of::<Ref>())?;
            (*(value as *mut VectorCell)).length = length as u64;
            let fill = (*child).registers[0];
            for element in vector_elements_mut(value) {
                *element = fill;
            }
            Ok(value)
        })
    }
}

/// Allocate a function cell binding `code` to `library` (null for host
/// primitives).
///
/// # Safety
/// `frame` must be a valid linked frame; `library` must be a library cell
/// or null.
pub unsafe fn function(frame: *mut Frame, library: Ref, code: NativeFn) -> Result<Ref, Ref> {
    unsafe {
        debug_assert!(library.is_null() || (*library).kind == KIND_LIBRARY);
        with_roots(frame, [library, ptr::null_mut(), ptr::null_mut()], |child| {
            let cell = allocate(KIND_FUNCTION, 0)? as *mut FunctionCell;
            (*cell).library = (*child).registers[0];
            (*cell).code = code as usize;
            Ok(cell as Ref)
        })
    }
}

/// Allocate an exception cell. `cause` may be null; a non-null cause forms
/// the chain the host prints on an uncaught exception.
///
/// # Safety
/// `frame` must be a valid linked frame.
pub unsafe fn exception(frame: *mut Frame, cause: Ref, message: Ref) -> Result<Ref, Ref> {
    unsafe {
        with_roots(frame, [cause, message, ptr::null_mut()], |child| {
            let cell = allocate(KIND_EXCEPTION, 0)? as *mut ExceptionCell;
            (*cell).cause = (*child).registers[0];
            (*cell).message = (*child).registers[1];
            Ok(cell as Ref)
        })
    }
}

/// Allocate a library cell. Only the loader builds these; the handle is
/// owned by the cell from here on.
pub(crate) unsafe fn library_cell(
    name: &str,
    handle: *mut c_void,
    initialize: usize,
    finalize: usize,
) -> Result<Ref, Ref> {
    unsafe {
        let value = allocate(KIND_LIBRARY, name.len())?;
        let cell = value as *mut bowl_core::cell::LibraryCell;
        (*cell).handle = handle;
        (*cell).initialize = initialize;
        (*cell).finalize = finalize;
        bowl_core::cell::library_name_init(value, name.as_bytes());
        Ok(value)
    }
}

// =============================================================================
// Readers
// =============================================================================

/// The text of a symbol or string cell as `&str`. The slice aliases the
/// heap and is valid only until the next allocation.
///
/// # Safety
/// `value` must be an initialized symbol or string cell.
pub unsafe fn text_str<'a>(value: Ref) -> &'a str {
    unsafe {
        let bytes = text_bytes(value);
        debug_assert!(std::str::from_utf8(bytes).is_ok());
        std::str::from_utf8_unchecked(bytes)
    }
}

/// The payload of a number cell.
///
/// # Safety
/// `value` must be an initialized number cell.
pub unsafe fn number_value(value: Ref) -> f64 {
    unsafe {
        debug_assert!((*value).kind == KIND_NUMBER);
        (*(value as *mut NumberCell)).value
    }
}

/// The payload of a boolean cell.
///
/// # Safety
/// `value` must be an initialized boolean cell.
pub unsafe fn boolean_value(value: Ref) -> bool {
    unsafe {
        debug_assert!((*value).kind == KIND_BOOLEAN);
        (*(value as *mut BooleanCell)).value != 0
    }
}

// =============================================================================
// Hashing
// =============================================================================

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

// Seeds keeping structurally empty values of different kinds apart.
const EMPTY_LIST_HASH: u64 = 0x9e37_79b9_7f4a_7c15;
const BOOLEAN_HASH_OFFSET: u64 = 0x2b99_4e58_34aa_6bed;
const VECTOR_SEED: u64 = 0x5851_f42d_4c95_7f2d;
const MAP_SEED: u64 = 0x1405_7b7e_f767_814f;
const LIBRARY_SEED: u64 = 0x6c62_272e_07bb_0142;
const NULL_CAUSE_HASH: u64 = 0x27d4_eb2f_1656_67c5;

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET;
    for byte in bytes {
        hash = (hash ^ u64::from(*byte)).wrapping_mul(FNV_PRIME);
    }
    hash
}

fn mix(a: u64, b: u64) -> u64 {
    let hash = (FNV_OFFSET ^ a).wrapping_mul(FNV_PRIME);
    (hash ^ b).wrapping_mul(FNV_PRIME)
}

// 0 is reserved as the "uncomputed" sentinel.
fn rekey(hash: u64) -> u64 {
    if hash == 0 { 1 } else { hash }
}

// One NaN, and -0 collapses onto +0, so equal numbers share bits.
fn canonical_bits(value: f64) -> u64 {
    if value.is_nan() {
        0x7ff8_0000_0000_0000
    } else if value == 0.0 {
        0
    } else {
        value.to_bits()
    }
}

/// The content hash of a value. Lazy: computed once, cached in the cell,
/// and copied along with it by the collector. Never allocates.
///
/// # Safety
/// `value` must be an initialized cell or null (the empty list).
pub unsafe fn hash(value: Ref) -> u64 {
    unsafe {
        if value.is_null() {
            return EMPTY_LIST_HASH;
        }
        let cached = (*value).hash;
        if cached != 0 {
            return cached;
        }

        let computed = match (*value).kind {
            KIND_SYMBOL | KIND_STRING => fnv1a(text_bytes(value)),
            KIND_NUMBER => fnv1a(&canonical_bits(number_value(value)).to_le_bytes()),
            KIND_BOOLEAN => BOOLEAN_HASH_OFFSET + u64::from(boolean_value(value)),
            KIND_LIST => {
                // Fold the spine bottom-up so every suffix hash is cached;
                // repeated keying of long lists stays linear overall.
                let mut spine = Vec::new();
                let mut cursor = value;
                while !cursor.is_null() && (*cursor).hash == 0 {
                    spine.push(cursor);
                    cursor = (*(cursor as *mut ListCell)).tail;
                }
                let mut suffix = if cursor.is_null() {
                    EMPTY_LIST_HASH
                } else {
                    (*cursor).hash
                };
                for cell in spine.into_iter().rev() {
                    let head = (*(cell as *mut ListCell)).head;
                    suffix = rekey(mix(hash(head), suffix));
                    (*cell).hash = suffix;
                }
                return suffix;
            }
            KIND_VECTOR => {
                let mut folded = VECTOR_SEED;
                for element in vector_elements(value) {
                    folded = mix(folded, hash(*element));
                }
                folded
            }
            KIND_MAP => {
                // Order-insensitive: equal maps hash equally regardless of
                // capacity or bucket layout.
                let mut folded = MAP_SEED;
                let mut entries = map_ops::entries(value);
                while let Some((key, entry_value)) = entries.next() {
                    folded ^= mix(hash(key), hash(entry_value));
                }
                folded
            }
            KIND_FUNCTION => {
                let cell = value as *mut FunctionCell;
                mix((*cell).code as u64, hash((*cell).library))
            }
            KIND_LIBRARY => mix(LIBRARY_SEED, fnv1a(library_name(value))),
            KIND_EXCEPTION => {
                let cell = value as *mut ExceptionCell;
                let cause = if (*cell).cause.is_null() {
                    NULL_CAUSE_HASH
                } else {
                    hash((*cell).cause)
                };
                mix(cause, hash((*cell).message))
            }
            kind => panic!("hash: invalid kind {}", kind),
        };

        let computed = rekey(computed);
        (*value).hash = computed;
        computed
    }
}

// =============================================================================
// Equality
// =============================================================================

/// Structural equality. Short-circuits on pointer and kind; maps compare
/// as entry sets; NaN equals NaN so numbers stay usable as map keys. Never
/// allocates.
///
/// # Safety
/// `a` and `b` must be initialized cells or null.
pub unsafe fn equals(a: Ref, b: Ref) -> bool {
    unsafe {
        if a == b {
            return true;
        }
        if a.is_null() || b.is_null() {
            return false;
        }
        if (*a).kind != (*b).kind {
            return false;
        }

        match (*a).kind {
            KIND_SYMBOL | KIND_STRING => text_bytes(a) == text_bytes(b),
            KIND_NUMBER => canonical_bits(number_value(a)) == canonical_bits(number_value(b)),
            KIND_BOOLEAN => boolean_value(a) == boolean_value(b),
            KIND_LIST => {
                let mut left = a;
                let mut right = b;
                if (*(left as *mut ListCell)).length != (*(right as *mut ListCell)).length {
                    return false;
                }
                while !left.is_null() {
                    if right.is_null() {
                        return false;
                    }
                    let left_cell = left as *mut ListCell;
                    let right_cell = right as *mut ListCell;
                    if !equals((*left_cell).head, (*right_cell).head) {
                        return false;
                    }
                    left = (*left_cell).tail;
                    right = (*right_cell).tail;
                }
                right.is_null()
            }
            KIND_VECTOR => {
                let left = vector_elements(a);
                let right = vector_elements(b);
                left.len() == right.len()
                    && left
                        .iter()
                        .zip(right.iter())
                        .all(|(x, y)| equals(*x, *y))
            }
            KIND_MAP => {
                // Equal lengths plus a one-sided subset is subset both ways
                // when keys are unique, which buckets guarantee.
                (*(a as *mut MapCell)).length == (*(b as *mut MapCell)).length
                    && map_ops::subset_of(b, a)
            }
            KIND_FUNCTION => {
                let left = a as *mut FunctionCell;
                let right = b as *mut FunctionCell;
                (*left).code == (*right).code && equals((*left).library, (*right).library)
            }
            // One cell per loaded path; distinct cells are distinct
            // libraries.
            KIND_LIBRARY => false,
            KIND_EXCEPTION => {
                let left = a as *mut ExceptionCell;
                let right = b as *mut ExceptionCell;
                equals((*left).cause, (*right).cause)
                    && equals((*left).message, (*right).message)
            }
            kind => panic!("equals: invalid kind {}", kind),
        }
    }
}

// =============================================================================
// Clone
// =============================================================================

/// Produce a value logically equal to `value`: fresh cells for aggregates,
/// shared cells for leaves. `clone(null)` is null — the empty list clones
/// to itself.
///
/// # Safety
/// `frame` must be a valid linked frame; `value` an initialized cell or
/// null.
pub unsafe fn clone_value(frame: *mut Frame, value: Ref) -> Result<Ref, Ref> {
    unsafe {
        if value.is_null() {
            return Ok(ptr::null_mut());
        }
        match (*value).kind {
            KIND_SYMBOL | KIND_STRING | KIND_NUMBER | KIND_BOOLEAN | KIND_FUNCTION
            | KIND_LIBRARY => Ok(value),
            KIND_LIST => with_roots(
                frame,
                [value, ptr::null_mut(), ptr::null_mut()],
                |child| {
                    // registers: 0 = cursor, 1 = reversed accumulator
                    loop {
                        let cursor = (*child).registers[0];
                        if cursor.is_null() {
                            break;
                        }
                        let cloned = clone_value(child, (*(cursor as *mut ListCell)).head)?;
                        let accumulator = list(child, cloned, (*child).registers[1])?;
                        (*child).registers[1] = accumulator;
                        let cursor = (*child).registers[0];
                        (*child).registers[0] = (*(cursor as *mut ListCell)).tail;
                    }
                    list_ops::reverse(child, (*child).registers[1])
                },
            ),
            KIND_VECTOR => {
                let length = (*(value as *mut VectorCell)).length as usize;
                with_roots(
                    frame,
                    [value, ptr::null_mut(), ptr::null_mut()],
                    |child| {
                        let fresh = vector(child, length, ptr::null_mut())?;
                        (*child).registers[1] = fresh;
                        for index in 0..length {
                            let source = vector_elements((*child).registers[0])[index];
                            let cloned = clone_value(child, source)?;
                            vector_elements_mut((*child).registers[1])[index] = cloned;
                        }
                        Ok((*child).registers[1])
                    },
                )
            }
            KIND_MAP => {
                let capacity = (*(value as *mut MapCell)).capacity as usize;
                with_roots(
                    frame,
                    [value, ptr::null_mut(), ptr::null_mut()],
                    |child| {
                        let fresh = map(capacity)?;
                        (*child).registers[1] = fresh;
                        for bucket_index in 0..capacity {
                            let mut entry_index = 0;
                            loop {
                                let Some((key, _)) =
                                    map_ops::entry_at((*child).registers[0], bucket_index, entry_index)
                                else {
                                    break;
                                };
                                let key = clone_value(child, key)?;
                                (*child).registers[2] = key;
                                // The clone may have moved the source map;
                                // re-walk to the entry for the value.
                                let (_, entry_value) =
                                    map_ops::entry_at((*child).registers[0], bucket_index, entry_index)
                                        .expect("map entry vanished during clone");
                                let entry_value = clone_value(child, entry_value)?;
                                let updated = map_ops::insert_fresh(
                                    child,
                                    (*child).registers[1],
                                    (*child).registers[2],
                                    entry_value,
                                )?;
                                (*child).registers[1] = updated;
                                entry_index += 1;
                            }
                        }
                        Ok((*child).registers[1])
                    },
                )
            }
            KIND_EXCEPTION => with_roots(
                frame,
                [value, ptr::null_mut(), ptr::null_mut()],
                |child| {
                    let cause = clone_value(child, (*(value as *mut ExceptionCell)).cause)?;
                    (*child).registers[1] = cause;
                    let message = (*((*child).registers[0] as *mut ExceptionCell)).message;
                    let message = clone_value(child, message)?;
                    exception(child, (*child).registers[1], message)
                },
            ),
            kind => panic!("clone: invalid kind {}", kind),
        }
    }
}

// =============================================================================
// FFI
// =============================================================================

use crate::exception::BowlResult;

/// Total size of a cell in bytes.
///
/// # Safety
/// `value` must be an initialized cell.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bowl_value_byte_size(value: Ref) -> usize {
    unsafe { bowl_core::cell::byte_size(value) }
}

/// The cached content hash of a value.
///
/// # Safety
/// `value` must be an initialized cell or null.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bowl_value_hash(value: Ref) -> u64 {
    unsafe { hash(value) }
}

/// Structural equality of two values.
///
/// # Safety
/// `a` and `b` must be initialized cells or null.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bowl_value_equals(a: Ref, b: Ref) -> bool {
    unsafe { equals(a, b) }
}

/// Deep clone of `value`.
///
/// # Safety
/// `frame` must be a valid linked frame.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bowl_value_clone(frame: *mut Frame, value: Ref) -> BowlResult {
    unsafe { clone_value(frame, value).into() }
}

/// Allocate a number cell.
///
/// # Safety
/// The runtime must be set up and `frame` linked.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bowl_number(_frame: *mut Frame, value: f64) -> BowlResult {
    unsafe { number(value).into() }
}

/// Allocate a boolean cell.
///
/// # Safety
/// The runtime must be set up and `frame` linked.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bowl_boolean(_frame: *mut Frame, value: bool) -> BowlResult {
    unsafe { boolean(value).into() }
}

/// Allocate a symbol cell from `length` UTF-8 bytes at `name`.
///
/// # Safety
/// `name` must point to `length` valid UTF-8 bytes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bowl_symbol(
    _frame: *mut Frame,
    name: *const libc::c_char,
    length: usize,
) -> BowlResult {
    unsafe {
        let bytes = std::slice::from_raw_parts(name as *const u8, length);
        match std::str::from_utf8(bytes) {
            Ok(name) => symbol(name).into(),
            Err(_) => BowlResult::throw(crate::exception::format_exception(
                _frame,
                format_args!("symbol: name is not valid UTF-8"),
            )),
        }
    }
}

/// Allocate a string cell from `length` UTF-8 bytes at `text`.
///
/// # Safety
/// `text` must point to `length` valid UTF-8 bytes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bowl_string(
    _frame: *mut Frame,
    text: *const libc::c_char,
    length: usize,
) -> BowlResult {
    unsafe {
        let bytes = std::slice::from_raw_parts(text as *const u8, length);
        match std::str::from_utf8(bytes) {
            Ok(text) => string(text).into(),
            Err(_) => BowlResult::throw(crate::exception::format_exception(
                _frame,
                format_args!("string: text is not valid UTF-8"),
            )),
        }
    }
}

/// Allocate a list cell `head : tail`.
///
/// # Safety
/// `frame` must be a valid linked frame; `tail` a list or null.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bowl_list(frame: *mut Frame, head: Ref, tail: Ref) -> BowlResult {
    unsafe { list(frame, head, tail).into() }
}

/// Allocate an empty map with `capacity` buckets.
///
/// # Safety
/// The runtime must be set up and `frame` linked.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bowl_map(_frame: *mut Frame, capacity: usize) -> BowlResult {
    unsafe { map(capacity).into() }
}

/// Allocate a vector of `length` slots filled with `fill`.
///
/// # Safety
/// `frame` must be a valid linked frame.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bowl_vector(frame: *mut Frame, length: usize, fill: Ref) -> BowlResult {
    unsafe { vector(frame, length, fill).into() }
}

/// Allocate an exception cell.
///
/// # Safety
/// `frame` must be a valid linked frame.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bowl_exception(frame: *mut Frame, cause: Ref, message: Ref) -> BowlResult {
    unsafe { exception(frame, cause, message).into() }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::with_vm;
    use bowl_core::heap::MIN_HEAP_CAPACITY;

    #[test]
    fn test_text_construction() {
        with_vm(MIN_HEAP_CAPACITY, |_frame| unsafe {
            let name = symbol("swap").unwrap();
            assert_eq!((*name).kind, KIND_SYMBOL);
            assert_eq!(text_str(name), "swap");

            let text = string("hello").unwrap();
            assert_eq!((*text).kind, KIND_STRING);
            assert_eq!(text_str(text), "hello");

            // Same bytes, different kinds: not equal.
            let other = symbol("hello").unwrap();
            assert!(!equals(text, other));
        });
    }

    #[test]
    fn test_list_lengths() {
        with_vm(MIN_HEAP_CAPACITY, |frame| unsafe {
            let one = list(frame, number(1.0).unwrap(), ptr::null_mut()).unwrap();
            assert_eq!((*(one as *mut ListCell)).length, 1);
            let two = list(frame, number(2.0).unwrap(), one).unwrap();
            assert_eq!((*(two as *mut ListCell)).length, 2);
        });
    }

    #[test]
    fn test_number_canonicalization() {
        with_vm(MIN_HEAP_CAPACITY, |_frame| unsafe {
            let nan_a = number(f64::NAN).unwrap();
            let nan_b = number(0.0_f64 / 0.0_f64).unwrap();
            assert!(equals(nan_a, nan_b));
            assert_eq!(hash(nan_a), hash(nan_b));

            let negative_zero = number(-0.0).unwrap();
            let zero = number(0.0).unwrap();
            assert!(equals(negative_zero, zero));
            assert_eq!(hash(negative_zero), hash(zero));
        });
    }

    #[test]
    fn test_hash_is_cached() {
        with_vm(MIN_HEAP_CAPACITY, |_frame| unsafe {
            let text = string("cache me").unwrap();
            assert_eq!((*text).hash, 0);
            let first = hash(text);
            assert_ne!(first, 0);
            assert_eq!((*text).hash, first);
            assert_eq!(hash(text), first);
        });
    }

    #[test]
    fn test_list_hash_caches_suffixes() {
        with_vm(MIN_HEAP_CAPACITY, |frame| unsafe {
            let inner = list(frame, number(2.0).unwrap(), ptr::null_mut()).unwrap();
            (*frame).registers[0] = inner;
            let outer = list(frame, number(1.0).unwrap(), (*frame).registers[0]).unwrap();

            let outer_hash = hash(outer);
            assert_ne!(outer_hash, 0);
            // The suffix was keyed along the way.
            let tail = (*(outer as *mut ListCell)).tail;
            assert_ne!((*tail).hash, 0);
        });
    }

    #[test]
    fn test_vector_fill_and_equality() {
        with_vm(MIN_HEAP_CAPACITY, |frame| unsafe {
            let fill = boolean(true).unwrap();
            let a = vector(frame, 3, fill).unwrap();
            (*frame).registers[0] = a;
            let b = vector(frame, 3, boolean(true).unwrap()).unwrap();

            let a = (*frame).registers[0];
            assert!(equals(a, b));
            assert_eq!(hash(a), hash(b));
            assert!(vector_elements(a).iter().all(|e| boolean_value(*e)));
        });
    }

    #[test]
    fn test_clone_shares_leaves_and_copies_aggregates() {
        with_vm(MIN_HEAP_CAPACITY, |frame| unsafe {
            let leaf = string("shared").unwrap();
            assert_eq!(clone_value(frame, leaf).unwrap(), leaf);

            (*frame).registers[0] = list(frame, leaf, ptr::null_mut()).unwrap();
            let original = (*frame).registers[0];
            let copied = clone_value(frame, original).unwrap();
            let original = (*frame).registers[0];

            assert_ne!(copied, original);
            assert!(equals(copied, original));
        });
    }

    #[test]
    fn test_clone_of_empty_list_is_null() {
        with_vm(MIN_HEAP_CAPACITY, |frame| unsafe {
            assert!(clone_value(frame, ptr::null_mut()).unwrap().is_null());
        });
    }
}
