//! Persistent Hash Map Operations
//!
//! Maps are immutable bucketed cells: `capacity` bucket references, each
//! bucket a list alternating key, value, key, value… Every mutating
//! operation produces a new map cell; untouched buckets are copied by
//! reference, only the affected bucket is rebuilt. Keys are compared with
//! `equals`, placed by `hash(key) mod capacity`, and may never be the null
//! reference.
//!
//! The one sanctioned mutation in the value model happens here: a map cell
//! that has not been published yet (`insert_fresh`) has its buckets and
//! length written in place while it is being filled.
//!
//! GC discipline: the pure walks (`get`, `subset_of`, [`Entries`]) never
//! allocate and may hold raw references. Everything that allocates pins the
//! map, key, and value in frame registers and re-reads them after every
//! constructor call.

use crate::exception::{self, BowlResult};
use crate::frame::{Frame, with_roots};
use crate::value::{self, equals, hash};
use bowl_core::cell::{KIND_MAP, ListCell, MapCell, Ref, map_buckets, map_buckets_mut};
use std::ptr;

/// Number of key/value pairs in the map.
///
/// # Safety
/// `map` must be an initialized map cell.
pub unsafe fn length(map: Ref) -> usize {
    unsafe {
        debug_assert!((*map).kind == KIND_MAP);
        (*(map as *mut MapCell)).length as usize
    }
}

// =============================================================================
// Pure lookups
// =============================================================================

unsafe fn bucket_index(map: Ref, key: Ref) -> usize {
    unsafe {
        let capacity = (*(map as *mut MapCell)).capacity;
        (hash(key) % capacity) as usize
    }
}

// Walk a bucket's alternating key/value pairs looking for `key`.
unsafe fn bucket_find(bucket: Ref, key: Ref) -> Option<Ref> {
    unsafe {
        let mut cursor = bucket;
        while !cursor.is_null() {
            let entry_key = (*(cursor as *mut ListCell)).head;
            let value_cell = (*(cursor as *mut ListCell)).tail;
            if equals(entry_key, key) {
                return Some((*(value_cell as *mut ListCell)).head);
            }
            cursor = (*(value_cell as *mut ListCell)).tail;
        }
        None
    }
}

/// Look up `key`, or None when absent. Never allocates.
///
/// # Safety
/// `map` must be an initialized map cell; `key` non-null.
pub unsafe fn get(map: Ref, key: Ref) -> Option<Ref> {
    unsafe {
        debug_assert!((*map).kind == KIND_MAP);
        let bucket = map_buckets(map)[bucket_index(map, key)];
        bucket_find(bucket, key)
    }
}

/// Look up `key`, or `default` when absent. Callers pass the sentinel
/// value as `default` to detect absence by pointer identity.
///
/// # Safety
/// `map` must be an initialized map cell; `key` non-null.
pub unsafe fn get_or_else(map: Ref, key: Ref, default: Ref) -> Ref {
    unsafe { get(map, key).unwrap_or(default) }
}

/// Whether `key` is present.
///
/// # Safety
/// `map` must be an initialized map cell; `key` non-null.
pub unsafe fn contains(map: Ref, key: Ref) -> bool {
    unsafe { get(map, key).is_some() }
}

/// Whether every entry of `subset` is present in `superset` with an equal
/// value. Never allocates.
///
/// # Safety
/// Both must be initialized map cells.
pub unsafe fn subset_of(superset: Ref, subset: Ref) -> bool {
    unsafe {
        if length(subset) > length(superset) {
            return false;
        }
        for (key, entry_value) in entries(subset) {
            match get(superset, key) {
                Some(found) if equals(found, entry_value) => {}
                _ => return false,
            }
        }
        true
    }
}

// =============================================================================
// Entry iteration
// =============================================================================

/// Iterator over a map's entries in bucket order. Holds raw references:
/// valid only while nothing allocates.
pub(crate) struct Entries {
    map: Ref,
    bucket_index: usize,
    cursor: Ref,
}

/// Iterate the entries of `map` in bucket order, without allocating.
///
/// # Safety
/// `map` must be an initialized map cell that outlives the iterator; no
/// allocation may happen while iterating.
pub(crate) unsafe fn entries(map: Ref) -> Entries {
    Entries {
        map,
        bucket_index: 0,
        cursor: ptr::null_mut(),
    }
}

impl Iterator for Entries {
    type Item = (Ref, Ref);

    fn next(&mut self) -> Option<(Ref, Ref)> {
        unsafe {
            loop {
                if self.cursor.is_null() {
                    let buckets = map_buckets(self.map);
                    if self.bucket_index >= buckets.len() {
                        return None;
                    }
                    self.cursor = buckets[self.bucket_index];
                    self.bucket_index += 1;
                    continue;
                }
                let key = (*(self.cursor as *mut ListCell)).head;
                let value_cell = (*(self.cursor as *mut ListCell)).tail;
                let entry_value = (*(value_cell as *mut ListCell)).head;
                self.cursor = (*(value_cell as *mut ListCell)).tail;
                return Some((key, entry_value));
            }
        }
    }
}

/// The entry at (bucket, position), re-walked from the map cell each call
/// so the caller may allocate between calls as long as it re-reads the map
/// from a register.
pub(crate) unsafe fn entry_at(
    map: Ref,
    bucket_index: usize,
    entry_index: usize,
) -> Option<(Ref, Ref)> {
    unsafe {
        let mut cursor = map_buckets(map)[bucket_index];
        let mut remaining = entry_index;
        while !cursor.is_null() {
            let key = (*(cursor as *mut ListCell)).head;
            let value_cell = (*(cursor as *mut ListCell)).tail;
            if remaining == 0 {
                return Some((key, (*(value_cell as *mut ListCell)).head));
            }
            remaining -= 1;
            cursor = (*(value_cell as *mut ListCell)).tail;
        }
        None
    }
}

// =============================================================================
// Bucket rebuilding
// =============================================================================

// Rebuild `bucket` without the pair keyed by `key`. Returns the input
// bucket unchanged (shared) when the key is absent; otherwise a fresh
// bucket list and `true`. Surviving pairs end up in reverse walk order,
// which nothing observes.
unsafe fn bucket_without(frame: *mut Frame, bucket: Ref, key: Ref) -> Result<(Ref, bool), Ref> {
    unsafe {
        if bucket_find(bucket, key).is_none() {
            return Ok((bucket, false));
        }
        let rebuilt = with_roots(frame, [bucket, key, ptr::null_mut()], |child| {
            // registers: 0 = cursor, 1 = key, 2 = rebuilt bucket
            loop {
                let cursor = (*child).registers[0];
                if cursor.is_null() {
                    break;
                }
                let entry_key = (*(cursor as *mut ListCell)).head;
                let value_cell = (*(cursor as *mut ListCell)).tail;
                if equals(entry_key, (*child).registers[1]) {
                    (*child).registers[0] = (*(value_cell as *mut ListCell)).tail;
                    continue;
                }

                let entry_value = (*(value_cell as *mut ListCell)).head;
                let with_value = value::list(child, entry_value, (*child).registers[2])?;
                (*child).registers[2] = with_value;

                let cursor = (*child).registers[0];
                let entry_key = (*(cursor as *mut ListCell)).head;
                let with_key = value::list(child, entry_key, (*child).registers[2])?;
                (*child).registers[2] = with_key;

                let cursor = (*child).registers[0];
                let value_cell = (*(cursor as *mut ListCell)).tail;
                (*child).registers[0] = (*(value_cell as *mut ListCell)).tail;
            }
            Ok((*child).registers[2])
        })?;
        Ok((rebuilt, true))
    }
}

/// Insert into a map cell that is still under construction, mutating it in
/// place and returning its (possibly moved) address. Replaces an existing
/// pair; bumps `length` otherwise.
pub(crate) unsafe fn insert_fresh(
    frame: *mut Frame,
    map: Ref,
    key: Ref,
    entry_value: Ref,
) -> Result<Ref, Ref> {
    unsafe {
        with_roots(frame, [map, key, entry_value], |child| {
            let index = bucket_index((*child).registers[0], (*child).registers[1]);
            let bucket = map_buckets((*child).registers[0])[index];
            let (bucket, replaced) = bucket_without(child, bucket, (*child).registers[1])?;

            with_roots(child, [bucket, ptr::null_mut(), ptr::null_mut()], |inner| {
                let with_value =
                    value::list(inner, (*child).registers[2], (*inner).registers[0])?;
                let with_key = value::list(inner, (*child).registers[1], with_value)?;

                let map = (*child).registers[0];
                map_buckets_mut(map)[index] = with_key;
                if !replaced {
                    (*(map as *mut MapCell)).length += 1;
                }
                Ok(map)
            })
        })
    }
}

// Copy every entry of `map` into a fresh map with `capacity` buckets.
unsafe fn rebuild(frame: *mut Frame, map: Ref, capacity: usize) -> Result<Ref, Ref> {
    unsafe {
        with_roots(frame, [map, ptr::null_mut(), ptr::null_mut()], |child| {
            let fresh = value::map(capacity)?;
            (*child).registers[1] = fresh;

            let bucket_count = (*((*child).registers[0] as *mut MapCell)).capacity as usize;
            for bucket in 0..bucket_count {
                let mut entry = 0;
                while let Some((key, entry_value)) = entry_at((*child).registers[0], bucket, entry)
                {
                    let updated =
                        insert_fresh(child, (*child).registers[1], key, entry_value)?;
                    (*child).registers[1] = updated;
                    entry += 1;
                }
            }
            Ok((*child).registers[1])
        })
    }
}

// =============================================================================
// Functional updates
// =============================================================================

/// Functional insert: a new map with `key` bound to `entry_value`. Grows
/// to the next power of two ≥ 2·length when the update would push the load
/// factor past 3/4.
///
/// # Safety
/// `frame` must be a valid linked frame; `map` an initialized map cell;
/// `key` non-null.
pub unsafe fn put(frame: *mut Frame, map: Ref, key: Ref, entry_value: Ref) -> Result<Ref, Ref> {
    unsafe {
        debug_assert!((*map).kind == KIND_MAP);
        if key.is_null() {
            return Err(exception::format_exception(
                frame,
                format_args!("put: the key must not be the empty list"),
            ));
        }
        with_roots(frame, [map, key, entry_value], |child| {
            let source = (*child).registers[0];
            let present = contains(source, (*child).registers[1]);
            let new_length = length(source) + usize::from(!present);
            let capacity = (*(source as *mut MapCell)).capacity as usize;

            let target = if new_length * 4 > capacity * 3 {
                rebuild(child, source, (new_length * 2).next_power_of_two())?
            } else {
                // Same capacity: share every bucket by reference; the
                // insert below rebuilds only the affected one.
                let fresh = value::map(capacity)?;
                let source = (*child).registers[0];
                map_buckets_mut(fresh).copy_from_slice(map_buckets(source));
                (*(fresh as *mut MapCell)).length = (*(source as *mut MapCell)).length;
                fresh
            };
            insert_fresh(child, target, (*child).registers[1], (*child).registers[2])
        })
    }
}

/// Functional delete: a new map without `key`, capacity unchanged. Returns
/// the input map itself when the key is absent.
///
/// # Safety
/// `frame` must be a valid linked frame; `map` an initialized map cell;
/// `key` non-null.
pub unsafe fn delete(frame: *mut Frame, map: Ref, key: Ref) -> Result<Ref, Ref> {
    unsafe {
        debug_assert!((*map).kind == KIND_MAP);
        if !contains(map, key) {
            return Ok(map);
        }
        with_roots(frame, [map, key, ptr::null_mut()], |child| {
            let source = (*child).registers[0];
            let index = bucket_index(source, (*child).registers[1]);
            let capacity = (*(source as *mut MapCell)).capacity as usize;

            let fresh = value::map(capacity)?;
            let source = (*child).registers[0];
            map_buckets_mut(fresh).copy_from_slice(map_buckets(source));
            (*(fresh as *mut MapCell)).length = (*(source as *mut MapCell)).length;
            (*child).registers[2] = fresh;

            let bucket = map_buckets((*child).registers[0])[index];
            let (bucket, removed) = bucket_without(child, bucket, (*child).registers[1])?;
            debug_assert!(removed);

            let fresh = (*child).registers[2];
            map_buckets_mut(fresh)[index] = bucket;
            (*(fresh as *mut MapCell)).length -= 1;
            Ok(fresh)
        })
    }
}

/// Merge: every entry of `b` put into a copy of `a`; `b` wins on keys
/// present in both. The result's capacity fits `a.length + b.length`
/// without exceeding the load factor.
///
/// # Safety
/// `frame` must be a valid linked frame; `a` and `b` initialized map
/// cells.
pub unsafe fn merge(frame: *mut Frame, a: Ref, b: Ref) -> Result<Ref, Ref> {
    unsafe {
        debug_assert!((*a).kind == KIND_MAP && (*b).kind == KIND_MAP);
        with_roots(frame, [a, b, ptr::null_mut()], |child| {
            let total = length(a) + length(b);
            let mut capacity = 1usize;
            while total * 4 > capacity * 3 {
                capacity *= 2;
            }

            let merged = rebuild(child, (*child).registers[0], capacity)?;
            (*child).registers[2] = merged;

            let bucket_count = (*((*child).registers[1] as *mut MapCell)).capacity as usize;
            for bucket in 0..bucket_count {
                let mut entry = 0;
                while let Some((key, entry_value)) =
                    entry_at((*child).registers[1], bucket, entry)
                {
                    let updated =
                        insert_fresh(child, (*child).registers[2], key, entry_value)?;
                    (*child).registers[2] = updated;
                    entry += 1;
                }
            }
            Ok((*child).registers[2])
        })
    }
}

// =============================================================================
// FFI
// =============================================================================

/// Functional insert.
///
/// # Safety
/// See [`put`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bowl_map_put(
    frame: *mut Frame,
    map: Ref,
    key: Ref,
    value: Ref,
) -> BowlResult {
    unsafe { put(frame, map, key, value).into() }
}

/// Lookup with a caller-provided default.
///
/// # Safety
/// See [`get_or_else`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bowl_map_get_or_else(
    _frame: *mut Frame,
    map: Ref,
    key: Ref,
    default: Ref,
) -> Ref {
    unsafe { get_or_else(map, key, default) }
}

/// Functional delete.
///
/// # Safety
/// See [`delete`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bowl_map_delete(frame: *mut Frame, map: Ref, key: Ref) -> BowlResult {
    unsafe { delete(frame, map, key).into() }
}

/// Merge two maps; the second wins on shared keys.
///
/// # Safety
/// See [`merge`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bowl_map_merge(frame: *mut Frame, a: Ref, b: Ref) -> BowlResult {
    unsafe { merge(frame, a, b).into() }
}

/// Entry-wise subset test.
///
/// # Safety
/// See [`subset_of`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bowl_map_subset_of(superset: Ref, subset: Ref) -> bool {
    unsafe { subset_of(superset, subset) }
}

// =============================================================================
// Tests
// =============================================================================
