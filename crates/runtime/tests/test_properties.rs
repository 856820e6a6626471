//! Property tests for the universal runtime invariants
//!
//! Values are generated as plain Rust shape descriptions ([`Shape`]) and only
//! materialized in the heap inside a booted VM, so shrinking never touches
//! live heap state.

mod common;

use bowl_runtime::{Frame, Ref, byte_size, frame, value};
use common::with_vm;
use proptest::prelude::*;

const TEST_HEAP: usize = 1 << 16;

/// A heap value described in pure Rust.
#[derive(Debug, Clone)]
enum Shape {
    Number(f64),
    Boolean(bool),
    Symbol(String),
    Text(String),
    List(Vec<Shape>),
    Vector(Box<Shape>, usize),
    Map(Vec<(Shape, Shape)>),
}

/// Materialize a shape in the heap. The result is raw: the caller pins it
/// before the next allocation.
unsafe fn build(frame: *mut Frame, shape: &Shape) -> Ref {
    unsafe {
        match shape {
            Shape::Number(number) => value::number(*number).unwrap(),
            Shape::Boolean(boolean) => value::boolean(*boolean).unwrap(),
            Shape::Symbol(name) => value::symbol(name).unwrap(),
            Shape::Text(text) => value::string(text).unwrap(),
            Shape::List(items) => {
                let mut child = Frame::inheriting(frame);
                let child = &mut child as *mut Frame;
                frame::link(child);
                for item in items.iter().rev() {
                    let element = build(child, item);
                    let cell = value::list(child, element, (*child).registers[0]).unwrap();
                    (*child).registers[0] = cell;
                }
                let built = (*child).registers[0];
                frame::unlink(child);
                built
            }
            Shape::Vector(fill, length) => {
                let fill = build(frame, fill);
                value::vector(frame, *length, fill).unwrap()
            }
            Shape::Map(pairs) => {
                let mut child = Frame::inheriting(frame);
                let child = &mut child as *mut Frame;
                frame::link(child);
                (*child).registers[0] = value::map(4).unwrap();
                for (key, entry_value) in pairs {
                    let key = build(child, key);
                    (*child).registers[1] = key;
                    let entry_value = build(child, entry_value);
                    (*child).registers[2] = entry_value;
                    let updated = bowl_runtime::map_put(
                        child,
                        (*child).registers[0],
                        (*child).registers[1],
                        (*child).registers[2],
                    )
                    .unwrap();
                    (*child).registers[0] = updated;
                }
                let built = (*child).registers[0];
                frame::unlink(child);
                built
            }
        }
    }
}

// Map keys must never be the empty list, so keys come from the leaves.
fn key_shape() -> impl Strategy<Value = Shape> {
    prop_oneof![
        any::<f64>().prop_map(Shape::Number),
        any::<bool>().prop_map(Shape::Boolean),
        "[a-z]{1,6}".prop_map(Shape::Symbol),
        "[a-z]{0,6}".prop_map(Shape::Text),
    ]
}

fn shape() -> impl Strategy<Value = Shape> {
    key_shape().prop_recursive(3, 16, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Shape::List),
            (inner.clone(), 0..4usize)
                .prop_map(|(fill, length)| Shape::Vector(Box::new(fill), length)),
            prop::collection::vec((key_shape(), inner), 0..4).prop_map(Shape::Map),
        ]
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    // P1: equals(a, b) ⇒ hash(a) == hash(b). Two builds of the same shape
    // are the equality witness; independent shapes probe the implication.
    #[test]
    fn p1_hash_equals_law(a in shape(), b in shape()) {
        with_vm(TEST_HEAP, |frame| unsafe {
            (*frame).registers[0] = build(frame, &a);
            (*frame).registers[1] = build(frame, &b);
            let twin = build(frame, &a);

            let first = (*frame).registers[0];
            let second = (*frame).registers[1];
            assert!(value::equals(first, twin));
            assert_eq!(value::hash(first), value::hash(twin));

            if value::equals(first, second) {
                assert_eq!(value::hash(first), value::hash(second));
            }
        });
    }

    // P2: byte_size is at least the header and is exactly what one
    // collection copy moves for a single rooted leaf.
    #[test]
    fn p2_size_law(leaf in key_shape()) {
        with_vm(TEST_HEAP, |frame| unsafe {
            (*frame).registers[0] = build(frame, &leaf);
            let size = byte_size((*frame).registers[0]);
            assert!(size >= bowl_core::cell::HEADER_SIZE);

            bowl_runtime::collect().unwrap();
            let moved = bowl_runtime::heap_used();
            let size = byte_size((*frame).registers[0]);
            assert_eq!(moved, bowl_core::cell::align_size(size));
        });
    }

    // P3: get_or_else(put(m, k, v), k, ⊥) == v
    #[test]
    fn p3_put_get(
        pairs in prop::collection::vec((key_shape(), shape()), 0..4),
        key in key_shape(),
        entry in shape(),
    ) {
        with_vm(TEST_HEAP, |frame| unsafe {
            (*frame).registers[0] = build(frame, &Shape::Map(pairs));
            (*frame).registers[1] = build(frame, &key);
            (*frame).registers[2] = build(frame, &entry);

            let updated = bowl_runtime::map_put(
                frame,
                (*frame).registers[0],
                (*frame).registers[1],
                (*frame).registers[2],
            )
            .unwrap();

            let found = bowl_runtime::map_get_or_else(
                updated,
                (*frame).registers[1],
                bowl_runtime::sentinel_value(),
            );
            assert!(value::equals(found, (*frame).registers[2]));
        });
    }

    // P4: get_or_else(delete(put(m, k, v), k), k, sentinel) == sentinel
    #[test]
    fn p4_delete_get(
        pairs in prop::collection::vec((key_shape(), shape()), 0..4),
        key in key_shape(),
        entry in shape(),
    ) {
        with_vm(TEST_HEAP, |frame| unsafe {
            (*frame).registers[0] = build(frame, &Shape::Map(pairs));
            (*frame).registers[1] = build(frame, &key);
            let entry = build(frame, &entry);

            let updated = bowl_runtime::map_put(
                frame,
                (*frame).registers[0],
                (*frame).registers[1],
                entry,
            )
            .unwrap();
            (*frame).registers[0] = updated;

            let smaller = bowl_runtime::map_delete(
                frame,
                (*frame).registers[0],
                (*frame).registers[1],
            )
            .unwrap();

            let found = bowl_runtime::map_get_or_else(
                smaller,
                (*frame).registers[1],
                bowl_runtime::sentinel_value(),
            );
            assert_eq!(found, bowl_runtime::sentinel_value());
        });
    }

    // P5: put(put(m, k, v), k, v) ≡ put(m, k, v)
    #[test]
    fn p5_idempotent_put(
        pairs in prop::collection::vec((key_shape(), shape()), 0..4),
        key in key_shape(),
        entry in shape(),
    ) {
        with_vm(TEST_HEAP, |frame| unsafe {
            (*frame).registers[0] = build(frame, &Shape::Map(pairs));
            (*frame).registers[1] = build(frame, &key);
            (*frame).registers[2] = build(frame, &entry);

            let once = bowl_runtime::map_put(
                frame,
                (*frame).registers[0],
                (*frame).registers[1],
                (*frame).registers[2],
            )
            .unwrap();
            (*frame).registers[0] = once;

            let twice = bowl_runtime::map_put(
                frame,
                (*frame).registers[0],
                (*frame).registers[1],
                (*frame).registers[2],
            )
            .unwrap();

            assert!(value::equals((*frame).registers[0], twice));
            assert_eq!(value::hash((*frame).registers[0]), value::hash(twice));
        });
    }

    // P6: merging maps with disjoint keys adds lengths and every entry of
    // both stays retrievable.
    #[test]
    fn p6_merge_disjoint(left_count in 0..5usize, right_count in 0..5usize) {
        with_vm(TEST_HEAP, |frame| unsafe {
            let left: Vec<(Shape, Shape)> = (0..left_count)
                .map(|index| {
                    (
                        Shape::Symbol(format!("left-{}", index)),
                        Shape::Number(index as f64),
                    )
                })
                .collect();
            let right: Vec<(Shape, Shape)> = (0..right_count)
                .map(|index| {
                    (
                        Shape::Symbol(format!("right-{}", index)),
                        Shape::Number(100.0 + index as f64),
                    )
                })
                .collect();

            (*frame).registers[0] = build(frame, &Shape::Map(left));
            (*frame).registers[1] = build(frame, &Shape::Map(right));

            let merged = bowl_runtime::map_merge(
                frame,
                (*frame).registers[0],
                (*frame).registers[1],
            )
            .unwrap();
            (*frame).registers[2] = merged;

            let merged = (*frame).registers[2];
            assert_eq!(
                bowl_runtime::map_length(merged),
                left_count + right_count
            );
            assert!(bowl_runtime::map_subset_of(merged, (*frame).registers[0]));
            assert!(bowl_runtime::map_subset_of(merged, (*frame).registers[1]));
        });
    }

    // P7: reverse(reverse(xs)) ≡ xs and reversal preserves length.
    #[test]
    fn p7_reverse_involution(items in prop::collection::vec(shape(), 0..6)) {
        with_vm(TEST_HEAP, |frame| unsafe {
            (*frame).registers[0] = build(frame, &Shape::List(items));

            let reversed = bowl_runtime::reverse(frame, (*frame).registers[0]).unwrap();
            (*frame).registers[1] = reversed;
            assert_eq!(
                bowl_runtime::list_length((*frame).registers[0]),
                bowl_runtime::list_length((*frame).registers[1]),
            );

            let roundtrip = bowl_runtime::reverse(frame, (*frame).registers[1]).unwrap();
            assert!(value::equals((*frame).registers[0], roundtrip));
        });
    }

    // P8: a forced collection preserves everything reachable from the
    // roots, compared against a rebuild of the same description.
    #[test]
    fn p8_collection_preserves_reachables(description in shape()) {
        with_vm(TEST_HEAP, |frame| unsafe {
            let original = build(frame, &description);
            bowl_runtime::push(frame, original).unwrap();

            bowl_runtime::collect().unwrap();

            let snapshot = build(frame, &description);
            let survivor = bowl_runtime::peek(frame, "p8").unwrap();
            assert!(value::equals(survivor, snapshot));
        });
    }

    // P9: abandoning N cells recovers at least their bytes.
    #[test]
    fn p9_collection_reclaims_unreachables(count in 1..48usize) {
        with_vm(TEST_HEAP, |_frame| unsafe {
            let cell_size =
                bowl_core::cell::align_size(std::mem::size_of::<bowl_core::cell::NumberCell>());
            for index in 0..count {
                let _ = value::number(index as f64).unwrap();
            }
            let before = bowl_runtime::heap_used();

            bowl_runtime::collect().unwrap();

            let recovered = before - bowl_runtime::heap_used();
            assert!(recovered >= count * cell_size);
        });
    }

    // P10: with no mutator activity between them, a second collection
    // keeps every live cell at the same relative position.
    #[test]
    fn p10_forwarding_idempotence(count in 1..8usize) {
        with_vm(TEST_HEAP, |frame| unsafe {
            for index in 0..count {
                let number = value::number(index as f64).unwrap();
                bowl_runtime::push(frame, number).unwrap();
            }

            bowl_runtime::collect().unwrap();
            let first = spine_addresses(*(*frame).datastack);

            bowl_runtime::collect().unwrap();
            let second = spine_addresses(*(*frame).datastack);

            let first_deltas: Vec<isize> =
                first.windows(2).map(|pair| pair[1] - pair[0]).collect();
            let second_deltas: Vec<isize> =
                second.windows(2).map(|pair| pair[1] - pair[0]).collect();
            assert_eq!(first_deltas, second_deltas);
        });
    }
}

// The addresses of every cell on the datastack spine, in stack order.
unsafe fn spine_addresses(list: Ref) -> Vec<isize> {
    unsafe {
        let mut addresses = Vec::new();
        let mut cursor = list;
        while !cursor.is_null() {
            addresses.push(cursor as isize);
            addresses.push(bowl_runtime::head(cursor) as isize);
            cursor = bowl_runtime::tail(cursor);
        }
        addresses
    }
}

// A non-proptest sanity check that the builder itself round-trips.
#[test]
fn builder_produces_equal_values_for_equal_shapes() {
    with_vm(TEST_HEAP, |frame| unsafe {
        let description = Shape::Map(vec![
            (Shape::Symbol("a".into()), Shape::Number(1.0)),
            (
                Shape::Text("b".into()),
                Shape::List(vec![Shape::Boolean(true), Shape::Number(f64::NAN)]),
            ),
        ]);
        (*frame).registers[0] = build(frame, &description);
        let twin = build(frame, &description);
        assert!(value::equals((*frame).registers[0], twin));
        assert_eq!(value::hash((*frame).registers[0]), value::hash(twin));
    });
}
