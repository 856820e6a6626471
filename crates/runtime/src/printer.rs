//! Printer for Bowl values.
//!
//! Renders values in a human-readable form. This is for hosts and error
//! messages; feeding the output back through a tokenizer is not a goal.
//!
//! Forms: symbols print bare, strings quoted with `\n \t \" \\ \xNN
//! \uNNNN` escapes, lists `[1 2 3]`, maps `{k v, k v}` (entry order is
//! bucket order), vectors `#(a b c)`, functions `#<function 0x…>`,
//! libraries `#<library "name">`, and exceptions render their message and
//! recurse into the cause chain.

use crate::map_ops;
use crate::value::{boolean_value, number_value, text_str};
use bowl_core::cell::{
    ExceptionCell, FunctionCell, KIND_BOOLEAN, KIND_EXCEPTION, KIND_FUNCTION, KIND_LIBRARY,
    KIND_LIST, KIND_MAP, KIND_NUMBER, KIND_STRING, KIND_SYMBOL, KIND_VECTOR, ListCell, Ref,
    library_name, vector_elements,
};
use std::fmt::{self, Write as _};
use std::io;

/// Render `value` into a writer.
///
/// # Safety
/// `value` must be an initialized cell or null; no allocation may happen
/// while the borrowed heap data is being rendered.
pub unsafe fn dump<W: fmt::Write>(out: &mut W, value: Ref) -> fmt::Result {
    unsafe {
        if value.is_null() {
            return out.write_str("[]");
        }
        match (*value).kind {
            KIND_SYMBOL => out.write_str(text_str(value)),
            KIND_STRING => dump_quoted(out, text_str(value)),
            KIND_NUMBER => write!(out, "{}", number_value(value)),
            KIND_BOOLEAN => out.write_str(if boolean_value(value) { "true" } else { "false" }),
            KIND_LIST => {
                out.write_char('[')?;
                let mut cursor = value;
                let mut first = true;
                while !cursor.is_null() {
                    if !first {
                        out.write_char(' ')?;
                    }
                    first = false;
                    dump(out, (*(cursor as *mut ListCell)).head)?;
                    cursor = (*(cursor as *mut ListCell)).tail;
                }
                out.write_char(']')
            }
            KIND_MAP => {
                out.write_char('{')?;
                let mut first = true;
                for (key, entry_value) in map_ops::entries(value) {
                    if !first {
                        out.write_str(", ")?;
                    }
                    first = false;
                    dump(out, key)?;
                    out.write_char(' ')?;
                    dump(out, entry_value)?;
                }
                out.write_char('}')
            }
            KIND_VECTOR => {
                out.write_str("#(")?;
                for (index, element) in vector_elements(value).iter().enumerate() {
                    if index > 0 {
                        out.write_char(' ')?;
                    }
                    dump(out, *element)?;
                }
                out.write_char(')')
            }
            KIND_FUNCTION => {
                write!(out, "#<function 0x{:x}>", (*(value as *mut FunctionCell)).code)
            }
            KIND_LIBRARY => {
                out.write_str("#<library \"")?;
                out.write_str(&String::from_utf8_lossy(library_name(value)))?;
                out.write_str("\">")
            }
            KIND_EXCEPTION => {
                let cell = value as *mut ExceptionCell;
                out.write_str("#<exception ")?;
                dump(out, (*cell).message)?;
                if !(*cell).cause.is_null() {
                    out.write_str(" caused-by: ")?;
                    dump(out, (*cell).cause)?;
                }
                out.write_char('>')
            }
            kind => write!(out, "#<invalid kind {}>", kind),
        }
    }
}

fn dump_quoted<W: fmt::Write>(out: &mut W, text: &str) -> fmt::Result {
    out.write_char('"')?;
    for character in text.chars() {
        match character {
            '\n' => out.write_str("\\n")?,
            '\t' => out.write_str("\\t")?,
            '"' => out.write_str("\\\"")?,
            '\\' => out.write_str("\\\\")?,
            c if c.is_ascii_control() => write!(out, "\\x{:02x}", c as u32)?,
            c if c.is_control() => write!(out, "\\u{:04x}", c as u32)?,
            c => out.write_char(c)?,
        }
    }
    out.write_char('"')
}

/// Render `value` to a fresh string.
///
/// # Safety
/// See [`dump`].
pub unsafe fn show(value: Ref) -> String {
    let mut rendered = String::new();
    // Writing to a String cannot fail.
    let _ = unsafe { dump(&mut rendered, value) };
    rendered
}

/// Render `value` followed by a newline into a byte stream. This is what
/// hosts use to print uncaught exception chains.
///
/// # Safety
/// See [`dump`].
pub unsafe fn dump_stream<W: io::Write>(out: &mut W, value: Ref) -> io::Result<()> {
    let rendered = unsafe { show(value) };
    writeln!(out, "{}", rendered)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::with_vm;
    use crate::{map_ops, value};
    use bowl_core::heap::MIN_HEAP_CAPACITY;
    use std::ptr;

    #[test]
    fn test_show_leaves() {
        with_vm(MIN_HEAP_CAPACITY, |_frame| unsafe {
            assert_eq!(show(value::number(42.0).unwrap()), "42");
            assert_eq!(show(value::number(1.5).unwrap()), "1.5");
            assert_eq!(show(value::boolean(true).unwrap()), "true");
            assert_eq!(show(value::symbol("swap").unwrap()), "swap");
            assert_eq!(show(ptr::null_mut()), "[]");
        });
    }

    #[test]
    fn test_show_escapes_strings() {
        with_vm(MIN_HEAP_CAPACITY, |_frame| unsafe {
            let text = value::string("a\tb\n\"c\"\\ \u{7}").unwrap();
            assert_eq!(show(text), "\"a\\tb\\n\\\"c\\\"\\\\ \\x07\"");
        });
    }

    #[test]
    fn test_show_list_and_vector() {
        with_vm(MIN_HEAP_CAPACITY, |frame| unsafe {
            let mut built: Ref = ptr::null_mut();
            for index in (1..=3).rev() {
                (*frame).registers[0] = built;
                let element = value::number(f64::from(index)).unwrap();
                built = value::list(frame, element, (*frame).registers[0]).unwrap();
            }
            assert_eq!(show(built), "[1 2 3]");

            let vector = value::vector(frame, 2, value::boolean(false).unwrap()).unwrap();
            assert_eq!(show(vector), "#(false false)");
        });
    }

    #[test]
    fn test_show_map_entry() {
        with_vm(MIN_HEAP_CAPACITY, |frame| unsafe {
            (*frame).registers[0] = value::map(4).unwrap();
            let key = value::symbol("answer").unwrap();
            (*frame).registers[1] = key;
            let map = map_ops::put(
                frame,
                (*frame).registers[0],
                (*frame).registers[1],
                value::number(42.0).unwrap(),
            )
            .unwrap();
            assert_eq!(show(map), "{answer 42}");
        });
    }
}
