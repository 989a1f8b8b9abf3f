//! Built-in environment provided by the root context.
//!
//! The native functions are static function objects; their executors take
//! borrowed argument references and return one owned reference (the null
//! singleton when there is no meaningful result).

use crate::core::object::{ObjRef, StaticObj, ATAN, MINUS_ONE, NULL, ONE, PI, PRINT, SIGN, ZERO};
use crate::gc::Heap;

pub(crate) type NativeFn = fn(&mut Heap, &[ObjRef]) -> ObjRef;

/// The native executor behind a static function object, if any.
pub(crate) fn native_executor(s: StaticObj) -> Option<NativeFn> {
    match s {
        StaticObj::Print => Some(builtin_print),
        StaticObj::Sign => Some(builtin_sign),
        StaticObj::Atan => Some(builtin_atan),
        _ => None,
    }
}

/// Bind the standard library into the root context's data object.
pub(crate) fn install(heap: &mut Heap, root_data: ObjRef) {
    for (name, value) in [("print", PRINT), ("sign", SIGN), ("atan", ATAN), ("pi", PI)] {
        let key = heap.alloc_string(name);
        heap.add_property(root_data, key, value, true)
            .expect("binding into a fresh root scope");
        heap.dec_ref(key);
    }
}

/// Coerce to a string representation and emit it to standard output.
fn builtin_print(heap: &mut Heap, args: &[ObjRef]) -> ObjRef {
    if let Some(&x) = args.first() {
        println!("{}", heap.to_string_value(x));
    }
    NULL
}

/// Static integer 1 / 0 / -1 by the sign of the argument's real coercion.
fn builtin_sign(heap: &mut Heap, args: &[ObjRef]) -> ObjRef {
    let Some(&x) = args.first() else { return NULL };
    match heap.get_real_value(x) {
        Some(v) if v > 0.0 => ONE,
        Some(v) if v < 0.0 => MINUS_ONE,
        Some(_) => ZERO,
        None => NULL,
    }
}

/// Two-argument arctangent.
fn builtin_atan(heap: &mut Heap, args: &[ObjRef]) -> ObjRef {
    let y = args.first().and_then(|&y| heap.get_real_value(y));
    let x = args.get(1).and_then(|&x| heap.get_real_value(x));
    match (y, x) {
        (Some(y), Some(x)) => heap.alloc_real(y.atan2(x)),
        _ => NULL,
    }
}
