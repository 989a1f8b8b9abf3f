//! End-to-end interpreter tests.
//!
//! These tests verify:
//!   • Arithmetic, variable declaration and lookup
//!   • Lexical scoping through ENTER / LEAVE and closure capture
//!   • String literals and concatenation
//!   • Built-in calls and the static result singletons
//!   • Assignment semantics of STORE (outer write vs. implicit declaration)
//!   • The fault taxonomy: bad bytecode, constants, unsupported operations
//!   • Round-robin interleaving across threads
//!   • Refcount soundness after the final sweep

use goat::core::object::{ObjRef, MINUS_ONE, NULL, PI};
use goat::errors::{BadBytecode, VmError};
use goat::{run, BytecodeImage, ImageBuilder, Opcode, Process, RunConfig};

// ─── Helpers ──────────────────────────────────────────────────────────────────

fn build(f: impl FnOnce(&mut ImageBuilder)) -> BytecodeImage {
    let mut b = ImageBuilder::new();
    f(&mut b);
    b.finish()
}

fn run_program(f: impl FnOnce(&mut ImageBuilder)) -> (Process, Result<i32, VmError>) {
    let image = build(f);
    let mut process = Process::new(RunConfig::default());
    let result = run(&mut process, &image);
    (process, result)
}

/// Live objects in a process that has run nothing: the root scope's data
/// object plus its binding keys.
fn baseline() -> usize {
    Process::new(RunConfig::default()).live_objects()
}

fn top_int(p: &mut Process) -> Option<i64> {
    let top = p.main_thread().stack.peek(0)?;
    p.heap.get_integer_value(top)
}

// ─── Scenario A: arithmetic ───────────────────────────────────────────────────

#[test]
fn adds_two_integers_and_sweeps_clean() {
    let (mut p, result) = run_program(|b| {
        b.emit(Opcode::ILoad32, 0, 2);
        b.emit(Opcode::ILoad32, 0, 3);
        b.emit(Opcode::Add, 0, 0);
        b.emit(Opcode::End, 0, 0);
    });
    assert_eq!(result, Ok(0));
    assert_eq!(p.main_thread().stack.len(), 1);
    assert_eq!(top_int(&mut p), Some(5));

    let top = p.main_thread().stack.pop().unwrap();
    p.heap.dec_ref(top);
    p.collect_garbage();
    assert_eq!(p.live_objects(), baseline());
}

#[test]
fn subtracts_two_integers() {
    let (mut p, result) = run_program(|b| {
        b.emit(Opcode::ILoad32, 0, 7);
        b.emit(Opcode::ILoad32, 0, 2);
        b.emit(Opcode::Sub, 0, 0);
        b.emit(Opcode::End, 0, 0);
    });
    assert_eq!(result, Ok(0));
    assert_eq!(top_int(&mut p), Some(5));
}

// ─── Scenario B: variable declaration and load ────────────────────────────────

#[test]
fn declares_and_loads_a_variable() {
    let (mut p, result) = run_program(|b| {
        let x = b.intern("x");
        b.emit(Opcode::ILoad32, 0, 42);
        b.emit(Opcode::Var, 0, x);
        b.emit(Opcode::VLoad, 0, x);
        b.emit(Opcode::End, 0, 0);
    });
    assert_eq!(result, Ok(0));
    assert_eq!(top_int(&mut p), Some(42));
}

#[test]
fn loading_an_unbound_name_yields_null() {
    let (mut p, result) = run_program(|b| {
        let ghost = b.intern("ghost");
        b.emit(Opcode::VLoad, 0, ghost);
        b.emit(Opcode::End, 0, 0);
    });
    assert_eq!(result, Ok(0));
    assert_eq!(p.main_thread().stack.peek(0), Some(NULL));
}

// ─── Scenario C: scoping ──────────────────────────────────────────────────────

#[test]
fn leave_yields_the_scope_and_unbinds_its_names() {
    let (mut p, result) = run_program(|b| {
        let x = b.intern("x");
        b.emit(Opcode::Enter, 0, 0);
        b.emit(Opcode::ILoad32, 0, 1);
        b.emit(Opcode::Var, 0, x);
        b.emit(Opcode::Leave, 0, 0);
        b.emit(Opcode::VLoad, 0, x);
        b.emit(Opcode::End, 0, 0);
    });
    assert_eq!(result, Ok(0));

    // outer VLOAD resolved to null: the inner context is gone
    assert_eq!(p.main_thread().stack.peek(0), Some(NULL));

    // but the scope object itself is on the stack, with x = 1 visible
    let scope = p.main_thread().stack.peek(1).expect("scope object");
    assert!(matches!(scope, ObjRef::Dynamic(_)));
    let key = p.heap.alloc_string("x");
    let value = p.heap.resolve_property(scope, key).expect("x on the scope");
    assert_eq!(p.heap.get_integer_value(value), Some(1));
    p.heap.dec_ref(key);
}

// ─── Scenario D: closures ─────────────────────────────────────────────────────

#[test]
fn closure_outlives_its_scope() {
    let (mut p, result) = run_program(|b| {
        let y = b.intern("y");
        b.emit(Opcode::Enter, 0, 0); // 0
        b.emit(Opcode::ILoad32, 0, 7); // 1
        b.emit(Opcode::Var, 0, y); // 2
        b.emit(Opcode::Arg, 0, 10); // 3: entry index of the body
        b.emit(Opcode::Func, 0, 0); // 4
        b.emit(Opcode::Leave, 0, 0); // 5: stack is [fn, scope]
        b.emit(Opcode::Pop, 0, 0); // 6: drop the scope value
        b.emit(Opcode::Call, 0, 0); // 7
        b.emit(Opcode::End, 0, 0); // 8
        b.emit(Opcode::Nop, 0, 0); // 9
        b.emit(Opcode::VLoad, 0, y); // 10: function body
        b.emit(Opcode::Ret, 0, 0); // 11
    });
    assert_eq!(result, Ok(0));
    assert_eq!(p.main_thread().stack.len(), 1);
    assert_eq!(top_int(&mut p), Some(7));
}

#[test]
fn function_arguments_bind_in_order_and_missing_ones_are_null() {
    let (mut p, result) = run_program(|b| {
        let first = b.intern("first");
        let second = b.intern("second");
        b.emit(Opcode::ILoad32, 0, 30); // 0: only one operand for two names
        b.emit(Opcode::Arg, 0, 6); // 1
        b.emit(Opcode::Func, 2, first); // 2: names are first, second
        b.emit(Opcode::Call, 1, 0); // 3
        b.emit(Opcode::End, 0, 0); // 4
        b.emit(Opcode::Nop, 0, 0); // 5
        b.emit(Opcode::VLoad, 0, second); // 6: body — unbound operand
        b.emit(Opcode::Ret, 0, 0); // 7
    });
    assert_eq!(result, Ok(0));
    assert_eq!(p.main_thread().stack.peek(0), Some(NULL));
}

#[test]
fn function_computes_with_its_argument() {
    let (mut p, result) = run_program(|b| {
        let n = b.intern("n");
        b.emit(Opcode::ILoad32, 0, 4); // 0: operand
        b.emit(Opcode::Arg, 0, 6); // 1
        b.emit(Opcode::Func, 1, n); // 2
        b.emit(Opcode::Call, 1, 0); // 3
        b.emit(Opcode::End, 0, 0); // 4
        b.emit(Opcode::Nop, 0, 0); // 5
        b.emit(Opcode::VLoad, 0, n); // 6: body: n + 1
        b.emit(Opcode::ILoad32, 0, 1); // 7
        b.emit(Opcode::Add, 0, 0); // 8
        b.emit(Opcode::Ret, 0, 0); // 9
    });
    assert_eq!(result, Ok(0));
    assert_eq!(p.main_thread().stack.len(), 1);
    assert_eq!(top_int(&mut p), Some(5));
}

// ─── Scenario E: string concatenation ─────────────────────────────────────────

#[test]
fn concatenates_string_literals() {
    let (mut p, result) = run_program(|b| {
        let foo = b.intern("foo");
        let bar = b.intern("bar");
        b.emit(Opcode::SLoad, 0, foo);
        b.emit(Opcode::SLoad, 0, bar);
        b.emit(Opcode::Add, 0, 0);
        b.emit(Opcode::End, 0, 0);
    });
    assert_eq!(result, Ok(0));
    assert_eq!(p.main_thread().stack.len(), 1);
    let top = p.main_thread().stack.peek(0).unwrap();
    assert!(matches!(top, ObjRef::Dynamic(_)));
    assert_eq!(p.heap.string_text(top), Some("foobar"));
    assert_eq!(p.heap.string_chars(top), Some(6));
}

// ─── Scenario F: built-in calls ───────────────────────────────────────────────

#[test]
fn sign_of_a_negative_real_is_the_minus_one_singleton() {
    let image = build(|b| {
        let sign = b.intern("sign");
        b.emit(Opcode::VLoad, 0, sign);
        b.emit(Opcode::Call, 1, 0);
        b.emit(Opcode::End, 0, 0);
    });
    let mut p = Process::new(RunConfig::default());
    let arg = p.heap.alloc_real(-3.5);
    p.main_thread().stack.push(arg);

    let result = run(&mut p, &image);
    assert_eq!(result, Ok(0));
    assert_eq!(p.main_thread().stack.peek(0), Some(MINUS_ONE));
}

#[test]
fn atan_produces_a_dynamic_real() {
    let (mut p, result) = run_program(|b| {
        let atan = b.intern("atan");
        b.emit(Opcode::ILoad32, 0, 1);
        b.emit(Opcode::ILoad32, 0, 1);
        b.emit(Opcode::VLoad, 0, atan);
        b.emit(Opcode::Call, 2, 0);
        b.emit(Opcode::End, 0, 0);
    });
    assert_eq!(result, Ok(0));
    let top = p.main_thread().stack.peek(0).unwrap();
    let value = p.heap.get_real_value(top).expect("a real result");
    assert!((value - std::f64::consts::FRAC_PI_4).abs() < 1e-12);
}

#[test]
fn print_returns_null() {
    let (mut p, result) = run_program(|b| {
        let msg = b.intern("hello from goat");
        let print = b.intern("print");
        b.emit(Opcode::SLoad, 0, msg);
        b.emit(Opcode::VLoad, 0, print);
        b.emit(Opcode::Call, 1, 0);
        b.emit(Opcode::End, 0, 0);
    });
    assert_eq!(result, Ok(0));
    assert_eq!(p.main_thread().stack.peek(0), Some(NULL));
}

#[test]
fn pi_resolves_to_the_static_real() {
    let (mut p, result) = run_program(|b| {
        let pi = b.intern("pi");
        b.emit(Opcode::VLoad, 0, pi);
        b.emit(Opcode::End, 0, 0);
    });
    assert_eq!(result, Ok(0));
    assert_eq!(p.main_thread().stack.peek(0), Some(PI));
}

#[test]
fn a_function_returned_from_a_function_keeps_its_environment() {
    let (mut p, result) = run_program(|b| {
        let y = b.intern("y");
        b.emit(Opcode::Arg, 0, 8); // 0: entry of the outer body
        b.emit(Opcode::Func, 0, 0); // 1
        b.emit(Opcode::Call, 0, 0); // 2: produces the inner function
        b.emit(Opcode::Call, 0, 0); // 3: calls it after the outer frame died
        b.emit(Opcode::End, 0, 0); // 4
        b.emit(Opcode::Nop, 0, 0); // 5
        b.emit(Opcode::Nop, 0, 0); // 6
        b.emit(Opcode::Nop, 0, 0); // 7
        b.emit(Opcode::ILoad32, 0, 7); // 8: outer body
        b.emit(Opcode::Var, 0, y); // 9
        b.emit(Opcode::Arg, 0, 13); // 10
        b.emit(Opcode::Func, 0, 0); // 11: inner closes over the outer frame
        b.emit(Opcode::Ret, 0, 0); // 12
        b.emit(Opcode::VLoad, 0, y); // 13: inner body
        b.emit(Opcode::Ret, 0, 0); // 14
    });
    assert_eq!(result, Ok(0));
    assert_eq!(p.main_thread().stack.len(), 1);
    assert_eq!(top_int(&mut p), Some(7));
}

#[test]
fn nested_calls_stack_their_frames() {
    let (mut p, result) = run_program(|b| {
        let a = b.intern("a");
        b.emit(Opcode::ILoad32, 0, 5); // 0: operand of the outer call
        b.emit(Opcode::Arg, 0, 8); // 1
        b.emit(Opcode::Func, 1, a); // 2
        b.emit(Opcode::Call, 1, 0); // 3
        b.emit(Opcode::End, 0, 0); // 4
        b.emit(Opcode::Nop, 0, 0); // 5
        b.emit(Opcode::Nop, 0, 0); // 6
        b.emit(Opcode::Nop, 0, 0); // 7
        b.emit(Opcode::VLoad, 0, a); // 8: outer body — a + 1
        b.emit(Opcode::ILoad32, 0, 1); // 9
        b.emit(Opcode::Add, 0, 0); // 10
        b.emit(Opcode::Arg, 0, 16); // 11
        b.emit(Opcode::Func, 1, a); // 12: inner binds its own a
        b.emit(Opcode::Call, 1, 0); // 13
        b.emit(Opcode::Ret, 0, 0); // 14: pass the inner result through
        b.emit(Opcode::Nop, 0, 0); // 15
        b.emit(Opcode::VLoad, 0, a); // 16: inner body — a + 2
        b.emit(Opcode::ILoad32, 0, 2); // 17
        b.emit(Opcode::Add, 0, 0); // 18
        b.emit(Opcode::Ret, 0, 0); // 19
    });
    assert_eq!(result, Ok(0));
    assert_eq!(p.main_thread().stack.len(), 1);
    assert_eq!(top_int(&mut p), Some(8)); // (5 + 1) + 2
}

#[test]
fn callee_locals_do_not_leak_into_the_caller() {
    let (mut p, result) = run_program(|b| {
        let z = b.intern("z");
        b.emit(Opcode::Arg, 0, 6); // 0
        b.emit(Opcode::Func, 0, 0); // 1
        b.emit(Opcode::Call, 0, 0); // 2
        b.emit(Opcode::Pop, 0, 0); // 3: discard the (null) return value
        b.emit(Opcode::VLoad, 0, z); // 4
        b.emit(Opcode::End, 0, 0); // 5
        b.emit(Opcode::ILoad32, 0, 3); // 6: body declares a local
        b.emit(Opcode::Var, 0, z); // 7
        b.emit(Opcode::Ret, 0, 0); // 8: no value above the unwind point
    });
    assert_eq!(result, Ok(0));
    assert_eq!(p.main_thread().stack.peek(0), Some(NULL));
}

// ─── STORE semantics ──────────────────────────────────────────────────────────

#[test]
fn store_assigns_through_the_scope_chain() {
    let (mut p, result) = run_program(|b| {
        let x = b.intern("x");
        b.emit(Opcode::ILoad32, 0, 1);
        b.emit(Opcode::Var, 0, x);
        b.emit(Opcode::Enter, 0, 0);
        b.emit(Opcode::ILoad32, 0, 2);
        b.emit(Opcode::Store, 0, x); // writes the outer x
        b.emit(Opcode::Pop, 0, 0); // assignment value stays, drop it
        b.emit(Opcode::Leave, 0, 0);
        b.emit(Opcode::Pop, 0, 0);
        b.emit(Opcode::VLoad, 0, x);
        b.emit(Opcode::End, 0, 0);
    });
    assert_eq!(result, Ok(0));
    assert_eq!(top_int(&mut p), Some(2));
}

#[test]
fn store_declares_when_the_name_is_absent() {
    let (mut p, result) = run_program(|b| {
        let fresh = b.intern("fresh");
        b.emit(Opcode::ILoad32, 0, 9);
        b.emit(Opcode::Store, 0, fresh);
        b.emit(Opcode::End, 0, 0);
    });
    assert_eq!(result, Ok(0));
    // the assignment expression value stayed on the stack
    assert_eq!(top_int(&mut p), Some(9));

    let key = p.heap.alloc_string("fresh");
    let root = p.root_data();
    let stored = p.heap.get_property(root, key).expect("declared on the root scope");
    assert_eq!(p.heap.get_integer_value(stored), Some(9));
    p.heap.dec_ref(key);
}

// ─── Wide immediates ──────────────────────────────────────────────────────────

#[test]
fn iload64_combines_the_arg_word() {
    let value: i64 = 0x0000_0001_0000_0002;
    let (mut p, result) = run_program(|b| {
        b.emit(Opcode::Arg, 0, (value & 0xffff_ffff) as u32);
        b.emit(Opcode::ILoad64, 0, (value >> 32) as u32);
        b.emit(Opcode::End, 0, 0);
    });
    assert_eq!(result, Ok(0));
    assert_eq!(top_int(&mut p), Some(value));
}

#[test]
fn iload64_of_minus_one_lands_on_the_singleton() {
    let (mut p, result) = run_program(|b| {
        b.emit(Opcode::Arg, 0, u32::MAX);
        b.emit(Opcode::ILoad64, 0, u32::MAX);
        b.emit(Opcode::End, 0, 0);
    });
    assert_eq!(result, Ok(0));
    assert_eq!(p.main_thread().stack.peek(0), Some(MINUS_ONE));
}

// ─── Fault taxonomy ───────────────────────────────────────────────────────────

#[test]
fn duplicate_declaration_faults() {
    let (_, result) = run_program(|b| {
        let x = b.intern("x");
        b.emit(Opcode::ILoad32, 0, 1);
        b.emit(Opcode::Var, 0, x);
        b.emit(Opcode::ILoad32, 0, 2);
        b.emit(Opcode::Var, 0, x);
        b.emit(Opcode::End, 0, 0);
    });
    assert!(matches!(result, Err(VmError::PropertyAlreadyExists(name)) if name == "x"));
}

#[test]
fn assigning_a_constant_faults() {
    let (_, result) = run_program(|b| {
        let c = b.intern("c");
        b.emit(Opcode::ILoad32, 0, 5);
        b.emit(Opcode::Const, 0, c);
        b.emit(Opcode::ILoad32, 0, 6);
        b.emit(Opcode::Store, 0, c);
        b.emit(Opcode::End, 0, 0);
    });
    let err = result.expect_err("constant assignment must fault");
    assert!(matches!(&err, VmError::PropertyIsConstant(name) if name == "c"));
    assert_eq!(err.exit_code(), 6);
}

#[test]
fn unsupported_operand_kinds_halt_with_a_failure() {
    let (_, result) = run_program(|b| {
        let s = b.intern("text");
        b.emit(Opcode::SLoad, 0, s);
        b.emit(Opcode::ILoad32, 0, 1);
        b.emit(Opcode::Sub, 0, 0);
        b.emit(Opcode::End, 0, 0);
    });
    assert!(matches!(
        result,
        Err(VmError::OperationUnsupported { op: "subtract", left: "string", right: "integer" })
    ));
}

#[test]
fn calling_a_non_function_faults() {
    let (_, result) = run_program(|b| {
        b.emit(Opcode::ILoad32, 0, 3);
        b.emit(Opcode::Call, 0, 0);
        b.emit(Opcode::End, 0, 0);
    });
    assert!(matches!(result, Err(VmError::NotCallable("integer"))));
}

#[test]
fn bad_bytecode_faults() {
    let (_, r) = run_program(|b| {
        b.emit(Opcode::Pop, 0, 0);
    });
    assert!(matches!(r, Err(VmError::BadBytecode(BadBytecode::StackUnderflow))));

    let (_, r) = run_program(|b| {
        b.emit(Opcode::SLoad, 0, 99);
    });
    assert!(matches!(r, Err(VmError::BadBytecode(BadBytecode::BadDescriptor(99)))));

    let (_, r) = run_program(|b| {
        b.emit(Opcode::ILoad64, 0, 1);
    });
    assert!(matches!(r, Err(VmError::BadBytecode(BadBytecode::MissingArg))));

    let (_, r) = run_program(|b| {
        b.emit(Opcode::Arg, 0, 1);
        b.emit(Opcode::Arg, 0, 2);
        b.emit(Opcode::Arg, 0, 3);
        b.emit(Opcode::Arg, 0, 4);
    });
    assert!(matches!(r, Err(VmError::BadBytecode(BadBytecode::ScratchOverflow))));

    let (_, r) = run_program(|b| {
        b.emit(Opcode::Ret, 0, 0);
    });
    assert!(matches!(r, Err(VmError::BadBytecode(BadBytecode::ReturnOutsideCall))));

    let (_, r) = run_program(|b| {
        b.emit(Opcode::Leave, 0, 0);
    });
    assert!(matches!(r, Err(VmError::BadBytecode(BadBytecode::NoScope))));

    let (_, r) = run_program(|b| {
        b.emit(Opcode::Nop, 0, 0);
    });
    assert!(matches!(r, Err(VmError::BadBytecode(BadBytecode::IpOutOfRange(1)))));
}

#[test]
fn fault_exit_codes_are_distinct_and_non_zero() {
    let faults = [
        VmError::BadBytecode(BadBytecode::StackUnderflow),
        VmError::ImmutableObject,
        VmError::PropertyAlreadyExists("k".into()),
        VmError::PropertyNotFound("k".into()),
        VmError::PropertyIsConstant("k".into()),
        VmError::OperationUnsupported { op: "add", left: "null", right: "null" },
    ];
    let mut codes: Vec<i32> = faults.iter().map(|e| e.exit_code()).collect();
    assert!(codes.iter().all(|&c| c != 0));
    codes.sort_unstable();
    codes.dedup();
    assert_eq!(codes.len(), faults.len());
}

// ─── Threads ──────────────────────────────────────────────────────────────────

#[test]
fn threads_interleave_round_robin_and_halt_terminally() {
    let image = build(|b| {
        b.emit(Opcode::Nop, 0, 0); // 0: main
        b.emit(Opcode::Nop, 0, 0); // 1: main
        b.emit(Opcode::End, 0, 0); // 2: main — halts the whole process
        b.emit(Opcode::ILoad32, 0, 7); // 3: second thread entry
        b.emit(Opcode::ILoad32, 0, 9); // 4
        b.emit(Opcode::ILoad32, 0, 11); // 5: never reached
        b.emit(Opcode::End, 0, 0); // 6
    });
    let mut p = Process::new(RunConfig::default());
    let second = p.spawn_thread(3);
    let result = run(&mut p, &image);
    assert_eq!(result, Ok(0));

    // the second thread got exactly two slices before main's END
    assert_eq!(p.threads[second].stack.len(), 2);
    let low = p.threads[second].stack.peek(1).unwrap();
    let high = p.threads[second].stack.peek(0).unwrap();
    assert_eq!(p.heap.get_integer_value(low), Some(7));
    assert_eq!(p.heap.get_integer_value(high), Some(9));
}

// ─── Refcount soundness ───────────────────────────────────────────────────────

#[test]
fn a_full_program_sweeps_back_to_the_baseline() {
    let (mut p, result) = run_program(|b| {
        let x = b.intern("x");
        let greet = b.intern("greet");
        b.emit(Opcode::Enter, 0, 0);
        b.emit(Opcode::ILoad32, 0, 500);
        b.emit(Opcode::Var, 0, x);
        b.emit(Opcode::SLoad, 0, greet);
        b.emit(Opcode::VLoad, 0, x);
        b.emit(Opcode::Add, 0, 0); // string + integer: no definition
        b.emit(Opcode::End, 0, 0);
    });
    // the run faults mid-program; the final sweep still reclaims everything
    // the program allocated once the roots are gone
    assert!(matches!(result, Err(VmError::OperationUnsupported { .. })));
    p.main_thread().frames.clear();
    let stack_len = p.main_thread().stack.len();
    for _ in 0..stack_len {
        let r = p.main_thread().stack.pop().unwrap();
        p.heap.dec_ref(r);
    }
    p.collect_garbage();
    assert_eq!(p.live_objects(), baseline());

    // pools and literal cache are emptied by the end-of-run cleanup
    p.heap.drain_pools();
    assert_eq!(p.heap.pool_sizes(), [0, 0, 0, 0]);
}
