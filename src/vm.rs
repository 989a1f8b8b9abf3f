//! The bytecode interpreter.
//!
//! The main loop fetches the instruction under the current thread's
//! instruction pointer, dispatches to the opcode's executor, then advances
//! the thread ring one position (cooperative round-robin at opcode
//! granularity). A halt — normal `END` or a fault — is terminal for the
//! whole process; the ring does not rotate further.
//!
//! After the loop, the literal cache is released, one final tracing
//! collection runs, and the pools are drained, so a normally-halting
//! program leaves only the root scope alive.

use crate::builtins;
use crate::bytecode::{BytecodeImage, Instr, Opcode};
use crate::context::Context;
use crate::core::object::{ObjRef, NULL};
use crate::errors::{BadBytecode, VmError};
use crate::gc::Heap;
use crate::process::{Process, Thread};

enum Step {
    Continue,
    Halt,
}

/// Run `image` to completion on `process`. The process must hold a main
/// thread whose context chain bottoms out at the root context. Returns the
/// exit status (zero on success); faults halt the whole process.
pub fn run(process: &mut Process, image: &BytecodeImage) -> Result<i32, VmError> {
    let mut vm = Vm { process, image };
    let outcome = vm.run_loop();
    vm.finish();
    outcome.map(|()| 0)
}

struct Vm<'a> {
    process: &'a mut Process,
    image: &'a BytecodeImage,
}

impl<'a> Vm<'a> {
    fn thread(&mut self) -> &mut Thread {
        let i = self.process.current_thread();
        &mut self.process.threads[i]
    }

    fn heap(&mut self) -> &mut Heap {
        &mut self.process.heap
    }

    fn literal(&mut self, id: u32) -> Result<ObjRef, VmError> {
        Ok(self.process.literal(self.image, id)?)
    }

    fn key_text(&self, key: ObjRef) -> String {
        self.process.heap.to_string_value(key).into_owned()
    }

    // ── Main loop ────────────────────────────────────────────────────────────

    fn run_loop(&mut self) -> Result<(), VmError> {
        loop {
            let ip = self.thread().ip;
            let instr = *self
                .image
                .instructions
                .get(ip)
                .ok_or(BadBytecode::IpOutOfRange(ip))?;
            let op = Opcode::from_u8(instr.opcode)
                .ok_or(BadBytecode::UnknownOpcode(instr.opcode))?;
            let step = self.execute(op, instr)?;
            if op != Opcode::Arg {
                // any consumer has read its words by now
                self.thread().scratch.clear();
            }
            if let Step::Halt = step {
                return Ok(());
            }
            self.process.rotate();
        }
    }

    fn execute(&mut self, op: Opcode, instr: Instr) -> Result<Step, VmError> {
        match op {
            Opcode::Nop => {
                self.thread().ip += 1;
            }
            Opcode::Arg => {
                self.thread().scratch.push(instr.arg1)?;
                self.thread().ip += 1;
            }
            Opcode::End => return Ok(Step::Halt),
            Opcode::Pop => {
                let r = self.thread().stack.pop().ok_or(BadBytecode::StackUnderflow)?;
                self.heap().dec_ref(r);
                self.thread().ip += 1;
            }
            Opcode::Nil => {
                self.thread().stack.push(NULL);
                self.thread().ip += 1;
            }
            Opcode::ILoad32 => {
                let value = instr.arg1 as i32 as i64;
                let obj = self.heap().alloc_int(value);
                self.thread().stack.push(obj);
                self.thread().ip += 1;
            }
            Opcode::ILoad64 => {
                let low = self.thread().scratch.first().ok_or(BadBytecode::MissingArg)?;
                let value = (((instr.arg1 as u64) << 32) | low as u64) as i64;
                let obj = self.heap().alloc_int(value);
                self.thread().stack.push(obj);
                self.thread().ip += 1;
            }
            Opcode::SLoad => {
                let lit = self.literal(instr.arg1)?;
                self.heap().inc_ref(lit);
                self.thread().stack.push(lit);
                self.thread().ip += 1;
            }
            Opcode::VLoad => self.exec_vload(instr)?,
            Opcode::Var => self.exec_declare(instr, false)?,
            Opcode::Const => self.exec_declare(instr, true)?,
            Opcode::Store => self.exec_store(instr)?,
            Opcode::Add => self.exec_arith(true)?,
            Opcode::Sub => self.exec_arith(false)?,
            Opcode::Func => self.exec_func(instr)?,
            Opcode::Call => self.exec_call(instr)?,
            Opcode::Ret => self.exec_ret()?,
            Opcode::Enter => self.exec_enter()?,
            Opcode::Leave => self.exec_leave()?,
        }
        Ok(Step::Continue)
    }

    // ── Variables ────────────────────────────────────────────────────────────

    /// Resolve a name through the current scope and its topology; push the
    /// value, or null when the name is bound nowhere.
    fn exec_vload(&mut self, instr: Instr) -> Result<(), VmError> {
        let key = self.literal(instr.arg1)?;
        let data = self.process.current_data();
        let value = match self.heap().resolve_property(data, key) {
            Some(v) => {
                self.heap().inc_ref(v);
                v
            }
            None => NULL,
        };
        self.thread().stack.push(value);
        self.thread().ip += 1;
        Ok(())
    }

    fn exec_declare(&mut self, instr: Instr, constant: bool) -> Result<(), VmError> {
        let value = self.thread().stack.pop().ok_or(BadBytecode::StackUnderflow)?;
        let key = match self.literal(instr.arg1) {
            Ok(k) => k,
            Err(e) => {
                self.heap().dec_ref(value);
                return Err(e);
            }
        };
        let data = self.process.current_data();
        let result = self.heap().add_property(data, key, value, constant);
        self.heap().dec_ref(value);
        if let Err(e) = result {
            return Err(e.into_vm_error(self.key_text(key)));
        }
        self.thread().ip += 1;
        Ok(())
    }

    /// Assign through the scope chain; declare in the current scope when the
    /// name is bound nowhere. The assigned value stays on the stack.
    fn exec_store(&mut self, instr: Instr) -> Result<(), VmError> {
        let value = self.thread().stack.peek(0).ok_or(BadBytecode::StackUnderflow)?;
        let key = self.literal(instr.arg1)?;
        let data = self.process.current_data();
        let result = match self.heap().find_property_owner(data, key) {
            Some(owner) => self.heap().set_property(owner, key, value),
            None => self.heap().add_property(data, key, value, false),
        };
        if let Err(e) = result {
            return Err(e.into_vm_error(self.key_text(key)));
        }
        self.thread().ip += 1;
        Ok(())
    }

    // ── Arithmetic ───────────────────────────────────────────────────────────

    fn exec_arith(&mut self, is_add: bool) -> Result<(), VmError> {
        let right = self.thread().stack.pop().ok_or(BadBytecode::StackUnderflow)?;
        let left = match self.thread().stack.pop() {
            Some(l) => l,
            None => {
                self.heap().dec_ref(right);
                return Err(BadBytecode::StackUnderflow.into());
            }
        };
        let left_kind = self.process.heap.kind_name(left);
        let right_kind = self.process.heap.kind_name(right);
        let result = if is_add {
            self.heap().add(left, right)
        } else {
            self.heap().subtract(left, right)
        };
        self.heap().dec_ref(left);
        self.heap().dec_ref(right);
        match result {
            Some(v) => {
                self.thread().stack.push(v);
                self.thread().ip += 1;
                Ok(())
            }
            None => Err(VmError::OperationUnsupported {
                op: if is_add { "add" } else { "subtract" },
                left: left_kind,
                right: right_kind,
            }),
        }
    }

    // ── Functions ────────────────────────────────────────────────────────────

    /// Build a dynamic function: argument count in `arg0`, first argument
    /// name descriptor in `arg1`, entry index from a prior `ARG` word. The
    /// current scope's data object becomes the closure.
    fn exec_func(&mut self, instr: Instr) -> Result<(), VmError> {
        let entry = self.thread().scratch.first().ok_or(BadBytecode::MissingArg)? as usize;
        let argc = instr.arg0 as u32;
        let mut names = Vec::with_capacity(argc as usize);
        for k in 0..argc {
            let id = instr
                .arg1
                .checked_add(k)
                .ok_or(BadBytecode::BadDescriptor(instr.arg1))?;
            let name = self.literal(id)?;
            self.process.heap.inc_ref(name);
            names.push(name);
        }
        let closure = self.process.current_data();
        self.heap().inc_ref(closure);
        let func = self.heap().alloc_function(names, entry, closure);
        self.thread().stack.push(func);
        self.thread().ip += 1;
        Ok(())
    }

    fn exec_call(&mut self, instr: Instr) -> Result<(), VmError> {
        let callee = self.thread().stack.pop().ok_or(BadBytecode::StackUnderflow)?;
        let argc = instr.arg0 as usize;

        if let ObjRef::Static(s) = callee {
            if let Some(executor) = builtins::native_executor(s) {
                return self.call_native(executor, argc);
            }
            return Err(VmError::NotCallable(self.process.heap.kind_name(callee)));
        }

        match self.process.heap.function_parts(callee) {
            Some((names, entry, closure)) => self.call_dynamic(callee, argc, names, entry, closure),
            None => {
                let kind = self.process.heap.kind_name(callee);
                self.heap().dec_ref(callee);
                Err(VmError::NotCallable(kind))
            }
        }
    }

    /// Static function: pop the arguments, run the native executor, push
    /// its result (the null singleton when there is none), release the
    /// arguments, advance.
    fn call_native(
        &mut self,
        executor: builtins::NativeFn,
        argc: usize,
    ) -> Result<(), VmError> {
        let args = self.pop_args(argc)?;
        let result = executor(self.heap(), &args);
        self.thread().stack.push(result);
        for a in args {
            self.heap().dec_ref(a);
        }
        self.thread().ip += 1;
        Ok(())
    }

    /// Dynamic function: bind arguments into a fresh callee scope whose
    /// prototype is the closure, push the return slot, record the return
    /// address, and jump to the entry.
    fn call_dynamic(
        &mut self,
        callee: ObjRef,
        argc: usize,
        names: Vec<ObjRef>,
        entry: usize,
        closure: ObjRef,
    ) -> Result<(), VmError> {
        let values = match self.pop_args(argc) {
            Ok(v) => v,
            Err(e) => {
                self.heap().dec_ref(callee);
                return Err(e);
            }
        };
        self.heap().inc_ref(closure);
        let data = self.heap().alloc_object(vec![closure]);
        for (i, &name) in names.iter().enumerate() {
            let value = values.get(i).copied().unwrap_or(NULL);
            if let Err(e) = self.heap().add_property(data, name, value, false) {
                let text = self.key_text(name);
                for &v in &values {
                    self.heap().dec_ref(v);
                }
                self.heap().dec_ref(data);
                self.heap().dec_ref(callee);
                return Err(e.into_vm_error(text));
            }
        }
        for v in values {
            self.heap().dec_ref(v);
        }
        self.heap().dec_ref(callee);

        let ret_address = self.thread().ip + 1;
        self.thread().stack.push(NULL); // placeholder return slot
        let depth = self.thread().stack.len();
        self.thread()
            .frames
            .push(Context::call(data, ret_address, depth - 1, depth));
        self.thread().ip = entry;
        Ok(())
    }

    /// Pop `argc` operands, restoring left-to-right order. On underflow the
    /// already-popped references are released.
    fn pop_args(&mut self, argc: usize) -> Result<Vec<ObjRef>, VmError> {
        let mut args = Vec::with_capacity(argc);
        for _ in 0..argc {
            match self.thread().stack.pop() {
                Some(a) => args.push(a),
                None => {
                    for a in args {
                        self.heap().dec_ref(a);
                    }
                    return Err(BadBytecode::StackUnderflow.into());
                }
            }
        }
        args.reverse();
        Ok(args)
    }

    /// Write the return value through the recorded return slot, collapse the
    /// stack to the unwinding index, restore the caller.
    fn exec_ret(&mut self) -> Result<(), VmError> {
        let ctx = match self.thread().frames.pop() {
            Some(c) if c.is_call() => c,
            _ => return Err(BadBytecode::ReturnOutsideCall.into()),
        };
        let t = self.process.current_thread();
        let process = &mut *self.process;
        let thread = &mut process.threads[t];
        let heap = &mut process.heap;
        if thread.stack.len() > ctx.unwind_depth {
            if let Some(value) = thread.stack.pop() {
                if let Some(slot) = ctx.ret_slot {
                    thread.stack.replace(heap, slot, value);
                }
                heap.dec_ref(value);
            }
        }
        thread.stack.reduce(heap, ctx.unwind_depth);
        thread.ip = ctx.ret_address;
        heap.dec_ref(ctx.data);
        Ok(())
    }

    // ── Scopes ───────────────────────────────────────────────────────────────

    fn exec_enter(&mut self) -> Result<(), VmError> {
        let parent = self.process.current_data();
        self.heap().inc_ref(parent);
        let data = self.heap().alloc_object(vec![parent]);
        let depth = self.thread().stack.len();
        self.thread().frames.push(Context::scope(data, depth));
        self.thread().ip += 1;
        Ok(())
    }

    /// Yield the scope as a value: its data object moves onto the stack,
    /// the frame is destroyed, the caller scope becomes current.
    fn exec_leave(&mut self) -> Result<(), VmError> {
        let ctx = match self.thread().frames.pop() {
            Some(c) if !c.is_call() => c,
            _ => return Err(BadBytecode::NoScope.into()),
        };
        self.thread().stack.push(ctx.data);
        self.thread().ip += 1;
        Ok(())
    }

    // ── End of run ───────────────────────────────────────────────────────────

    fn finish(&mut self) {
        self.process.release_literals();
        self.process.collect_garbage();
        self.process.heap.drain_pools();
        if self.process.config().gc_stats {
            self.process.heap.stats.print();
        }
    }
}
