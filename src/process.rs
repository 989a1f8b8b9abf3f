//! Processes and threads.
//!
//! A process owns the heap (and with it the object list and the per-kind
//! pools), a lazily populated cache of string literals from the bytecode
//! image, and a ring of threads scheduled round-robin by the interpreter.
//! Each thread owns its data stack, its context chain, an instruction
//! pointer and a small scratch array for `ARG`-prefixed immediates.

use crate::builtins;
use crate::bytecode::{BytecodeImage, MAX_ARG_WORDS};
use crate::context::Context;
use crate::core::object::{ObjRef, ROOT};
use crate::errors::BadBytecode;
use crate::gc::Heap;
use crate::stack::DataStack;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_PROCESS_ID: AtomicU64 = AtomicU64::new(1);

/// Runtime toggles, populated from the CLI.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunConfig {
    /// Emit a `[gc]` line for every sweep.
    pub trace_gc: bool,
    /// Print heap statistics after the run.
    pub gc_stats: bool,
}

// ---------------------------------------------------------------------------
// Threads
// ---------------------------------------------------------------------------

/// Accumulates `ARG`-prefixed words for the next multi-word instruction.
#[derive(Debug, Clone, Copy, Default)]
pub struct Scratch {
    words: [u32; MAX_ARG_WORDS],
    len: usize,
}

impl Scratch {
    pub fn push(&mut self, word: u32) -> Result<(), BadBytecode> {
        if self.len == MAX_ARG_WORDS {
            return Err(BadBytecode::ScratchOverflow);
        }
        self.words[self.len] = word;
        self.len += 1;
        Ok(())
    }

    pub fn first(&self) -> Option<u32> {
        (self.len > 0).then(|| self.words[0])
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[derive(Debug)]
pub struct Thread {
    pub stack: DataStack,
    /// Context chain, innermost frame last. The process's root context is
    /// the implicit base of every chain.
    pub frames: Vec<Context>,
    pub ip: usize,
    pub scratch: Scratch,
}

impl Thread {
    pub fn new(ip: usize) -> Thread {
        Thread {
            stack: DataStack::new(),
            frames: Vec::new(),
            ip,
            scratch: Scratch::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Process
// ---------------------------------------------------------------------------

pub struct Process {
    pub id: u64,
    pub heap: Heap,
    pub threads: Vec<Thread>,
    current: usize,
    root_data: ObjRef,
    literals: HashMap<u32, ObjRef>,
    config: RunConfig,
}

impl Process {
    /// Build a process with its immortal root context (standard library
    /// bindings) and one main thread.
    pub fn new(config: RunConfig) -> Process {
        let mut heap = Heap::new(config.trace_gc);
        let root_data = heap.alloc_object(vec![ROOT]);
        builtins::install(&mut heap, root_data);
        Process {
            id: NEXT_PROCESS_ID.fetch_add(1, Ordering::Relaxed),
            heap,
            threads: vec![Thread::new(0)],
            current: 0,
            root_data,
            literals: HashMap::new(),
            config,
        }
    }

    /// The root context's data object, base of every scope chain.
    pub fn root_data(&self) -> ObjRef {
        self.root_data
    }

    pub fn config(&self) -> RunConfig {
        self.config
    }

    pub fn main_thread(&mut self) -> &mut Thread {
        &mut self.threads[0]
    }

    /// Index of the thread the scheduler will run next.
    pub fn current_thread(&self) -> usize {
        self.current
    }

    /// Advance the thread ring one position.
    pub fn rotate(&mut self) {
        self.current = (self.current + 1) % self.threads.len();
    }

    /// Add a thread to the ring, starting at instruction `ip`.
    pub fn spawn_thread(&mut self, ip: usize) -> usize {
        self.threads.push(Thread::new(ip));
        self.threads.len() - 1
    }

    /// The current thread's innermost variable store.
    pub fn current_data(&self) -> ObjRef {
        self.threads[self.current]
            .frames
            .last()
            .map(|c| c.data)
            .unwrap_or(self.root_data)
    }

    /// Look up or materialize the string literal behind data descriptor
    /// `id`. The cache owns one reference per literal; literals are shared
    /// across every later use.
    pub fn literal(&mut self, image: &BytecodeImage, id: u32) -> Result<ObjRef, BadBytecode> {
        if let Some(&r) = self.literals.get(&id) {
            return Ok(r);
        }
        let text = image.string_literal(id)?;
        let r = self.heap.alloc_string(text);
        self.literals.insert(id, r);
        Ok(r)
    }

    /// Release the cache's references and drop the cache.
    pub fn release_literals(&mut self) {
        let cached: Vec<ObjRef> = self.literals.drain().map(|(_, r)| r).collect();
        for r in cached {
            self.heap.dec_ref(r);
        }
    }

    /// One full tracing collection: mark from every GC root (the root
    /// context plus each thread's data stack and context chain), then sweep.
    pub fn collect_garbage(&mut self) -> usize {
        self.heap.mark(self.root_data);
        for thread in &self.threads {
            for &r in thread.stack.items() {
                self.heap.mark(r);
            }
            for frame in &thread.frames {
                self.heap.mark(frame.data);
            }
        }
        self.heap.sweep()
    }

    pub fn live_objects(&self) -> usize {
        self.heap.live_objects()
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        self.heap.release_all();
    }
}
