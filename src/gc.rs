//! Hybrid memory manager.
//!
//! ARCHITECTURE:
//!   Reference counting      — drives ordinary lifetime
//!     • every producer of a new reference increments
//!     • every consumer that lets a reference go decrements
//!     • a count reaching zero recycles or frees the carcass
//!   Tracing mark & sweep    — handles cycles and end-of-run cleanup
//!     • mark from the GC roots (data stacks + context chains)
//!     • one sweep over the live list reclaims every unmarked object
//!   Per-kind pools          — integers, reals, strings, user objects
//!     • carcasses are zeroed, tagged ZOMBIE and kept (≤ 1024 per kind)
//!     • the next allocation of that kind revives a carcass in place
//!   Static singletons       — never counted, marked, swept or recycled
//!
//! Objects live in a slab of slots; the live set is threaded through the
//! slots as an intrusive doubly-linked list so removal is O(1).

use crate::core::object::{
    FunctionObj, GoatStr, ObjRef, Payload, UserObject, EMPTY_STRING, MINUS_ONE, NULL, ONE, ZERO,
};

/// Upper bound on recycled carcasses kept per kind.
pub const POOL_CAPACITY: usize = 1024;

const NIL_LINK: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotState {
    /// Tracked in the live list; refcount and marking apply.
    Live,
    /// A pooled carcass. Must not be referenced, marked or counted.
    Zombie,
    /// Released storage, reusable for any kind.
    Free,
}

#[derive(Debug)]
pub(crate) struct Slot {
    pub(crate) state: SlotState,
    pub(crate) refs: u32,
    pub(crate) marked: bool,
    prev: u32,
    next: u32,
    pub(crate) payload: Payload,
}

#[derive(Debug, Default)]
struct Pools {
    integers: Vec<u32>,
    real_numbers: Vec<u32>,
    dynamic_strings: Vec<u32>,
    user_defined_objects: Vec<u32>,
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone)]
pub struct HeapStats {
    pub allocations: u64,
    pub pool_hits: u64,
    pub recycled: u64,
    pub freed: u64,
    pub sweeps: u64,
    pub swept: u64,
}

impl HeapStats {
    pub fn print(&self) {
        println!("=== heap statistics ===");
        println!("  allocations:  {}", self.allocations);
        println!("  pool hits:    {}", self.pool_hits);
        println!("  recycled:     {}", self.recycled);
        println!("  freed:        {}", self.freed);
        println!("  sweeps:       {}", self.sweeps);
        println!("  swept:        {}", self.swept);
    }
}

// ---------------------------------------------------------------------------
// Heap
// ---------------------------------------------------------------------------

pub struct Heap {
    pub(crate) slots: Vec<Slot>,
    head: u32,
    live: usize,
    free: Vec<u32>,
    pools: Pools,
    pub stats: HeapStats,
    trace: bool,
}

impl Heap {
    pub fn new(trace: bool) -> Heap {
        Heap {
            slots: Vec::new(),
            head: NIL_LINK,
            live: 0,
            free: Vec::new(),
            pools: Pools::default(),
            stats: HeapStats::default(),
            trace,
        }
    }

    /// Number of live dynamic objects.
    pub fn live_objects(&self) -> usize {
        self.live
    }

    /// Carcass counts: integers, reals, strings, user objects.
    pub fn pool_sizes(&self) -> [usize; 4] {
        [
            self.pools.integers.len(),
            self.pools.real_numbers.len(),
            self.pools.dynamic_strings.len(),
            self.pools.user_defined_objects.len(),
        ]
    }

    /// Refcount of a live dynamic object; `None` for statics and carcasses.
    pub fn ref_count(&self, r: ObjRef) -> Option<u32> {
        match r {
            ObjRef::Dynamic(i) => {
                let slot = self.slots.get(i as usize)?;
                (slot.state == SlotState::Live).then_some(slot.refs)
            }
            _ => None,
        }
    }

    // ── Allocation ───────────────────────────────────────────────────────────

    pub fn alloc_int(&mut self, value: i64) -> ObjRef {
        match value {
            0 => return ZERO,
            1 => return ONE,
            -1 => return MINUS_ONE,
            _ => {}
        }
        if let Some(i) = self.pools.integers.pop() {
            self.revive(i);
            if let Payload::Int(v) = &mut self.slots[i as usize].payload {
                *v = value;
            }
            return ObjRef::Dynamic(i);
        }
        ObjRef::Dynamic(self.new_slot(Payload::Int(value)))
    }

    pub fn alloc_real(&mut self, value: f64) -> ObjRef {
        if let Some(i) = self.pools.real_numbers.pop() {
            self.revive(i);
            if let Payload::Real(v) = &mut self.slots[i as usize].payload {
                *v = value;
            }
            return ObjRef::Dynamic(i);
        }
        ObjRef::Dynamic(self.new_slot(Payload::Real(value)))
    }

    pub fn alloc_string(&mut self, text: impl Into<String>) -> ObjRef {
        let text: String = text.into();
        if text.is_empty() {
            return EMPTY_STRING;
        }
        let chars = text.chars().count();
        if let Some(i) = self.pools.dynamic_strings.pop() {
            self.revive(i);
            if let Payload::Str(s) = &mut self.slots[i as usize].payload {
                s.text.clear();
                s.text.push_str(&text);
                s.chars = chars;
            }
            return ObjRef::Dynamic(i);
        }
        ObjRef::Dynamic(self.new_slot(Payload::Str(GoatStr { text, chars })))
    }

    /// Build a dynamic function. Ownership of the passed references moves
    /// into the function object.
    pub fn alloc_function(
        &mut self,
        arg_names: Vec<ObjRef>,
        entry: usize,
        closure: ObjRef,
    ) -> ObjRef {
        ObjRef::Dynamic(self.new_slot(Payload::Function(FunctionObj {
            arg_names,
            entry,
            closure,
        })))
    }

    /// Build a user-defined object. Ownership of the prototype references
    /// moves into the object.
    pub fn alloc_object(&mut self, prototypes: Vec<ObjRef>) -> ObjRef {
        if let Some(i) = self.pools.user_defined_objects.pop() {
            self.revive(i);
            if let Payload::Object(o) = &mut self.slots[i as usize].payload {
                debug_assert!(o.keys.is_empty() && o.props.is_empty());
                o.prototypes = prototypes;
                o.topology = None;
            }
            return ObjRef::Dynamic(i);
        }
        ObjRef::Dynamic(self.new_slot(Payload::Object(UserObject {
            prototypes,
            ..UserObject::default()
        })))
    }

    /// Late prototype wiring for objects created empty (cross-process
    /// import). Ownership of the references moves into the object.
    pub(crate) fn set_prototypes(&mut self, r: ObjRef, prototypes: Vec<ObjRef>) {
        if let ObjRef::Dynamic(i) = r {
            if let Payload::Object(o) = &mut self.slots[i as usize].payload {
                debug_assert!(o.prototypes.is_empty());
                o.prototypes = prototypes;
                o.topology = None;
            }
        }
    }

    fn new_slot(&mut self, payload: Payload) -> u32 {
        self.stats.allocations += 1;
        let i = if let Some(i) = self.free.pop() {
            let slot = &mut self.slots[i as usize];
            slot.payload = payload;
            slot.state = SlotState::Live;
            slot.refs = 1;
            slot.marked = false;
            i
        } else {
            self.slots.push(Slot {
                state: SlotState::Live,
                refs: 1,
                marked: false,
                prev: NIL_LINK,
                next: NIL_LINK,
                payload,
            });
            (self.slots.len() - 1) as u32
        };
        self.link(i);
        i
    }

    fn revive(&mut self, i: u32) {
        self.stats.allocations += 1;
        self.stats.pool_hits += 1;
        let slot = &mut self.slots[i as usize];
        debug_assert_eq!(slot.state, SlotState::Zombie, "reviving a non-carcass");
        slot.state = SlotState::Live;
        slot.refs = 1;
        slot.marked = false;
        self.link(i);
    }

    // ── Reference counting ───────────────────────────────────────────────────

    pub fn inc_ref(&mut self, r: ObjRef) {
        if let ObjRef::Dynamic(i) = r {
            let slot = &mut self.slots[i as usize];
            debug_assert_eq!(slot.state, SlotState::Live, "refcount bump on a carcass");
            slot.refs += 1;
        }
    }

    /// Drop one reference. A count reaching zero reclaims the object and,
    /// transitively, everything it solely kept alive.
    pub fn dec_ref(&mut self, r: ObjRef) {
        let mut pending = vec![r];
        while let Some(r) = pending.pop() {
            let ObjRef::Dynamic(i) = r else { continue };
            let slot = &mut self.slots[i as usize];
            debug_assert_eq!(slot.state, SlotState::Live, "refcount drop on a carcass");
            debug_assert!(slot.refs > 0, "refcount underflow");
            slot.refs -= 1;
            if slot.refs == 0 {
                self.collect_children(i, &mut pending);
                self.retire(i);
            }
        }
    }

    /// Drain every reference a dying object holds. The `keys` list borrows
    /// the property tree's key references, so it is cleared without release.
    fn collect_children(&mut self, i: u32, out: &mut Vec<ObjRef>) {
        match &mut self.slots[i as usize].payload {
            Payload::Int(_) | Payload::Real(_) | Payload::Str(_) => {}
            Payload::Function(f) => {
                out.append(&mut f.arg_names);
                out.push(std::mem::replace(&mut f.closure, NULL));
            }
            Payload::Object(o) => {
                o.keys.clear();
                o.topology = None;
                out.append(&mut o.prototypes);
                for (_, p) in std::mem::take(&mut o.props) {
                    out.push(p.key);
                    out.push(p.value);
                }
            }
        }
    }

    /// Move a dead object into its kind's pool, or free it when the pool is
    /// at capacity. Children must already be drained.
    fn retire(&mut self, i: u32) {
        self.unlink(i);
        let pool = match &self.slots[i as usize].payload {
            Payload::Int(_) => Some(&mut self.pools.integers),
            Payload::Real(_) => Some(&mut self.pools.real_numbers),
            Payload::Str(_) => Some(&mut self.pools.dynamic_strings),
            Payload::Object(_) => Some(&mut self.pools.user_defined_objects),
            Payload::Function(_) => None,
        };
        match pool {
            Some(list) if list.len() < POOL_CAPACITY => {
                list.push(i);
                let slot = &mut self.slots[i as usize];
                slot.state = SlotState::Zombie;
                zero_out(&mut slot.payload);
                self.stats.recycled += 1;
            }
            _ => {
                let slot = &mut self.slots[i as usize];
                slot.state = SlotState::Free;
                slot.payload = Payload::Int(0);
                self.free.push(i);
                self.stats.freed += 1;
            }
        }
    }

    // ── Tracing collection ───────────────────────────────────────────────────

    /// Mark `root` and everything reachable from it. Idempotent within one
    /// collection cycle.
    pub fn mark(&mut self, root: ObjRef) {
        let mut work = vec![root];
        while let Some(r) = work.pop() {
            let ObjRef::Dynamic(i) = r else { continue };
            let slot = &mut self.slots[i as usize];
            debug_assert_eq!(slot.state, SlotState::Live, "marking a carcass");
            if slot.marked {
                continue;
            }
            slot.marked = true;
            match &slot.payload {
                Payload::Int(_) | Payload::Real(_) | Payload::Str(_) => {}
                Payload::Function(f) => {
                    work.extend_from_slice(&f.arg_names);
                    work.push(f.closure);
                }
                Payload::Object(o) => {
                    work.extend_from_slice(&o.prototypes);
                    for p in o.props.values() {
                        work.push(p.key);
                        work.push(p.value);
                    }
                }
            }
        }
    }

    /// Reclaim every unmarked live object and clear the marks on the rest.
    /// Returns the number of objects reclaimed.
    ///
    /// The doomed set is collected up front so list removal cannot break the
    /// traversal. References from a dying object into the doomed set need no
    /// bookkeeping — the whole set goes in this pass; references to marked
    /// survivors are dropped normally.
    pub fn sweep(&mut self) -> usize {
        self.stats.sweeps += 1;
        let live_before = self.live;

        let mut doomed = Vec::new();
        let mut cur = self.head;
        while cur != NIL_LINK {
            let slot = &self.slots[cur as usize];
            if !slot.marked {
                doomed.push(cur);
            }
            cur = slot.next;
        }

        let mut children = Vec::new();
        for &i in &doomed {
            self.collect_children(i, &mut children);
            for c in children.drain(..) {
                self.drop_surviving_ref(c);
            }
            self.retire(i);
        }

        let mut cur = self.head;
        while cur != NIL_LINK {
            let slot = &mut self.slots[cur as usize];
            slot.marked = false;
            cur = slot.next;
        }

        self.stats.swept += doomed.len() as u64;
        if self.trace {
            eprintln!(
                "[gc] sweep #{}: reclaimed {} of {} objects",
                self.stats.sweeps,
                doomed.len(),
                live_before
            );
        }
        doomed.len()
    }

    fn drop_surviving_ref(&mut self, r: ObjRef) {
        let ObjRef::Dynamic(i) = r else { return };
        let slot = &mut self.slots[i as usize];
        if slot.state != SlotState::Live || !slot.marked {
            return;
        }
        debug_assert!(slot.refs > 0, "refcount underflow during sweep");
        slot.refs = slot.refs.saturating_sub(1);
    }

    // ── Bulk teardown ────────────────────────────────────────────────────────

    /// Unconditional shutdown release: walk the live list once, free
    /// everything, then drop the pooled carcasses. Cycles are permitted
    /// since reclamation is bulk.
    pub fn release_all(&mut self) {
        let mut cur = self.head;
        while cur != NIL_LINK {
            let slot = &mut self.slots[cur as usize];
            let next = slot.next;
            slot.state = SlotState::Free;
            slot.refs = 0;
            slot.marked = false;
            slot.prev = NIL_LINK;
            slot.next = NIL_LINK;
            slot.payload = Payload::Int(0);
            self.free.push(cur);
            self.stats.freed += 1;
            cur = next;
        }
        self.head = NIL_LINK;
        self.live = 0;
        self.drain_pools();
    }

    /// Free every pooled carcass.
    pub fn drain_pools(&mut self) {
        let lists = [
            std::mem::take(&mut self.pools.integers),
            std::mem::take(&mut self.pools.real_numbers),
            std::mem::take(&mut self.pools.dynamic_strings),
            std::mem::take(&mut self.pools.user_defined_objects),
        ];
        for list in lists {
            for i in list {
                let slot = &mut self.slots[i as usize];
                debug_assert_eq!(slot.state, SlotState::Zombie);
                slot.state = SlotState::Free;
                slot.payload = Payload::Int(0);
                self.free.push(i);
                self.stats.freed += 1;
            }
        }
    }

    // ── Intrusive live list ──────────────────────────────────────────────────

    fn link(&mut self, i: u32) {
        let head = self.head;
        {
            let slot = &mut self.slots[i as usize];
            slot.prev = NIL_LINK;
            slot.next = head;
        }
        if head != NIL_LINK {
            self.slots[head as usize].prev = i;
        }
        self.head = i;
        self.live += 1;
    }

    fn unlink(&mut self, i: u32) {
        let (prev, next) = {
            let slot = &self.slots[i as usize];
            (slot.prev, slot.next)
        };
        if prev != NIL_LINK {
            self.slots[prev as usize].next = next;
        } else {
            self.head = next;
        }
        if next != NIL_LINK {
            self.slots[next as usize].prev = prev;
        }
        let slot = &mut self.slots[i as usize];
        slot.prev = NIL_LINK;
        slot.next = NIL_LINK;
        self.live -= 1;
    }
}

/// Reset a carcass's payload; container capacity is kept for reuse.
fn zero_out(payload: &mut Payload) {
    match payload {
        Payload::Int(v) => *v = 0,
        Payload::Real(v) => *v = 0.0,
        Payload::Str(s) => {
            s.text.clear();
            s.chars = 0;
        }
        Payload::Function(_) => {}
        Payload::Object(o) => {
            debug_assert!(o.props.is_empty(), "carcass with unreleased properties");
            o.keys.clear();
            o.prototypes.clear();
            o.topology = None;
        }
    }
}
