//! The Goat object model.
//!
//! Every runtime value — scopes, functions, strings, numbers, booleans — is
//! an object. An object is a handle (`ObjRef`) into either the static
//! singleton set or the owning process's heap. Behaviour is dispatched on the
//! object's kind at the capability boundary: type tag, comparison, string
//! conversion, prototypes and topology, properties, arithmetic, coercions.
//!
//! Prototype chains are linearized into a *topology*: the ordered list of
//! prototypes consulted during property lookup, always ending at the root
//! singleton. With several direct prototypes the linearization is C3-style —
//! a depth-first post-order walk, rightmost prototype first, deduplicated,
//! then reversed — so earlier direct prototypes win ties.

use crate::errors::PropError;
use crate::gc::Heap;
use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::f64::consts;

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

/// A reference to a runtime object. Static objects are process independent
/// and never counted, marked, swept or recycled; dynamic objects live in one
/// process's heap. Handle equality is object identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjRef {
    Static(StaticObj),
    Dynamic(u32),
}

/// The closed set of static singletons.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StaticObj {
    Root,
    Null,
    True,
    False,
    NumberProto,
    RealProto,
    StringProto,
    FunctionProto,
    Zero,
    One,
    MinusOne,
    Pi,
    EmptyString,
    Print,
    Sign,
    Atan,
}

pub const ROOT: ObjRef = ObjRef::Static(StaticObj::Root);
pub const NULL: ObjRef = ObjRef::Static(StaticObj::Null);
pub const TRUE: ObjRef = ObjRef::Static(StaticObj::True);
pub const FALSE: ObjRef = ObjRef::Static(StaticObj::False);
pub const NUMBER_PROTO: ObjRef = ObjRef::Static(StaticObj::NumberProto);
pub const REAL_PROTO: ObjRef = ObjRef::Static(StaticObj::RealProto);
pub const STRING_PROTO: ObjRef = ObjRef::Static(StaticObj::StringProto);
pub const FUNCTION_PROTO: ObjRef = ObjRef::Static(StaticObj::FunctionProto);
pub const ZERO: ObjRef = ObjRef::Static(StaticObj::Zero);
pub const ONE: ObjRef = ObjRef::Static(StaticObj::One);
pub const MINUS_ONE: ObjRef = ObjRef::Static(StaticObj::MinusOne);
pub const PI: ObjRef = ObjRef::Static(StaticObj::Pi);
pub const EMPTY_STRING: ObjRef = ObjRef::Static(StaticObj::EmptyString);
pub const PRINT: ObjRef = ObjRef::Static(StaticObj::Print);
pub const SIGN: ObjRef = ObjRef::Static(StaticObj::Sign);
pub const ATAN: ObjRef = ObjRef::Static(StaticObj::Atan);

/// Primary sort key in property-key comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TypeTag {
    Boolean,
    Number,
    String,
    Other,
}

// ---------------------------------------------------------------------------
// Per-kind state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub(crate) enum Payload {
    Int(i64),
    Real(f64),
    Str(GoatStr),
    Function(FunctionObj),
    Object(UserObject),
}

/// Immutable character sequence plus its length in characters.
#[derive(Debug, Clone, Default)]
pub(crate) struct GoatStr {
    pub text: String,
    pub chars: usize,
}

/// A dynamic (bytecode) function: argument-name objects, the entry
/// instruction index and the captured lexical environment.
#[derive(Debug, Clone)]
pub(crate) struct FunctionObj {
    pub arg_names: Vec<ObjRef>,
    pub entry: usize,
    pub closure: ObjRef,
}

/// The mutable composite. `keys` records first-insertion order and borrows
/// the key references owned by the property tree; `props` is the ordered
/// tree; `topology` caches the linearized prototype chain.
#[derive(Debug, Clone, Default)]
pub(crate) struct UserObject {
    pub keys: Vec<ObjRef>,
    pub props: BTreeMap<PropKey, Property>,
    pub prototypes: Vec<ObjRef>,
    pub topology: Option<Vec<ObjRef>>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Property {
    pub key: ObjRef,
    pub value: ObjRef,
    pub constant: bool,
}

// ---------------------------------------------------------------------------
// Property keys
// ---------------------------------------------------------------------------

/// Snapshot of a key object's comparable content. Keys compare first by type
/// tag, then by per-kind order: booleans by value, numbers numerically
/// (integers and reals share the `number` tag), strings lexicographically,
/// everything else by identity.
#[derive(Debug, Clone)]
pub enum PropKey {
    Bool(bool),
    Int(i64),
    Real(f64),
    Str(String),
    Other(u64),
}

impl PropKey {
    fn tag(&self) -> TypeTag {
        match self {
            PropKey::Bool(_) => TypeTag::Boolean,
            PropKey::Int(_) | PropKey::Real(_) => TypeTag::Number,
            PropKey::Str(_) => TypeTag::String,
            PropKey::Other(_) => TypeTag::Other,
        }
    }
}

impl Ord for PropKey {
    fn cmp(&self, other: &PropKey) -> Ordering {
        self.tag().cmp(&other.tag()).then_with(|| match (self, other) {
            (PropKey::Bool(a), PropKey::Bool(b)) => a.cmp(b),
            (PropKey::Int(a), PropKey::Int(b)) => a.cmp(b),
            (PropKey::Real(a), PropKey::Real(b)) => a.total_cmp(b),
            (PropKey::Int(a), PropKey::Real(b)) => (*a as f64).total_cmp(b),
            (PropKey::Real(a), PropKey::Int(b)) => a.total_cmp(&(*b as f64)),
            (PropKey::Str(a), PropKey::Str(b)) => a.cmp(b),
            (PropKey::Other(a), PropKey::Other(b)) => a.cmp(b),
            _ => Ordering::Equal,
        })
    }
}

impl PartialOrd for PropKey {
    fn partial_cmp(&self, other: &PropKey) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for PropKey {
    fn eq(&self, other: &PropKey) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PropKey {}

/// Identity space for keys of the `other` tag: statics first, then heap
/// objects by slot index.
const DYNAMIC_IDENT_BASE: u64 = 1 << 32;

// ---------------------------------------------------------------------------
// Static prototype chains
// ---------------------------------------------------------------------------

const NO_PROTOS: &[ObjRef] = &[];
const ROOT_ONLY: &[ObjRef] = &[ROOT];
const NUMBER_PROTO_ONLY: &[ObjRef] = &[NUMBER_PROTO];
const REAL_PROTO_ONLY: &[ObjRef] = &[REAL_PROTO];
const STRING_PROTO_ONLY: &[ObjRef] = &[STRING_PROTO];
const FUNCTION_PROTO_ONLY: &[ObjRef] = &[FUNCTION_PROTO];

const INT_TOPOLOGY: &[ObjRef] = &[NUMBER_PROTO, ROOT];
const REAL_TOPOLOGY: &[ObjRef] = &[REAL_PROTO, NUMBER_PROTO, ROOT];
const STRING_TOPOLOGY: &[ObjRef] = &[STRING_PROTO, ROOT];
const FUNCTION_TOPOLOGY: &[ObjRef] = &[FUNCTION_PROTO, ROOT];

fn static_prototypes(s: StaticObj) -> &'static [ObjRef] {
    match s {
        StaticObj::Root => NO_PROTOS,
        StaticObj::Null
        | StaticObj::True
        | StaticObj::False
        | StaticObj::NumberProto
        | StaticObj::StringProto
        | StaticObj::FunctionProto => ROOT_ONLY,
        StaticObj::RealProto => NUMBER_PROTO_ONLY,
        StaticObj::Zero | StaticObj::One | StaticObj::MinusOne => NUMBER_PROTO_ONLY,
        StaticObj::Pi => REAL_PROTO_ONLY,
        StaticObj::EmptyString => STRING_PROTO_ONLY,
        StaticObj::Print | StaticObj::Sign | StaticObj::Atan => FUNCTION_PROTO_ONLY,
    }
}

fn static_topology(s: StaticObj) -> &'static [ObjRef] {
    match s {
        StaticObj::Root => NO_PROTOS,
        StaticObj::Null
        | StaticObj::True
        | StaticObj::False
        | StaticObj::NumberProto
        | StaticObj::StringProto
        | StaticObj::FunctionProto => ROOT_ONLY,
        StaticObj::RealProto => INT_TOPOLOGY,
        StaticObj::Zero | StaticObj::One | StaticObj::MinusOne => INT_TOPOLOGY,
        StaticObj::Pi => REAL_TOPOLOGY,
        StaticObj::EmptyString => STRING_TOPOLOGY,
        StaticObj::Print | StaticObj::Sign | StaticObj::Atan => FUNCTION_TOPOLOGY,
    }
}

// ---------------------------------------------------------------------------
// Capability dispatch
// ---------------------------------------------------------------------------

impl Heap {
    pub fn type_tag(&self, r: ObjRef) -> TypeTag {
        match r {
            ObjRef::Static(s) => match s {
                StaticObj::True | StaticObj::False => TypeTag::Boolean,
                StaticObj::Zero | StaticObj::One | StaticObj::MinusOne | StaticObj::Pi => {
                    TypeTag::Number
                }
                StaticObj::EmptyString => TypeTag::String,
                _ => TypeTag::Other,
            },
            ObjRef::Dynamic(i) => match &self.slots[i as usize].payload {
                Payload::Int(_) | Payload::Real(_) => TypeTag::Number,
                Payload::Str(_) => TypeTag::String,
                Payload::Function(_) | Payload::Object(_) => TypeTag::Other,
            },
        }
    }

    /// Printable kind name, used in fault messages.
    pub fn kind_name(&self, r: ObjRef) -> &'static str {
        match r {
            ObjRef::Static(s) => match s {
                StaticObj::Root => "root",
                StaticObj::Null => "null",
                StaticObj::True | StaticObj::False => "boolean",
                StaticObj::NumberProto
                | StaticObj::RealProto
                | StaticObj::StringProto
                | StaticObj::FunctionProto => "prototype",
                StaticObj::Zero | StaticObj::One | StaticObj::MinusOne => "integer",
                StaticObj::Pi => "real",
                StaticObj::EmptyString => "string",
                StaticObj::Print | StaticObj::Sign | StaticObj::Atan => "function",
            },
            ObjRef::Dynamic(i) => match &self.slots[i as usize].payload {
                Payload::Int(_) => "integer",
                Payload::Real(_) => "real",
                Payload::Str(_) => "string",
                Payload::Function(_) => "function",
                Payload::Object(_) => "object",
            },
        }
    }

    /// Total order over all objects: primary key is the type tag, secondary
    /// key the per-kind comparison of `PropKey`.
    pub fn compare(&self, a: ObjRef, b: ObjRef) -> Ordering {
        self.prop_key(a).cmp(&self.prop_key(b))
    }

    pub fn prop_key(&self, r: ObjRef) -> PropKey {
        match r {
            ObjRef::Static(s) => match s {
                StaticObj::True => PropKey::Bool(true),
                StaticObj::False => PropKey::Bool(false),
                StaticObj::Zero => PropKey::Int(0),
                StaticObj::One => PropKey::Int(1),
                StaticObj::MinusOne => PropKey::Int(-1),
                StaticObj::Pi => PropKey::Real(consts::PI),
                StaticObj::EmptyString => PropKey::Str(String::new()),
                other => PropKey::Other(other as u8 as u64),
            },
            ObjRef::Dynamic(i) => match &self.slots[i as usize].payload {
                Payload::Int(v) => PropKey::Int(*v),
                Payload::Real(v) => PropKey::Real(*v),
                Payload::Str(s) => PropKey::Str(s.text.clone()),
                Payload::Function(_) | Payload::Object(_) => {
                    PropKey::Other(DYNAMIC_IDENT_BASE + i as u64)
                }
            },
        }
    }

    // ── String conversion ────────────────────────────────────────────────────

    pub fn to_string_value(&self, r: ObjRef) -> Cow<'static, str> {
        match r {
            ObjRef::Static(s) => match s {
                StaticObj::Null => Cow::Borrowed("null"),
                StaticObj::True => Cow::Borrowed("true"),
                StaticObj::False => Cow::Borrowed("false"),
                StaticObj::Zero => Cow::Borrowed("0"),
                StaticObj::One => Cow::Borrowed("1"),
                StaticObj::MinusOne => Cow::Borrowed("-1"),
                StaticObj::Pi => Cow::Owned(consts::PI.to_string()),
                StaticObj::EmptyString => Cow::Borrowed(""),
                StaticObj::Root
                | StaticObj::NumberProto
                | StaticObj::RealProto
                | StaticObj::StringProto
                | StaticObj::FunctionProto => Cow::Borrowed("{}"),
                StaticObj::Print | StaticObj::Sign | StaticObj::Atan => {
                    Cow::Borrowed("function")
                }
            },
            ObjRef::Dynamic(i) => match &self.slots[i as usize].payload {
                Payload::Int(v) => Cow::Owned(v.to_string()),
                Payload::Real(v) => Cow::Owned(v.to_string()),
                Payload::Str(s) => Cow::Owned(s.text.clone()),
                Payload::Function(_) => Cow::Borrowed("function"),
                Payload::Object(_) => Cow::Owned(self.object_notation(r)),
            },
        }
    }

    /// Syntactic form that, if reparsed, reproduces the object. Strings are
    /// escaped and quoted; composites emit `{k1=v1;k2=v2;…}` with entries in
    /// the property tree's in-order traversal.
    pub fn to_string_notation(&self, r: ObjRef) -> String {
        match r {
            EMPTY_STRING => quote_string(""),
            ObjRef::Dynamic(i) => match &self.slots[i as usize].payload {
                Payload::Str(s) => quote_string(&s.text),
                Payload::Object(_) => self.object_notation(r),
                _ => self.to_string_value(r).into_owned(),
            },
            _ => self.to_string_value(r).into_owned(),
        }
    }

    fn object_notation(&self, r: ObjRef) -> String {
        let ObjRef::Dynamic(i) = r else {
            return "{}".to_string();
        };
        let Payload::Object(o) = &self.slots[i as usize].payload else {
            return "{}".to_string();
        };
        let entries: Vec<String> = o
            .props
            .values()
            .map(|p| {
                format!(
                    "{}={}",
                    self.to_string_notation(p.key),
                    self.to_string_notation(p.value)
                )
            })
            .collect();
        format!("{{{}}}", entries.join(";"))
    }

    // ── Prototypes and topology ──────────────────────────────────────────────

    /// Borrowed view of the direct prototypes.
    pub fn get_prototypes(&self, r: ObjRef) -> &[ObjRef] {
        match r {
            ObjRef::Static(s) => static_prototypes(s),
            ObjRef::Dynamic(i) => match &self.slots[i as usize].payload {
                Payload::Int(_) => NUMBER_PROTO_ONLY,
                Payload::Real(_) => REAL_PROTO_ONLY,
                Payload::Str(_) => STRING_PROTO_ONLY,
                Payload::Function(_) => FUNCTION_PROTO_ONLY,
                Payload::Object(o) => &o.prototypes,
            },
        }
    }

    /// Borrowed view of the full prototype chain, built on first use for
    /// user-defined objects.
    pub fn get_topology(&mut self, r: ObjRef) -> &[ObjRef] {
        let i = match r {
            ObjRef::Static(s) => return static_topology(s),
            ObjRef::Dynamic(i) => i,
        };
        if let Some(chain) = builtin_chain(&self.slots[i as usize].payload) {
            return chain;
        }
        self.ensure_topology(r);
        match &self.slots[i as usize].payload {
            Payload::Object(o) => o.topology.as_deref().unwrap_or(NO_PROTOS),
            _ => NO_PROTOS,
        }
    }

    fn ensure_topology(&mut self, r: ObjRef) {
        let ObjRef::Dynamic(i) = r else { return };
        let needs = matches!(
            &self.slots[i as usize].payload,
            Payload::Object(o) if o.topology.is_none()
        );
        if !needs {
            return;
        }
        let protos: Vec<ObjRef> = match &self.slots[i as usize].payload {
            Payload::Object(o) => o.prototypes.clone(),
            _ => Vec::new(),
        };
        let topology = if protos.len() == 1 {
            // cheap path: prepend the sole prototype to its own chain
            let p = protos[0];
            let mut chain = Vec::with_capacity(4);
            chain.push(p);
            chain.extend_from_slice(self.get_topology(p));
            chain
        } else {
            let mut seen = HashSet::new();
            let mut collected = Vec::new();
            for &p in protos.iter().rev() {
                self.linearize(p, &mut seen, &mut collected);
            }
            collected.reverse();
            collected
        };
        if let Payload::Object(o) = &mut self.slots[i as usize].payload {
            o.topology = Some(topology);
        }
    }

    fn linearize(&self, r: ObjRef, seen: &mut HashSet<ObjRef>, out: &mut Vec<ObjRef>) {
        if !seen.insert(r) {
            return;
        }
        let protos: Vec<ObjRef> = self.get_prototypes(r).to_vec();
        for &p in protos.iter().rev() {
            self.linearize(p, seen, out);
        }
        out.push(r);
    }

    // ── Properties ───────────────────────────────────────────────────────────

    /// Directly-owned property keys, in first-insertion order.
    pub fn get_keys(&self, r: ObjRef) -> &[ObjRef] {
        match r {
            ObjRef::Dynamic(i) => match &self.slots[i as usize].payload {
                Payload::Object(o) => &o.keys,
                _ => NO_PROTOS,
            },
            _ => NO_PROTOS,
        }
    }

    /// Property keys in the tree's in-order traversal (the key total order).
    pub fn keys_in_order(&self, r: ObjRef) -> Vec<ObjRef> {
        match r {
            ObjRef::Dynamic(i) => match &self.slots[i as usize].payload {
                Payload::Object(o) => o.props.values().map(|p| p.key).collect(),
                _ => Vec::new(),
            },
            _ => Vec::new(),
        }
    }

    /// Look up on the object itself only; `None` means absent.
    pub fn get_property(&self, obj: ObjRef, key: ObjRef) -> Option<ObjRef> {
        let pk = self.prop_key(key);
        self.get_record(obj, &pk).map(|p| p.value)
    }

    /// Look up on the object, then along its topology; the first match wins.
    pub fn resolve_property(&mut self, obj: ObjRef, key: ObjRef) -> Option<ObjRef> {
        let pk = self.prop_key(key);
        if let Some(p) = self.get_record(obj, &pk) {
            return Some(p.value);
        }
        let topology: Vec<ObjRef> = self.get_topology(obj).to_vec();
        for t in topology {
            if let Some(p) = self.get_record(t, &pk) {
                return Some(p.value);
            }
        }
        None
    }

    /// First object along `obj`'s chain (itself included) that directly owns
    /// `key`. Used by assignment to find the variable's declaring scope.
    pub fn find_property_owner(&mut self, obj: ObjRef, key: ObjRef) -> Option<ObjRef> {
        let pk = self.prop_key(key);
        if self.get_record(obj, &pk).is_some() {
            return Some(obj);
        }
        let topology: Vec<ObjRef> = self.get_topology(obj).to_vec();
        topology
            .into_iter()
            .find(|&t| self.get_record(t, &pk).is_some())
    }

    fn get_record(&self, obj: ObjRef, pk: &PropKey) -> Option<Property> {
        match obj {
            ObjRef::Dynamic(i) => match &self.slots[i as usize].payload {
                Payload::Object(o) => o.props.get(pk).copied(),
                _ => None,
            },
            _ => None,
        }
    }

    fn is_mutable(&self, obj: ObjRef) -> bool {
        matches!(obj, ObjRef::Dynamic(i)
            if matches!(&self.slots[i as usize].payload, Payload::Object(_)))
    }

    /// Declare a new property. The store retains its own references to the
    /// key and the value; the caller keeps ownership of what it passed.
    pub fn add_property(
        &mut self,
        obj: ObjRef,
        key: ObjRef,
        value: ObjRef,
        constant: bool,
    ) -> Result<(), PropError> {
        if !self.is_mutable(obj) {
            return Err(PropError::ImmutableObject);
        }
        let pk = self.prop_key(key);
        if self.get_record(obj, &pk).is_some() {
            return Err(PropError::AlreadyExists);
        }
        self.inc_ref(key);
        self.inc_ref(value);
        let ObjRef::Dynamic(i) = obj else { return Err(PropError::ImmutableObject) };
        if let Payload::Object(o) = &mut self.slots[i as usize].payload {
            o.keys.push(key);
            o.props.insert(pk, Property { key, value, constant });
        }
        Ok(())
    }

    /// Assign an existing property.
    pub fn set_property(
        &mut self,
        obj: ObjRef,
        key: ObjRef,
        value: ObjRef,
    ) -> Result<(), PropError> {
        if !self.is_mutable(obj) {
            return Err(PropError::ImmutableObject);
        }
        let pk = self.prop_key(key);
        let old = match self.get_record(obj, &pk) {
            None => return Err(PropError::NotFound),
            Some(p) if p.constant => return Err(PropError::IsConstant),
            Some(p) => p.value,
        };
        if old == value {
            return Ok(());
        }
        self.inc_ref(value);
        let ObjRef::Dynamic(i) = obj else { return Err(PropError::ImmutableObject) };
        if let Payload::Object(o) = &mut self.slots[i as usize].payload {
            if let Some(p) = o.props.get_mut(&pk) {
                p.value = value;
            }
        }
        self.dec_ref(old);
        Ok(())
    }

    // ── Arithmetic ───────────────────────────────────────────────────────────

    /// `left + right`, or `None` when the combination has no definition.
    pub fn add(&mut self, left: ObjRef, right: ObjRef) -> Option<ObjRef> {
        if let (Some(a), Some(b)) = (self.get_integer_value(left), self.get_integer_value(right))
        {
            return Some(self.alloc_int(a.wrapping_add(b)));
        }
        if let (Some(a), Some(b)) = (self.get_real_value(left), self.get_real_value(right)) {
            return Some(self.alloc_real(a + b));
        }
        let joined = match (self.string_text(left), self.string_text(right)) {
            (Some(a), Some(b)) => {
                let mut s = String::with_capacity(a.len() + b.len());
                s.push_str(a);
                s.push_str(b);
                Some(s)
            }
            _ => None,
        };
        joined.map(|s| self.alloc_string(s))
    }

    /// `left - right`, or `None` when the combination has no definition.
    pub fn subtract(&mut self, left: ObjRef, right: ObjRef) -> Option<ObjRef> {
        if let (Some(a), Some(b)) = (self.get_integer_value(left), self.get_integer_value(right))
        {
            return Some(self.alloc_int(a.wrapping_sub(b)));
        }
        if let (Some(a), Some(b)) = (self.get_real_value(left), self.get_real_value(right)) {
            return Some(self.alloc_real(a - b));
        }
        None
    }

    // ── Coercions ────────────────────────────────────────────────────────────

    pub fn get_boolean_value(&self, r: ObjRef) -> bool {
        match r {
            ObjRef::Static(s) => match s {
                StaticObj::Null | StaticObj::False | StaticObj::Zero | StaticObj::EmptyString => {
                    false
                }
                StaticObj::Root
                | StaticObj::NumberProto
                | StaticObj::RealProto
                | StaticObj::StringProto
                | StaticObj::FunctionProto => false,
                _ => true,
            },
            ObjRef::Dynamic(i) => match &self.slots[i as usize].payload {
                Payload::Int(v) => *v != 0,
                Payload::Real(v) => *v != 0.0,
                Payload::Str(s) => !s.text.is_empty(),
                Payload::Function(_) => true,
                Payload::Object(o) => !o.keys.is_empty(),
            },
        }
    }

    pub fn get_integer_value(&self, r: ObjRef) -> Option<i64> {
        match r {
            ObjRef::Static(StaticObj::Zero) => Some(0),
            ObjRef::Static(StaticObj::One) => Some(1),
            ObjRef::Static(StaticObj::MinusOne) => Some(-1),
            ObjRef::Dynamic(i) => match &self.slots[i as usize].payload {
                Payload::Int(v) => Some(*v),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn get_real_value(&self, r: ObjRef) -> Option<f64> {
        match r {
            ObjRef::Static(StaticObj::Zero) => Some(0.0),
            ObjRef::Static(StaticObj::One) => Some(1.0),
            ObjRef::Static(StaticObj::MinusOne) => Some(-1.0),
            ObjRef::Static(StaticObj::Pi) => Some(consts::PI),
            ObjRef::Dynamic(i) => match &self.slots[i as usize].payload {
                Payload::Int(v) => Some(*v as f64),
                Payload::Real(v) => Some(*v),
                _ => None,
            },
            _ => None,
        }
    }

    // ── Strings and functions ────────────────────────────────────────────────

    pub fn string_text(&self, r: ObjRef) -> Option<&str> {
        match r {
            EMPTY_STRING => Some(""),
            ObjRef::Dynamic(i) => match &self.slots[i as usize].payload {
                Payload::Str(s) => Some(&s.text),
                _ => None,
            },
            _ => None,
        }
    }

    /// Length in characters.
    pub fn string_chars(&self, r: ObjRef) -> Option<usize> {
        match r {
            EMPTY_STRING => Some(0),
            ObjRef::Dynamic(i) => match &self.slots[i as usize].payload {
                Payload::Str(s) => Some(s.chars),
                _ => None,
            },
            _ => None,
        }
    }

    /// Argument names, entry index and closure of a dynamic function.
    pub fn function_parts(&self, r: ObjRef) -> Option<(Vec<ObjRef>, usize, ObjRef)> {
        match r {
            ObjRef::Dynamic(i) => match &self.slots[i as usize].payload {
                Payload::Function(f) => Some((f.arg_names.clone(), f.entry, f.closure)),
                _ => None,
            },
            _ => None,
        }
    }

    // ── Cloning ──────────────────────────────────────────────────────────────

    /// Same-process clone: a bumped reference to the same object. Singletons
    /// return themselves.
    pub fn clone_ref(&mut self, r: ObjRef) -> ObjRef {
        self.inc_ref(r);
        r
    }

    /// Cross-process clone: a fresh equivalent owned by this heap. Shared
    /// substructure stays shared; property insertion order is preserved.
    pub fn import_from(&mut self, src: &Heap, r: ObjRef) -> ObjRef {
        let mut memo = HashMap::new();
        self.import_rec(src, r, &mut memo)
    }

    fn import_rec(
        &mut self,
        src: &Heap,
        r: ObjRef,
        memo: &mut HashMap<u32, ObjRef>,
    ) -> ObjRef {
        let ObjRef::Dynamic(i) = r else { return r };
        if let Some(&copy) = memo.get(&i) {
            self.inc_ref(copy);
            return copy;
        }
        match &src.slots[i as usize].payload {
            Payload::Int(v) => self.alloc_int(*v),
            Payload::Real(v) => self.alloc_real(*v),
            Payload::Str(s) => self.alloc_string(s.text.clone()),
            Payload::Function(f) => {
                let src_names = f.arg_names.clone();
                let (entry, src_closure) = (f.entry, f.closure);
                let mut names = Vec::with_capacity(src_names.len());
                for n in src_names {
                    names.push(self.import_rec(src, n, memo));
                }
                let closure = self.import_rec(src, src_closure, memo);
                let copy = self.alloc_function(names, entry, closure);
                memo.insert(i, copy);
                copy
            }
            Payload::Object(o) => {
                let src_protos = o.prototypes.clone();
                let src_keys = o.keys.clone();
                let copy = self.alloc_object(Vec::new());
                memo.insert(i, copy);
                let mut protos = Vec::with_capacity(src_protos.len());
                for p in src_protos {
                    protos.push(self.import_rec(src, p, memo));
                }
                self.set_prototypes(copy, protos);
                for k in src_keys {
                    let pk = src.prop_key(k);
                    let Some(record) = src.get_record(r, &pk) else { continue };
                    let key = self.import_rec(src, record.key, memo);
                    let value = self.import_rec(src, record.value, memo);
                    let _ = self.add_property(copy, key, value, record.constant);
                    self.dec_ref(key);
                    self.dec_ref(value);
                }
                copy
            }
        }
    }
}

fn builtin_chain(payload: &Payload) -> Option<&'static [ObjRef]> {
    match payload {
        Payload::Int(_) => Some(INT_TOPOLOGY),
        Payload::Real(_) => Some(REAL_TOPOLOGY),
        Payload::Str(_) => Some(STRING_TOPOLOGY),
        Payload::Function(_) => Some(FUNCTION_TOPOLOGY),
        Payload::Object(_) => None,
    }
}

fn quote_string(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for ch in text.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(ch),
        }
    }
    out.push('"');
    out
}
