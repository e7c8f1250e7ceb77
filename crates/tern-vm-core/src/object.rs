//! Heap objects
//!
//! Named properties live in `slots`, laid out by the object's hidden class
//! or, past a size threshold or after a delete, by a private dictionary.
//! Array-like objects also carry dense `elements`.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tern_vm_gc::{GcRef, Trace, Tracer};

use crate::class::{ClassId, ClassRef, PropertyAttributes};
use crate::error::ErrorKind;
use crate::value::{JsString, Value};

/// Objects captured by a closure, innermost first
pub type ScopeChain = SmallVec<[GcRef; 4]>;

/// Index into the runtime's host function table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostFunctionId(pub u32);

/// Built-in functions the dispatch loop recognizes by identity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    /// `Function.prototype.apply`
    Apply,
    /// `Function.prototype.call`
    Call,
    /// `Function.prototype.bind`
    Bind,
    /// The global `eval`
    Eval,
}

/// What calling a function object does
#[derive(Debug, Clone)]
pub enum Callable {
    /// Interpreted function
    Bytecode {
        /// Code instance
        code: GcRef,
        /// Captured scope objects
        scope: ScopeChain,
    },
    /// Host function
    Host {
        /// Host table entry
        id: HostFunctionId,
        /// Identity the dispatch loop special-cases
        builtin: Option<Builtin>,
    },
    /// Result of `Function.prototype.bind`
    Bound {
        /// Target function
        target: GcRef,
        /// Bound `this`
        this: Value,
        /// Leading arguments
        args: Vec<Value>,
    },
}

/// Global variables declared with `var` or function declarations.
///
/// Kept apart from the global object's properties so global caches can
/// point straight at a variable slot.
#[derive(Debug, Clone, Default)]
pub struct GlobalVariables {
    index: FxHashMap<JsString, u32>,
    values: Vec<Value>,
}

impl GlobalVariables {
    /// Slot of a variable
    #[inline]
    pub fn find(&self, name: &str) -> Option<u32> {
        self.index.get(name).copied()
    }

    /// Declare a variable, keeping an existing value; returns its slot
    pub fn declare(&mut self, name: &JsString) -> u32 {
        if let Some(slot) = self.find(name) {
            return slot;
        }
        let slot = self.values.len() as u32;
        self.index.insert(name.clone(), slot);
        self.values.push(Value::Undefined);
        slot
    }

    /// Value in a slot
    #[inline]
    pub fn get(&self, slot: u32) -> Option<&Value> {
        self.values.get(slot as usize)
    }

    /// Overwrite a slot
    #[inline]
    pub fn set(&mut self, slot: u32, value: Value) {
        if let Some(target) = self.values.get_mut(slot as usize) {
            *target = value;
        }
    }

    /// Number of variables
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether no variable is declared
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Object flavour
#[derive(Debug, Clone)]
pub enum ObjectKind {
    /// Plain object
    Ordinary,
    /// Array; `length` mirrors `elements`
    Array,
    /// `arguments` object
    Arguments,
    /// Native error
    Error(ErrorKind),
    /// Function
    Function(Callable),
    /// The global object
    Global(GlobalVariables),
    /// Regular expression literal
    RegExp {
        /// Pattern source
        source: JsString,
        /// Flags
        flags: JsString,
    },
}

/// Property layout private to one object
#[derive(Debug, Clone)]
pub struct Dictionary {
    pub(crate) id: ClassId,
    pub(crate) names: Vec<JsString>,
    pub(crate) attributes: Vec<PropertyAttributes>,
    pub(crate) index: FxHashMap<JsString, u32>,
}

impl Dictionary {
    fn from_class(class: &ClassRef) -> Self {
        let names = class.names().to_vec();
        let attributes = (0..names.len() as u32).map(|i| class.attributes(i)).collect();
        let index = names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i as u32))
            .collect();
        Self {
            id: ClassId::fresh(),
            names,
            attributes,
            index,
        }
    }

    fn remove(&mut self, slot: u32) {
        let slot = slot as usize;
        let name = self.names.remove(slot);
        self.attributes.remove(slot);
        self.index.remove(&name);
        for (i, name) in self.names.iter().enumerate().skip(slot) {
            self.index.insert(name.clone(), i as u32);
        }
        self.id = ClassId::fresh();
    }
}

/// A heap object
#[derive(Debug, Clone)]
pub struct JsObject {
    pub(crate) class: ClassRef,
    pub(crate) dictionary: Option<Box<Dictionary>>,
    pub(crate) slots: Vec<Value>,
    pub(crate) elements: Vec<Value>,
    pub(crate) kind: ObjectKind,
    pub(crate) is_prototype: bool,
}

impl JsObject {
    /// Empty object with the given root class
    pub fn new(class: ClassRef, kind: ObjectKind) -> Self {
        Self {
            class,
            dictionary: None,
            slots: Vec::new(),
            elements: Vec::new(),
            kind,
            is_prototype: false,
        }
    }

    /// Id inline caches compare against
    #[inline]
    pub fn class_id(&self) -> ClassId {
        match &self.dictionary {
            Some(dictionary) => dictionary.id,
            None => self.class.id(),
        }
    }

    /// Hidden class; its layout is stale in dictionary mode
    pub fn class(&self) -> &ClassRef {
        &self.class
    }

    /// Prototype
    #[inline]
    pub fn prototype(&self) -> Option<GcRef> {
        self.class.prototype()
    }

    /// Whether properties live in a private dictionary
    #[inline]
    pub fn is_dictionary(&self) -> bool {
        self.dictionary.is_some()
    }

    /// Whether some object inherits from this one
    pub fn is_prototype(&self) -> bool {
        self.is_prototype
    }

    /// Number of named properties
    #[inline]
    pub fn property_count(&self) -> u32 {
        self.slots.len() as u32
    }

    /// Kind
    pub fn kind(&self) -> &ObjectKind {
        &self.kind
    }

    /// Mutable kind
    pub fn kind_mut(&mut self) -> &mut ObjectKind {
        &mut self.kind
    }

    /// Call behaviour, for function objects
    pub fn callable(&self) -> Option<&Callable> {
        match &self.kind {
            ObjectKind::Function(callable) => Some(callable),
            _ => None,
        }
    }

    /// Whether elements back indexed access
    #[inline]
    pub fn has_elements(&self) -> bool {
        matches!(self.kind, ObjectKind::Array | ObjectKind::Arguments)
    }

    /// Dense elements
    pub fn elements(&self) -> &[Value] {
        &self.elements
    }

    /// Own property slot
    #[inline]
    pub fn find_own(&self, name: &str) -> Option<u32> {
        match &self.dictionary {
            Some(dictionary) => dictionary.index.get(name).copied(),
            None => self.class.find(name),
        }
    }

    /// Attributes of an own slot
    pub fn attributes(&self, slot: u32) -> PropertyAttributes {
        match &self.dictionary {
            Some(dictionary) => dictionary
                .attributes
                .get(slot as usize)
                .copied()
                .unwrap_or_default(),
            None => self.class.attributes(slot),
        }
    }

    /// Value in an own slot
    #[inline]
    pub fn slot(&self, slot: u32) -> Option<&Value> {
        self.slots.get(slot as usize)
    }

    /// Overwrite an own slot
    #[inline]
    pub fn set_slot(&mut self, slot: u32, value: Value) {
        if let Some(target) = self.slots.get_mut(slot as usize) {
            *target = value;
        }
    }

    /// Own property names in slot order
    pub fn own_names(&self) -> Vec<JsString> {
        match &self.dictionary {
            Some(dictionary) => dictionary.names.clone(),
            None => self.class.names().to_vec(),
        }
    }

    /// Own data property value
    pub fn get_own(&self, name: &str) -> Option<&Value> {
        self.find_own(name).and_then(|slot| self.slot(slot))
    }

    /// Append a property and return its slot. The caller has checked the
    /// name is absent.
    pub(crate) fn append_property(
        &mut self,
        name: &JsString,
        value: Value,
        attributes: PropertyAttributes,
        dictionary_threshold: usize,
    ) -> u32 {
        let slot = self.slots.len() as u32;
        match &mut self.dictionary {
            Some(dictionary) => {
                dictionary.index.insert(name.clone(), slot);
                dictionary.names.push(name.clone());
                dictionary.attributes.push(attributes);
            }
            None => {
                self.class = self.class.add_property(name, attributes);
                if self.class.len() > dictionary_threshold {
                    self.make_dictionary();
                }
            }
        }
        self.slots.push(value);
        slot
    }

    /// Change one slot's attributes, giving the object a new class id
    pub(crate) fn set_attributes(&mut self, slot: u32, attributes: PropertyAttributes) {
        match &mut self.dictionary {
            Some(dictionary) => {
                if let Some(target) = dictionary.attributes.get_mut(slot as usize) {
                    *target = attributes;
                }
                dictionary.id = ClassId::fresh();
            }
            None => self.class = self.class.with_attributes(slot, attributes),
        }
    }

    /// Remove an own slot; the object switches to dictionary mode
    pub(crate) fn remove_property(&mut self, slot: u32) {
        self.make_dictionary();
        if let Some(dictionary) = &mut self.dictionary {
            dictionary.remove(slot);
        }
        self.slots.remove(slot as usize);
    }

    /// Switch to a private property layout
    pub(crate) fn make_dictionary(&mut self) {
        if self.dictionary.is_none() {
            self.dictionary = Some(Box::new(Dictionary::from_class(&self.class)));
        }
    }

    /// Approximate heap footprint
    pub fn size_hint(&self) -> usize {
        std::mem::size_of::<Self>()
            + (self.slots.capacity() + self.elements.capacity()) * std::mem::size_of::<Value>()
    }
}

impl Trace for Callable {
    fn trace(&self, tracer: &mut Tracer<'_>) {
        match self {
            Callable::Bytecode { code, scope } => {
                tracer.mark(*code);
                for &object in scope {
                    tracer.mark(object);
                }
            }
            Callable::Host { .. } => {}
            Callable::Bound { target, this, args } => {
                tracer.mark(*target);
                this.trace(tracer);
                tracer.trace_all(args);
            }
        }
    }
}

impl Trace for JsObject {
    fn trace(&self, tracer: &mut Tracer<'_>) {
        tracer.mark_opt(self.prototype());
        tracer.trace_all(&self.slots);
        tracer.trace_all(&self.elements);
        match &self.kind {
            ObjectKind::Function(callable) => callable.trace(tracer),
            ObjectKind::Global(variables) => tracer.trace_all(&variables.values),
            _ => {}
        }
    }
}
