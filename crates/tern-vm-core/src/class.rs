//! Hidden classes
//!
//! A class describes the layout of an object's named properties: their
//! names, attributes and slot indices. Objects built the same way share a
//! class through a transition tree rooted at one class per prototype, so a
//! class id alone identifies both the layout and the prototype. Inline
//! caches key on that id.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tern_vm_gc::GcRef;

use crate::value::JsString;

static NEXT_CLASS_ID: AtomicU32 = AtomicU32::new(1);

/// Unique class identifier; zero is reserved for "empty cache entry"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ClassId(pub u32);

impl ClassId {
    /// Never assigned to a class
    pub const EMPTY: ClassId = ClassId(0);

    /// Allocate a fresh id
    pub fn fresh() -> Self {
        ClassId(NEXT_CLASS_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Property attribute bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PropertyAttributes(u8);

impl PropertyAttributes {
    /// Value can be changed
    pub const WRITABLE: u8 = 1;
    /// Shows up in enumeration
    pub const ENUMERABLE: u8 = 2;
    /// Can be deleted or redefined
    pub const CONFIGURABLE: u8 = 4;

    /// Writable, enumerable and configurable
    pub const DEFAULT: PropertyAttributes = PropertyAttributes(7);
    /// Writable and configurable but hidden from enumeration
    pub const HIDDEN: PropertyAttributes = PropertyAttributes(5);
    /// Neither writable nor configurable
    pub const FROZEN: PropertyAttributes = PropertyAttributes(0);

    /// From raw bits
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits & 7)
    }

    /// Raw bits
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Writable bit
    pub const fn writable(self) -> bool {
        self.0 & Self::WRITABLE != 0
    }

    /// Enumerable bit
    pub const fn enumerable(self) -> bool {
        self.0 & Self::ENUMERABLE != 0
    }

    /// Configurable bit
    pub const fn configurable(self) -> bool {
        self.0 & Self::CONFIGURABLE != 0
    }
}

impl Default for PropertyAttributes {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Shared handle to a class
pub type ClassRef = Arc<Class>;

/// Layout of an object's named properties
pub struct Class {
    id: ClassId,
    prototype: Option<GcRef>,
    parent: Option<ClassRef>,
    names: Vec<JsString>,
    attributes: Vec<PropertyAttributes>,
    index: FxHashMap<JsString, u32>,
    /// Child classes keyed by added name and attribute bits.
    /// Weak so unused branches of the tree can die.
    transitions: Mutex<FxHashMap<(JsString, u8), Weak<Class>>>,
}

impl Class {
    /// Empty class for objects with the given prototype
    pub fn root(prototype: Option<GcRef>) -> ClassRef {
        Arc::new(Self {
            id: ClassId::fresh(),
            prototype,
            parent: None,
            names: Vec::new(),
            attributes: Vec::new(),
            index: FxHashMap::default(),
            transitions: Mutex::new(FxHashMap::default()),
        })
    }

    /// Class id
    #[inline]
    pub fn id(&self) -> ClassId {
        self.id
    }

    /// Prototype shared by every object of this class
    #[inline]
    pub fn prototype(&self) -> Option<GcRef> {
        self.prototype
    }

    /// Class this one was derived from
    pub fn parent(&self) -> Option<&ClassRef> {
        self.parent.as_ref()
    }

    /// Number of properties
    #[inline]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Whether the class has no properties
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Slot index of a property
    #[inline]
    pub fn find(&self, name: &str) -> Option<u32> {
        self.index.get(name).copied()
    }

    /// Property name at a slot
    pub fn name(&self, index: u32) -> Option<&JsString> {
        self.names.get(index as usize)
    }

    /// Attributes of the property at a slot
    pub fn attributes(&self, index: u32) -> PropertyAttributes {
        self.attributes
            .get(index as usize)
            .copied()
            .unwrap_or(PropertyAttributes::DEFAULT)
    }

    /// Property names in slot order
    pub fn names(&self) -> &[JsString] {
        &self.names
    }

    /// Class with one more property, shared with every object that made the same transition
    pub fn add_property(self: &Arc<Self>, name: &JsString, attributes: PropertyAttributes) -> ClassRef {
        let key = (name.clone(), attributes.bits());
        let mut transitions = self.transitions.lock();
        if let Some(existing) = transitions.get(&key).and_then(Weak::upgrade) {
            return existing;
        }
        let mut child = self.derive();
        child.index.insert(name.clone(), child.names.len() as u32);
        child.names.push(name.clone());
        child.attributes.push(attributes);
        let child = Arc::new(child);
        transitions.insert(key, Arc::downgrade(&child));
        child
    }

    /// Unshared class with different attributes for one slot
    pub fn with_attributes(self: &Arc<Self>, index: u32, attributes: PropertyAttributes) -> ClassRef {
        let mut child = self.derive();
        if let Some(slot) = child.attributes.get_mut(index as usize) {
            *slot = attributes;
        }
        Arc::new(child)
    }

    fn derive(self: &Arc<Self>) -> Class {
        Class {
            id: ClassId::fresh(),
            prototype: self.prototype,
            parent: Some(Arc::clone(self)),
            names: self.names.clone(),
            attributes: self.attributes.clone(),
            index: self.index.clone(),
            transitions: Mutex::new(FxHashMap::default()),
        }
    }
}

impl std::fmt::Debug for Class {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Class")
            .field("id", &self.id)
            .field("property_count", &self.len())
            .finish()
    }
}

/// Root classes by prototype, plus the prototype-chain epoch.
///
/// The epoch advances whenever a prototype object changes shape or an
/// attribute, which invalidates every cache entry that depends on the
/// contents of a prototype chain.
#[derive(Debug, Default)]
pub struct ClassTable {
    roots: FxHashMap<Option<GcRef>, ClassRef>,
    proto_epoch: u64,
}

impl ClassTable {
    /// Root class for objects with this prototype
    pub fn root_for(&mut self, prototype: Option<GcRef>) -> ClassRef {
        self.roots
            .entry(prototype)
            .or_insert_with(|| Class::root(prototype))
            .clone()
    }

    /// Current prototype-chain epoch
    #[inline]
    pub fn epoch(&self) -> u64 {
        self.proto_epoch
    }

    /// Invalidate every prototype-dependent cache entry
    pub fn bump_epoch(&mut self) {
        self.proto_epoch += 1;
    }

    /// Forget root classes whose prototype died
    pub fn prune(&mut self, is_live: impl Fn(GcRef) -> bool) {
        self.roots
            .retain(|prototype, _| prototype.is_none_or(|p| is_live(p)));
    }

    /// Number of root classes
    pub fn root_count(&self) -> usize {
        self.roots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> JsString {
        JsString::from(s)
    }

    #[test]
    fn test_transitions_are_shared() {
        let root = Class::root(None);
        let a1 = root.add_property(&name("a"), PropertyAttributes::DEFAULT);
        let a2 = root.add_property(&name("a"), PropertyAttributes::DEFAULT);
        assert_eq!(a1.id(), a2.id());
        let hidden = root.add_property(&name("a"), PropertyAttributes::HIDDEN);
        assert_ne!(hidden.id(), a1.id());
        let ab = a1.add_property(&name("b"), PropertyAttributes::DEFAULT);
        assert_eq!(ab.find("b"), Some(1));
        assert_eq!(ab.find("a"), Some(0));
        assert_eq!(ab.len(), 2);
        assert!(ab.parent().is_some());
    }

    #[test]
    fn test_attribute_change_makes_new_class() {
        let root = Class::root(None);
        let a = root.add_property(&name("a"), PropertyAttributes::DEFAULT);
        let frozen = a.with_attributes(0, PropertyAttributes::FROZEN);
        assert_ne!(frozen.id(), a.id());
        assert!(!frozen.attributes(0).writable());
        assert!(a.attributes(0).writable());
    }

    #[test]
    fn test_epoch_and_roots() {
        let mut table = ClassTable::default();
        let r1 = table.root_for(None);
        let r2 = table.root_for(None);
        assert_eq!(r1.id(), r2.id());
        let before = table.epoch();
        table.bump_epoch();
        assert_eq!(table.epoch(), before + 1);
        table.prune(|_| false);
        assert_eq!(table.root_count(), 1);
    }
}
