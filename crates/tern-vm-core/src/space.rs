//! Object space: the heap plus the property protocol
//!
//! The lookup operations report, besides their result, whether the outcome
//! may be stored in an inline cache and where the property was found. The
//! dispatch loop turns that into cache entries; everything else uses the
//! results directly.

use tern_vm_gc::{GcConfig, GcRef};

use crate::cache::{Receiver, can_cache};
use crate::class::{ClassRef, ClassTable, PropertyAttributes};
use crate::code::CodeInstance;
use crate::error::{VmError, VmResult};
use crate::gc::{HeapCell, VmHeap};
use crate::object::{Callable, JsObject, ObjectKind};
use crate::value::{JsString, Value};

/// Arrays grow densely up to this index; larger indices become named properties
const MAX_DENSE_INDEX: u32 = 1 << 24;

/// Outcome of a property operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyResult {
    /// Found or stored
    Ok,
    /// Found or stored, and the outcome may be cached
    OkCanCache,
    /// Absent
    NotFound,
    /// Absent, and the absence may be cached
    NotFoundCanCache,
    /// Rejected (read-only or non-configurable)
    Failed,
}

impl PropertyResult {
    /// Whether the property exists
    pub fn is_found(self) -> bool {
        matches!(self, Self::Ok | Self::OkCanCache)
    }

    /// Whether the outcome may be cached
    pub fn can_cache(self) -> bool {
        matches!(self, Self::OkCanCache | Self::NotFoundCanCache)
    }
}

/// Result of a named get
#[derive(Debug, Clone)]
pub struct GetResult {
    /// Outcome
    pub result: PropertyResult,
    /// Property value, `undefined` when absent
    pub value: Value,
    /// Prototype holding the property; `None` for own properties
    pub holder: Option<GcRef>,
    /// Slot in the holder
    pub offset: u32,
    /// Receiver property count at lookup time
    pub limit: u32,
}

/// Result of a named put
#[derive(Debug, Clone)]
pub struct PutResult {
    /// Outcome
    pub result: PropertyResult,
    /// Slot written
    pub offset: u32,
    /// Class the receiver moved to, when the put added a property
    pub transition: Option<ClassRef>,
}

/// Canonical array index form of a property name
pub fn array_index(name: &str) -> Option<u32> {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() > 10 || (bytes.len() > 1 && bytes[0] == b'0') {
        return None;
    }
    if !bytes.iter().all(u8::is_ascii_digit) {
        return None;
    }
    let value: u64 = name.parse().ok()?;
    (value < u32::MAX as u64).then_some(value as u32)
}

/// The heap and the class table
#[derive(Debug)]
pub struct ObjectSpace {
    pub(crate) heap: VmHeap,
    pub(crate) classes: ClassTable,
    dictionary_threshold: usize,
}

impl ObjectSpace {
    /// Create an empty space
    pub fn new(gc: GcConfig, dictionary_threshold: usize) -> Self {
        Self {
            heap: VmHeap::new(gc),
            classes: ClassTable::default(),
            dictionary_threshold,
        }
    }

    /// The heap
    pub fn heap(&self) -> &VmHeap {
        &self.heap
    }

    /// The class table
    pub fn classes(&self) -> &ClassTable {
        &self.classes
    }

    /// Current prototype epoch
    #[inline]
    pub fn epoch(&self) -> u64 {
        self.classes.epoch()
    }

    /// Object behind a handle
    #[inline]
    pub fn object(&self, handle: GcRef) -> VmResult<&JsObject> {
        match self.heap.get(handle) {
            Some(HeapCell::Object(object)) => Ok(object),
            Some(HeapCell::Code(_)) => Err(VmError::internal("handle names a code instance")),
            None => Err(VmError::internal("dangling object handle")),
        }
    }

    /// Mutable object behind a handle
    #[inline]
    pub fn object_mut(&mut self, handle: GcRef) -> VmResult<&mut JsObject> {
        match self.heap.get_mut(handle) {
            Some(HeapCell::Object(object)) => Ok(object),
            Some(HeapCell::Code(_)) => Err(VmError::internal("handle names a code instance")),
            None => Err(VmError::internal("dangling object handle")),
        }
    }

    /// Code instance behind a handle
    #[inline]
    pub fn code(&self, handle: GcRef) -> VmResult<&CodeInstance> {
        match self.heap.get(handle) {
            Some(HeapCell::Code(code)) => Ok(code),
            _ => Err(VmError::internal("handle does not name a code instance")),
        }
    }

    /// Mutable code instance behind a handle
    #[inline]
    pub fn code_mut(&mut self, handle: GcRef) -> VmResult<&mut CodeInstance> {
        match self.heap.get_mut(handle) {
            Some(HeapCell::Code(code)) => Ok(code),
            _ => Err(VmError::internal("handle does not name a code instance")),
        }
    }

    /// Cache probe input for an object
    #[inline]
    pub fn receiver(&self, handle: GcRef) -> VmResult<Receiver> {
        let object = self.object(handle)?;
        Ok(Receiver {
            class_id: object.class_id(),
            count: object.property_count(),
            dictionary: object.is_dictionary(),
        })
    }

    /// Allocate a cell
    pub fn alloc(&mut self, cell: HeapCell) -> VmResult<GcRef> {
        let size = cell.size_hint();
        Ok(self.heap.allocate(size, cell)?)
    }

    /// Allocate an empty object
    pub fn alloc_object(&mut self, prototype: Option<GcRef>, kind: ObjectKind) -> VmResult<GcRef> {
        let class = self.root_class(prototype)?;
        self.alloc(HeapCell::Object(JsObject::new(class, kind)))
    }

    /// Allocate an object with a prebuilt class and matching slot values
    pub fn alloc_with_class(&mut self, class: ClassRef, slots: Vec<Value>) -> VmResult<GcRef> {
        debug_assert_eq!(class.len(), slots.len());
        if let Some(prototype) = class.prototype() {
            self.object_mut(prototype)?.is_prototype = true;
        }
        let mut object = JsObject::new(class, ObjectKind::Ordinary);
        object.slots = slots;
        self.alloc(HeapCell::Object(object))
    }

    /// Root class for a prototype, flagging the prototype object
    pub fn root_class(&mut self, prototype: Option<GcRef>) -> VmResult<ClassRef> {
        if let Some(prototype) = prototype {
            self.object_mut(prototype)?.is_prototype = true;
        }
        Ok(self.classes.root_for(prototype))
    }

    /// Call behaviour of a value, if it is a function object
    pub fn callable(&self, value: &Value) -> Option<(GcRef, Callable)> {
        let handle = value.as_object()?;
        let callable = self.object(handle).ok()?.callable()?.clone();
        Some((handle, callable))
    }

    /// Whether a value is a function object
    pub fn is_callable(&self, value: &Value) -> bool {
        value
            .as_object()
            .and_then(|handle| self.object(handle).ok())
            .is_some_and(|object| object.callable().is_some())
    }

    /// Named get along the prototype chain
    pub fn get_l(&self, handle: GcRef, name: &str) -> VmResult<GetResult> {
        let receiver = self.object(handle)?;
        let limit = receiver.property_count();
        let mut cacheable = true;
        let mut current = handle;
        let mut object = receiver;
        loop {
            match &object.kind {
                ObjectKind::Global(variables) => {
                    cacheable = false;
                    if let Some(value) = variables.find(name).and_then(|slot| variables.get(slot)) {
                        return Ok(Self::uncached(value.clone()));
                    }
                }
                ObjectKind::Array | ObjectKind::Arguments if name == "length" => {
                    return Ok(Self::uncached(Value::Int32(object.elements.len() as i32)));
                }
                _ => {}
            }
            if object.has_elements()
                && let Some(value) = array_index(name).and_then(|i| object.elements.get(i as usize))
            {
                return Ok(Self::uncached(value.clone()));
            }
            if let Some(offset) = object.find_own(name) {
                let value = object.slot(offset).cloned().unwrap_or_default();
                let result = if cacheable && can_cache(Some(offset), limit) {
                    PropertyResult::OkCanCache
                } else {
                    PropertyResult::Ok
                };
                return Ok(GetResult {
                    result,
                    value,
                    holder: (current != handle).then_some(current),
                    offset,
                    limit,
                });
            }
            match object.prototype() {
                Some(prototype) => {
                    current = prototype;
                    object = self.object(prototype)?;
                }
                None => break,
            }
        }
        let result = if cacheable && can_cache(None, limit) {
            PropertyResult::NotFoundCanCache
        } else {
            PropertyResult::NotFound
        };
        Ok(GetResult {
            result,
            value: Value::Undefined,
            holder: None,
            offset: 0,
            limit,
        })
    }

    fn uncached(value: Value) -> GetResult {
        GetResult {
            result: PropertyResult::Ok,
            value,
            holder: None,
            offset: 0,
            limit: 0,
        }
    }

    /// Whether the name is found anywhere along the chain
    pub fn has_property(&self, handle: GcRef, name: &str) -> VmResult<bool> {
        Ok(self.get_l(handle, name)?.result.is_found())
    }

    /// Own data property, ignoring the prototype chain
    pub fn get_own(&self, handle: GcRef, name: &str) -> VmResult<Option<Value>> {
        let object = self.object(handle)?;
        if let ObjectKind::Global(variables) = &object.kind
            && let Some(slot) = variables.find(name)
        {
            return Ok(variables.get(slot).cloned());
        }
        Ok(object.get_own(name).cloned())
    }

    /// Named put: overwrite an own property or add one
    pub fn put_l(&mut self, handle: GcRef, name: &JsString, value: Value) -> VmResult<PutResult> {
        let uncached = |result| PutResult {
            result,
            offset: 0,
            transition: None,
        };

        let object = self.object_mut(handle)?;
        if let ObjectKind::Global(variables) = &mut object.kind
            && let Some(slot) = variables.find(name)
        {
            variables.set(slot, value);
            return Ok(uncached(PropertyResult::Ok));
        }
        let is_array = matches!(object.kind, ObjectKind::Array);
        if is_array && &**name == "length" {
            self.set_array_length(handle, &value)?;
            return Ok(uncached(PropertyResult::Ok));
        }
        if let Some(index) = array_index(name)
            && self.put_element(handle, index, value.clone())?
        {
            return Ok(uncached(PropertyResult::Ok));
        }

        let object = self.object_mut(handle)?;
        if let Some(offset) = object.find_own(name) {
            if !object.attributes(offset).writable() {
                return Ok(uncached(PropertyResult::Failed));
            }
            object.set_slot(offset, value);
            let result = if can_cache(Some(offset), 0) {
                PropertyResult::OkCanCache
            } else {
                PropertyResult::Ok
            };
            return Ok(PutResult {
                result,
                offset,
                transition: None,
            });
        }

        let mut prototype = object.prototype();
        while let Some(current) = prototype {
            let holder = self.object(current)?;
            if let Some(offset) = holder.find_own(name) {
                if !holder.attributes(offset).writable() {
                    return Ok(uncached(PropertyResult::Failed));
                }
                break;
            }
            prototype = holder.prototype();
        }

        let threshold = self.dictionary_threshold;
        let object = self.object_mut(handle)?;
        let was_dictionary = object.is_dictionary();
        let offset = object.append_property(name, value, PropertyAttributes::DEFAULT, threshold);
        let transition = (!was_dictionary && !object.is_dictionary()).then(|| object.class.clone());
        let is_prototype = object.is_prototype;
        if is_prototype {
            self.classes.bump_epoch();
        }
        let result = if transition.is_some() && can_cache(Some(offset), offset) {
            PropertyResult::OkCanCache
        } else {
            PropertyResult::Ok
        };
        Ok(PutResult {
            result,
            offset,
            transition,
        })
    }

    /// Create or overwrite an own property with the given attributes
    pub fn define_own_property_l(
        &mut self,
        handle: GcRef,
        name: &JsString,
        value: Value,
        attributes: PropertyAttributes,
    ) -> VmResult<PropertyResult> {
        let threshold = self.dictionary_threshold;
        let object = self.object_mut(handle)?;
        if let ObjectKind::Global(variables) = &mut object.kind
            && let Some(slot) = variables.find(name)
        {
            variables.set(slot, value);
            return Ok(PropertyResult::Ok);
        }
        let changed = match object.find_own(name) {
            Some(offset) => {
                object.set_slot(offset, value);
                let changed = object.attributes(offset) != attributes;
                if changed {
                    object.set_attributes(offset, attributes);
                }
                changed
            }
            None => {
                object.append_property(name, value, attributes, threshold);
                true
            }
        };
        if changed && object.is_prototype {
            self.classes.bump_epoch();
        }
        Ok(PropertyResult::Ok)
    }

    /// Delete an own property; false when it is not configurable
    pub fn delete_l(&mut self, handle: GcRef, name: &str) -> VmResult<bool> {
        if let Some(index) = array_index(name)
            && let Some(deleted) = self.delete_element(handle, index)?
        {
            return Ok(deleted);
        }
        let object = self.object_mut(handle)?;
        if let ObjectKind::Global(variables) = &object.kind
            && variables.find(name).is_some()
        {
            return Ok(false);
        }
        let Some(offset) = object.find_own(name) else {
            return Ok(true);
        };
        if !object.attributes(offset).configurable() {
            return Ok(false);
        }
        object.remove_property(offset);
        if object.is_prototype {
            self.classes.bump_epoch();
        }
        Ok(true)
    }

    /// Declare a global variable and return its slot.
    ///
    /// An existing own property of the same name moves into the variable,
    /// which also invalidates global caches pointing at the property.
    pub fn declare_global_variable(&mut self, global: GcRef, name: &JsString) -> VmResult<u32> {
        let object = self.object_mut(global)?;
        let ObjectKind::Global(variables) = &object.kind else {
            return Err(VmError::internal("not a global object"));
        };
        if let Some(slot) = variables.find(name) {
            return Ok(slot);
        }
        let existing = object.find_own(name);
        let value = existing
            .and_then(|offset| object.slot(offset).cloned())
            .unwrap_or_default();
        if let Some(offset) = existing {
            object.remove_property(offset);
        }
        let ObjectKind::Global(variables) = &mut object.kind else {
            return Err(VmError::internal("not a global object"));
        };
        let slot = variables.declare(name);
        variables.set(slot, value);
        Ok(slot)
    }

    /// Indexed read of a dense element
    pub fn get_element(&self, handle: GcRef, index: u32) -> VmResult<Option<Value>> {
        let object = self.object(handle)?;
        if !object.has_elements() {
            return Ok(None);
        }
        Ok(object.elements.get(index as usize).cloned())
    }

    /// Indexed write; false when the object does not store the index densely
    pub fn put_element(&mut self, handle: GcRef, index: u32, value: Value) -> VmResult<bool> {
        let object = self.object_mut(handle)?;
        let len = object.elements.len();
        match object.kind {
            ObjectKind::Array if index < MAX_DENSE_INDEX => {
                let index = index as usize;
                if index >= len {
                    object
                        .elements
                        .try_reserve(index + 1 - len)
                        .map_err(|_| VmError::OutOfMemory)?;
                    object.elements.resize(index + 1, Value::Undefined);
                }
                object.elements[index] = value;
                Ok(true)
            }
            ObjectKind::Arguments if (index as usize) < len => {
                object.elements[index as usize] = value;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Delete a dense element; `None` when the object has no such element
    pub fn delete_element(&mut self, handle: GcRef, index: u32) -> VmResult<Option<bool>> {
        let object = self.object_mut(handle)?;
        if !object.has_elements() {
            return Ok(None);
        }
        match object.elements.get_mut(index as usize) {
            Some(slot) => {
                *slot = Value::Undefined;
                Ok(Some(true))
            }
            None => Ok(None),
        }
    }

    /// Replace the elements of an array or arguments object
    pub fn set_elements(&mut self, handle: GcRef, elements: Vec<Value>) -> VmResult<()> {
        self.object_mut(handle)?.elements = elements;
        Ok(())
    }

    fn set_array_length(&mut self, handle: GcRef, value: &Value) -> VmResult<()> {
        let length = value
            .as_number()
            .filter(|n| *n >= 0.0 && n.fract() == 0.0 && *n <= MAX_DENSE_INDEX as f64)
            .ok_or_else(|| VmError::range_error("Invalid array length"))?;
        let object = self.object_mut(handle)?;
        object.elements.resize(length as usize, Value::Undefined);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space() -> ObjectSpace {
        ObjectSpace::new(GcConfig::default(), 8)
    }

    fn name(s: &str) -> JsString {
        JsString::from(s)
    }

    #[test]
    fn test_array_index_parsing() {
        assert_eq!(array_index("0"), Some(0));
        assert_eq!(array_index("42"), Some(42));
        assert_eq!(array_index("042"), None);
        assert_eq!(array_index("-1"), None);
        assert_eq!(array_index("4294967295"), None);
        assert_eq!(array_index("1e3"), None);
    }

    #[test]
    fn test_get_through_prototype_is_cacheable() {
        let mut space = space();
        let proto = space.alloc_object(None, ObjectKind::Ordinary).unwrap();
        space.put_l(proto, &name("shared"), Value::Int32(7)).unwrap();
        let object = space.alloc_object(Some(proto), ObjectKind::Ordinary).unwrap();
        let found = space.get_l(object, "shared").unwrap();
        assert_eq!(found.result, PropertyResult::OkCanCache);
        assert_eq!(found.holder, Some(proto));
        assert_eq!(found.value.as_int32(), Some(7));

        let missing = space.get_l(object, "nope").unwrap();
        assert_eq!(missing.result, PropertyResult::NotFoundCanCache);
        assert!(missing.value.is_undefined());
    }

    #[test]
    fn test_prototype_mutation_bumps_epoch() {
        let mut space = space();
        let proto = space.alloc_object(None, ObjectKind::Ordinary).unwrap();
        let _child = space.alloc_object(Some(proto), ObjectKind::Ordinary).unwrap();
        let before = space.epoch();
        space.put_l(proto, &name("x"), Value::Null).unwrap();
        assert!(space.epoch() > before);

        let plain = space.alloc_object(None, ObjectKind::Ordinary).unwrap();
        let before = space.epoch();
        space.put_l(plain, &name("x"), Value::Null).unwrap();
        assert_eq!(space.epoch(), before);
    }

    #[test]
    fn test_put_reports_transition() {
        let mut space = space();
        let object = space.alloc_object(None, ObjectKind::Ordinary).unwrap();
        let old = space.object(object).unwrap().class_id();
        let put = space.put_l(object, &name("a"), Value::Int32(1)).unwrap();
        assert_eq!(put.result, PropertyResult::OkCanCache);
        let class = put.transition.unwrap();
        assert_ne!(class.id(), old);
        assert_eq!(class.id(), space.object(object).unwrap().class_id());

        let again = space.put_l(object, &name("a"), Value::Int32(2)).unwrap();
        assert!(again.transition.is_none());
        assert_eq!(again.offset, 0);
    }

    #[test]
    fn test_readonly_blocks_put_and_delete() {
        let mut space = space();
        let object = space.alloc_object(None, ObjectKind::Ordinary).unwrap();
        space
            .define_own_property_l(object, &name("k"), Value::Int32(1), PropertyAttributes::FROZEN)
            .unwrap();
        let put = space.put_l(object, &name("k"), Value::Int32(2)).unwrap();
        assert_eq!(put.result, PropertyResult::Failed);
        assert!(!space.delete_l(object, "k").unwrap());

        let child = space.alloc_object(Some(object), ObjectKind::Ordinary).unwrap();
        let put = space.put_l(child, &name("k"), Value::Int32(3)).unwrap();
        assert_eq!(put.result, PropertyResult::Failed);
    }

    #[test]
    fn test_array_elements_and_length() {
        let mut space = space();
        let array = space.alloc_object(None, ObjectKind::Array).unwrap();
        assert!(space.put_element(array, 2, Value::Int32(9)).unwrap());
        assert_eq!(space.get_l(array, "length").unwrap().value.as_int32(), Some(3));
        assert_eq!(space.get_l(array, "2").unwrap().value.as_int32(), Some(9));
        space.put_l(array, &name("length"), Value::Int32(1)).unwrap();
        assert_eq!(space.get_element(array, 2).unwrap(), None);
        assert!(space.put_l(array, &name("length"), Value::Double(1.5)).is_err());
    }

    #[test]
    fn test_dictionary_mode_after_threshold_and_delete() {
        let mut space = space();
        let object = space.alloc_object(None, ObjectKind::Ordinary).unwrap();
        space.put_l(object, &name("a"), Value::Int32(1)).unwrap();
        space.put_l(object, &name("b"), Value::Int32(2)).unwrap();
        assert!(space.delete_l(object, "a").unwrap());
        let object_ref = space.object(object).unwrap();
        assert!(object_ref.is_dictionary());
        assert_eq!(space.get_l(object, "b").unwrap().offset, 0);
        let put = space.put_l(object, &name("c"), Value::Int32(3)).unwrap();
        assert!(put.transition.is_none());
        assert_eq!(put.result, PropertyResult::Ok);
    }

    #[test]
    fn test_declaring_global_moves_existing_property() {
        let mut space = space();
        let global = space
            .alloc_object(None, ObjectKind::Global(Default::default()))
            .unwrap();
        space.put_l(global, &name("x"), Value::Int32(7)).unwrap();
        let class_before = space.object(global).unwrap().class_id();

        let slot = space.declare_global_variable(global, &name("x")).unwrap();
        assert_eq!(space.declare_global_variable(global, &name("x")).unwrap(), slot);
        let object = space.object(global).unwrap();
        assert!(object.find_own("x").is_none());
        assert_ne!(object.class_id(), class_before);
        assert_eq!(space.get_l(global, "x").unwrap().value, Value::Int32(7));
    }
}
