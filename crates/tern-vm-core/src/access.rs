//! Property, global and scope access
//!
//! Named gets and puts probe the site's cache chain first. A miss runs the
//! generic lookup in [`ObjectSpace`](crate::space::ObjectSpace), drops the
//! entries it proved stale and installs one describing the new outcome.
//! Keyed access uses dense elements when the key is an index and falls back
//! to a named lookup otherwise.

use std::sync::Arc;

use tern_vm_bytecode::{ConstantValue, NO_SCOPE, Opcode};
use tern_vm_gc::GcRef;

use crate::cache::{CachedType, GetProbe, GlobalCache, PropertyCache, PutProbe, storage};
use crate::class::PropertyAttributes;
use crate::error::{VmError, VmResult};
use crate::interpreter::{Inst, Interpreter, bad_operand, string_at};
use crate::object::{JsObject, ObjectKind, ScopeChain};
use crate::space::{PropertyResult, array_index};
use crate::value::{JsString, Value};

/// Receivers whose named lookups depend on more than their class.
///
/// Global objects also hold declared variables, and element-bearing objects
/// answer `length` and index names from their elements, so neither may
/// share cache entries with plain objects of the same class.
fn cacheable(object: &JsObject, name: &str) -> bool {
    match object.kind() {
        ObjectKind::Global(_) => false,
        _ if object.has_elements() => name != "length" && array_index(name).is_none(),
        _ => true,
    }
}

/// Non-negative integer key usable as an element index
fn element_index(key: &Value) -> Option<u32> {
    key.as_int32().and_then(|i| u32::try_from(i).ok())
}

fn string_length(s: &str) -> usize {
    s.encode_utf16().count()
}

fn string_char_at(s: &str, index: u32) -> Option<Value> {
    let unit = s.encode_utf16().nth(index as usize)?;
    Some(Value::string(String::from_utf16_lossy(&[unit])))
}

impl Interpreter<'_> {
    // ==================== Named access ====================

    /// `GetN dst object name cache`
    pub(crate) fn op_get_named(&mut self, inst: Inst) -> VmResult<()> {
        let [dst, base, name, site] = inst.a;
        let base = self.get(base)?;
        self.profile_operand(inst, 1, &base);
        let name = self.string_operand(name)?;
        let Value::Object(handle) = base else {
            let value = self.get_primitive_property(&base, &name)?;
            return self.set(dst, value);
        };

        let code = self.code_handle()?;
        let object = self.rt.space.object(handle)?;
        let use_cache = cacheable(object, &name);
        if use_cache {
            let receiver = self.rt.space.receiver(handle)?;
            let epoch = self.rt.space.epoch();
            let probe = self.rt.space.code(code)?.get_caches.probe_get(site, &receiver, epoch);
            let hit = match probe {
                GetProbe::Own(offset) => Some(self.slot_value(handle, offset)?),
                GetProbe::Prototype { holder, offset } => Some(self.slot_value(holder, offset)?),
                GetProbe::Absent => Some(Value::Undefined),
                GetProbe::Miss => None,
            };
            if let Some(value) = hit {
                self.ctx.stats.get_hits += 1;
                self.profile_get_cache(inst, true);
                return self.set(dst, value);
            }
        }

        self.ctx.stats.get_misses += 1;
        self.profile_get_cache(inst, false);
        self.slow_case(inst)?;
        let receiver = self.rt.space.receiver(handle)?;
        let class = self.rt.space.object(handle)?.class().clone();
        let found = self.rt.space.get_l(handle, &name)?;
        if use_cache && found.result.can_cache() {
            let epoch = self.rt.space.epoch();
            let entry = match (found.result.is_found(), found.holder) {
                (true, None) => PropertyCache::own(receiver.class_id, found.offset),
                (true, Some(holder)) => {
                    PropertyCache::prototype(receiver.class_id, holder, found.offset, found.limit, epoch)
                }
                (false, _) => PropertyCache::negative(receiver.class_id, found.limit, epoch),
            };
            let entry = entry
                .with_type(CachedType::new(found.value.type_bits(), storage::VALUE, 0))
                .with_class(Some(class));
            let caches = &mut self.rt.space.code_mut(code)?.get_caches;
            caches.remove_stale(site, &receiver, epoch);
            caches.install(site, entry);
        }
        self.set(dst, found.value)
    }

    /// `PutN object name src cache`
    pub(crate) fn op_put_named(&mut self, inst: Inst) -> VmResult<()> {
        let [base, name, src, site] = inst.a;
        let base = self.get(base)?;
        let value = self.get(src)?;
        self.profile_operand(inst, 2, &value);
        let name = self.string_operand(name)?;
        let Value::Object(handle) = base else {
            return self.put_primitive_property(&base, &name);
        };

        let code = self.code_handle()?;
        let use_cache = cacheable(self.rt.space.object(handle)?, &name);
        let receiver = self.rt.space.receiver(handle)?;
        let epoch = self.rt.space.epoch();
        if use_cache {
            let probe = self.rt.space.code(code)?.put_caches.probe_put(site, &receiver, epoch);
            match probe {
                PutProbe::Own(offset) => {
                    self.rt.space.object_mut(handle)?.set_slot(offset, value);
                    self.ctx.stats.put_hits += 1;
                    return Ok(());
                }
                PutProbe::Transition { offset, class } => {
                    let object = self.rt.space.object_mut(handle)?;
                    debug_assert_eq!(object.slots.len() as u32, offset);
                    object.class = class;
                    object.slots.push(value);
                    if object.is_prototype {
                        self.rt.space.classes.bump_epoch();
                    }
                    self.ctx.stats.put_hits += 1;
                    return Ok(());
                }
                PutProbe::Miss => {}
            }
        }

        self.ctx.stats.put_misses += 1;
        self.slow_case(inst)?;
        let class = self.rt.space.object(handle)?.class().clone();
        let stored = self.rt.space.put_l(handle, &name, value.clone())?;
        if stored.result == PropertyResult::Failed {
            return self.reject_put(&name);
        }
        if use_cache && stored.result.can_cache() {
            let cached_type = CachedType::new(value.type_bits(), storage::VALUE, 0);
            let entry = match stored.transition {
                Some(next) => PropertyCache::transition(receiver.class_id, next, stored.offset, epoch),
                None => PropertyCache::own(receiver.class_id, stored.offset),
            };
            let entry = entry.with_type(cached_type).with_class(Some(class));
            let caches = &mut self.rt.space.code_mut(code)?.put_caches;
            caches.remove_stale(site, &receiver, epoch);
            caches.install(site, entry);
        }
        Ok(())
    }

    /// `InitProperty object name src`: define an own property of a literal
    pub(crate) fn op_init_property(&mut self, inst: Inst) -> VmResult<()> {
        let [base, name, src, _] = inst.a;
        let handle = self.get(base)?.as_object().ok_or_else(|| bad_operand(inst))?;
        let name = self.string_operand(name)?;
        let value = self.get(src)?;
        self.rt
            .space
            .define_own_property_l(handle, &name, value, PropertyAttributes::DEFAULT)?;
        Ok(())
    }

    /// `DeleteN dst object name`
    pub(crate) fn op_delete_named(&mut self, inst: Inst) -> VmResult<()> {
        let [dst, base, name, _] = inst.a;
        let base = self.get(base)?;
        let name = self.string_operand(name)?;
        let deleted = self.delete_property(&base, &name)?;
        self.set(dst, Value::Boolean(deleted))
    }

    fn slot_value(&self, handle: GcRef, offset: u32) -> VmResult<Value> {
        self.rt
            .space
            .object(handle)?
            .slot(offset)
            .cloned()
            .ok_or_else(|| VmError::internal("cached slot out of range"))
    }

    fn reject_put(&self, name: &str) -> VmResult<()> {
        if self.code()?.flags.is_strict {
            return Err(VmError::type_error(format!(
                "Cannot assign to read only property '{name}'"
            )));
        }
        Ok(())
    }

    // ==================== Generic access ====================

    /// Property read on any base value
    pub fn get_property(&mut self, base: &Value, name: &str) -> VmResult<Value> {
        match base {
            Value::Object(handle) => self.get_named(*handle, name),
            other => self.get_primitive_property(other, name),
        }
    }

    fn get_primitive_property(&mut self, base: &Value, name: &str) -> VmResult<Value> {
        match base {
            Value::Undefined | Value::Null => {
                return Err(VmError::type_error(format!(
                    "Cannot read properties of {} (reading '{name}')",
                    self.describe(base)
                )));
            }
            Value::String(s) => {
                if name == "length" {
                    return Ok(Value::number(string_length(s) as f64));
                }
                if let Some(c) = array_index(name).and_then(|index| string_char_at(s, index)) {
                    return Ok(c);
                }
            }
            _ => {}
        }
        let prototype = self.rt.intrinsics.object_prototype;
        self.get_named(prototype, name)
    }

    fn put_primitive_property(&mut self, base: &Value, name: &str) -> VmResult<()> {
        if base.is_null_or_undefined() {
            return Err(VmError::type_error(format!(
                "Cannot set properties of {} (setting '{name}')",
                self.describe(base)
            )));
        }
        if self.code()?.flags.is_strict {
            return Err(VmError::type_error(format!(
                "Cannot create property '{name}' on {}",
                self.type_of(base)
            )));
        }
        Ok(())
    }

    fn put_property(&mut self, base: &Value, name: &JsString, value: Value) -> VmResult<()> {
        let Value::Object(handle) = base else {
            return self.put_primitive_property(base, name);
        };
        let stored = self.rt.space.put_l(*handle, name, value)?;
        if stored.result == PropertyResult::Failed {
            return self.reject_put(name);
        }
        Ok(())
    }

    fn delete_property(&mut self, base: &Value, name: &str) -> VmResult<bool> {
        match base {
            Value::Object(handle) => {
                let deleted = self.rt.space.delete_l(*handle, name)?;
                if !deleted && self.code()?.flags.is_strict {
                    return Err(VmError::type_error(format!("Cannot delete property '{name}'")));
                }
                Ok(deleted)
            }
            Value::Undefined | Value::Null => Err(VmError::type_error(format!(
                "Cannot convert {} to object",
                self.describe(base)
            ))),
            _ => Ok(true),
        }
    }

    // ==================== Keyed access ====================

    /// `Get dst object key`
    pub(crate) fn op_get_keyed(&mut self, inst: Inst) -> VmResult<()> {
        let [dst, base, key, _] = inst.a;
        let (base, key) = (self.get(base)?, self.get(key)?);
        self.profile_operand(inst, 1, &base);
        self.profile_operand(inst, 2, &key);
        if let Some(index) = element_index(&key) {
            match &base {
                Value::Object(handle) => {
                    if let Some(value) = self.rt.space.get_element(*handle, index)? {
                        return self.set(dst, value);
                    }
                }
                Value::String(s) => {
                    if let Some(c) = string_char_at(s, index) {
                        return self.set(dst, c);
                    }
                }
                _ => {}
            }
        }
        self.slow_case(inst)?;
        let name = self.to_string(&key)?;
        let value = self.get_property(&base, &name)?;
        self.set(dst, value)
    }

    /// `Put object key src`
    pub(crate) fn op_put_keyed(&mut self, inst: Inst) -> VmResult<()> {
        let [base, key, src, _] = inst.a;
        let (base, key, value) = (self.get(base)?, self.get(key)?, self.get(src)?);
        if let (Value::Object(handle), Some(index)) = (&base, element_index(&key))
            && self.rt.space.put_element(*handle, index, value.clone())?
        {
            return Ok(());
        }
        self.slow_case(inst)?;
        let name = self.to_string(&key)?;
        self.put_property(&base, &name, value)
    }

    /// `Delete dst object key`
    pub(crate) fn op_delete_keyed(&mut self, inst: Inst) -> VmResult<()> {
        let [dst, base, key, _] = inst.a;
        let (base, key) = (self.get(base)?, self.get(key)?);
        let name = self.to_string(&key)?;
        let deleted = self.delete_property(&base, &name)?;
        self.set(dst, Value::Boolean(deleted))
    }

    /// `In dst key object`
    pub(crate) fn op_in(&mut self, inst: Inst) -> VmResult<()> {
        let [dst, key, base, _] = inst.a;
        let (key, base) = (self.get(key)?, self.get(base)?);
        let Value::Object(handle) = base else {
            return Err(VmError::type_error(format!(
                "Cannot use 'in' operator to search for '{}' in {}",
                self.describe(&key),
                self.describe(&base)
            )));
        };
        if let Some(index) = element_index(&key)
            && self.rt.space.get_element(handle, index)?.is_some()
        {
            return self.set(dst, Value::Boolean(true));
        }
        let name = self.to_string(&key)?;
        let found = self.rt.space.has_property(handle, &name)?;
        self.set(dst, Value::Boolean(found))
    }

    // ==================== Globals ====================

    fn global_access_name(&self, inst: Inst, access: u32) -> VmResult<JsString> {
        let code = self.code()?;
        let access = code
            .global_accesses
            .get(access as usize)
            .ok_or_else(|| bad_operand(inst))?;
        string_at(code, access.name)
    }

    /// Value of a global through its cache entry, if the entry still holds
    fn probe_global(&self, global: GcRef, cache: &GlobalCache) -> VmResult<Option<Value>> {
        let object = self.rt.space.object(global)?;
        Ok(match (cache, object.kind()) {
            (GlobalCache::Variable { slot }, ObjectKind::Global(variables)) => variables.get(*slot).cloned(),
            (GlobalCache::Property { class_id, offset }, _) if object.class_id() == *class_id => {
                object.slot(*offset).cloned()
            }
            _ => None,
        })
    }

    /// Cache entry describing where a global name lives now
    fn resolve_global(&self, global: GcRef, name: &str) -> VmResult<GlobalCache> {
        let object = self.rt.space.object(global)?;
        if let ObjectKind::Global(variables) = object.kind()
            && let Some(slot) = variables.find(name)
        {
            return Ok(GlobalCache::Variable { slot });
        }
        Ok(match object.find_own(name) {
            Some(offset) => GlobalCache::Property {
                class_id: object.class_id(),
                offset,
            },
            None => GlobalCache::Empty,
        })
    }

    fn set_global_cache(&mut self, site: u32, cache: GlobalCache) -> VmResult<()> {
        let code = self.code_handle()?;
        if let Some(slot) = self.rt.space.code_mut(code)?.global_caches.get_mut(site as usize) {
            *slot = cache;
        }
        Ok(())
    }

    /// `GetGlobal dst access` and `GetGlobalQuiet dst access`
    pub(crate) fn op_get_global(&mut self, inst: Inst) -> VmResult<()> {
        let [dst, access, _, _] = inst.a;
        let code = self.code_handle()?;
        let global = self.current_global()?;
        let cache = self
            .rt
            .space
            .code(code)?
            .global_caches
            .get(access as usize)
            .cloned()
            .ok_or_else(|| bad_operand(inst))?;
        if let Some(value) = self.probe_global(global, &cache)? {
            self.ctx.stats.global_hits += 1;
            return self.set(dst, value);
        }

        self.ctx.stats.global_misses += 1;
        self.slow_case(inst)?;
        let name = self.global_access_name(inst, access)?;
        let resolved = self.resolve_global(global, &name)?;
        let found = self.rt.space.get_l(global, &name)?;
        if resolved != GlobalCache::Empty {
            self.set_global_cache(access, resolved)?;
        }
        if !found.result.is_found() && inst.op == Opcode::GetGlobal {
            return Err(VmError::reference_error(format!("{name} is not defined")));
        }
        self.set(dst, found.value)
    }

    /// `PutGlobal access src`
    pub(crate) fn op_put_global(&mut self, inst: Inst) -> VmResult<()> {
        let [access, src, _, _] = inst.a;
        let value = self.get(src)?;
        let code = self.code_handle()?;
        let global = self.current_global()?;
        let cache = self
            .rt
            .space
            .code(code)?
            .global_caches
            .get(access as usize)
            .cloned()
            .ok_or_else(|| bad_operand(inst))?;
        let object = self.rt.space.object_mut(global)?;
        let hit = match cache {
            GlobalCache::Variable { slot } => match object.kind_mut() {
                ObjectKind::Global(variables) => {
                    variables.set(slot, value.clone());
                    true
                }
                _ => false,
            },
            GlobalCache::Property { class_id, offset } if object.class_id() == class_id => {
                object.set_slot(offset, value.clone());
                true
            }
            _ => false,
        };
        if hit {
            self.ctx.stats.global_hits += 1;
            return Ok(());
        }

        self.ctx.stats.global_misses += 1;
        self.slow_case(inst)?;
        let name = self.global_access_name(inst, access)?;
        self.put_global_slow(global, &name, value)?;
        let resolved = self.resolve_global(global, &name)?;
        let writable = match resolved {
            GlobalCache::Property { offset, .. } => self.rt.space.object(global)?.attributes(offset).writable(),
            _ => true,
        };
        if writable && resolved != GlobalCache::Empty {
            self.set_global_cache(access, resolved)?;
        }
        Ok(())
    }

    /// Assign a global by name; sloppy code creates missing globals
    fn put_global_slow(&mut self, global: GcRef, name: &JsString, value: Value) -> VmResult<()> {
        if !self.rt.space.has_property(global, name)? && self.code()?.flags.is_strict {
            return Err(VmError::reference_error(format!("{name} is not defined")));
        }
        self.put_property(&Value::Object(global), name, value)
    }

    // ==================== Scope access ====================

    /// Scope objects searched before the global object, innermost first
    fn scope_objects(&self, inst: Inst, inner_scope: u32) -> VmResult<Vec<GcRef>> {
        let mut objects = Vec::new();
        if inner_scope != NO_SCOPE {
            let registers = self
                .code()?
                .inner_scopes
                .get(inner_scope as usize)
                .ok_or_else(|| bad_operand(inst))?
                .registers
                .clone();
            for register in registers {
                if let Value::Object(object) = self.get(register)? {
                    objects.push(object);
                }
            }
        }
        objects.extend(self.closure_scope()?);
        Ok(objects)
    }

    fn find_in_scope(&self, inst: Inst, inner_scope: u32, name: &str) -> VmResult<Option<GcRef>> {
        for object in self.scope_objects(inst, inner_scope)? {
            if self.rt.space.has_property(object, name)? {
                return Ok(Some(object));
            }
        }
        Ok(None)
    }

    /// `GetScope dst name inner_scope`
    pub(crate) fn op_get_scope(&mut self, inst: Inst) -> VmResult<()> {
        let [dst, name, inner_scope, _] = inst.a;
        let name = self.string_operand(name)?;
        let holder = match self.find_in_scope(inst, inner_scope, &name)? {
            Some(object) => object,
            None => self.current_global()?,
        };
        let found = self.rt.space.get_l(holder, &name)?;
        if !found.result.is_found() {
            return Err(VmError::reference_error(format!("{name} is not defined")));
        }
        self.set(dst, found.value)
    }

    /// `PutScope name src inner_scope`
    pub(crate) fn op_put_scope(&mut self, inst: Inst) -> VmResult<()> {
        let [name, src, inner_scope, _] = inst.a;
        let name = self.string_operand(name)?;
        let value = self.get(src)?;
        match self.find_in_scope(inst, inner_scope, &name)? {
            Some(object) => self.put_property(&Value::Object(object), &name, value),
            None => {
                let global = self.current_global()?;
                self.put_global_slow(global, &name, value)
            }
        }
    }

    // ==================== Allocation ====================

    /// `NewObject`, the literal forms, `NewFunction`, `NewRegExp` and `Arguments`
    pub(crate) fn op_allocate(&mut self, inst: Inst) -> VmResult<()> {
        let [dst, b, _, _] = inst.a;
        let value = match inst.op {
            Opcode::NewObject => Value::Object(self.new_object()?),
            Opcode::NewObjectLiteral => Value::Object(self.new_object_literal(inst)?),
            Opcode::NewArray => {
                let array = self.new_array(vec![Value::Undefined; b as usize])?;
                Value::Object(array)
            }
            Opcode::NewArrayLiteral => {
                let code = self.code()?;
                let template = code
                    .constant_array_literals
                    .get(b as usize)
                    .ok_or_else(|| bad_operand(inst))?;
                let elements = template
                    .elements
                    .iter()
                    .map(|constant| {
                        Ok(match *constant {
                            ConstantValue::Undefined => Value::Undefined,
                            ConstantValue::Null => Value::Null,
                            ConstantValue::Boolean(flag) => Value::Boolean(flag),
                            ConstantValue::Int32(i) => Value::Int32(i),
                            ConstantValue::Double(d) => Value::number(d),
                            ConstantValue::String(index) => Value::String(string_at(code, index)?),
                        })
                    })
                    .collect::<VmResult<Vec<_>>>()?;
                Value::Object(self.new_array(elements)?)
            }
            Opcode::NewFunction => {
                let mut scope = ScopeChain::new();
                for register in self.trailing_registers(inst)? {
                    let object = self.get(register)?.as_object().ok_or_else(|| bad_operand(inst))?;
                    scope.push(object);
                }
                scope.extend(self.closure_scope()?);
                let parent = self.code_handle()?;
                Value::Object(self.instantiate_function(parent, b, scope)?)
            }
            Opcode::NewRegExp => Value::Object(self.new_regexp(inst)?),
            Opcode::Arguments => Value::Object(self.arguments_object()?),
            _ => return Err(bad_operand(inst)),
        };
        self.set(dst, value)
    }

    /// Object literal built straight into the site's cached class
    fn new_object_literal(&mut self, inst: Inst) -> VmResult<GcRef> {
        let [_, class_index, count, _] = inst.a;
        let code = Arc::clone(self.code()?);
        let names = &code
            .object_literal_classes
            .get(class_index as usize)
            .ok_or_else(|| bad_operand(inst))?
            .properties;
        if names.len() != count as usize {
            return Err(bad_operand(inst));
        }
        let values = self
            .trailing_registers(inst)?
            .into_iter()
            .map(|register| self.get(register))
            .collect::<VmResult<Vec<_>>>()?;

        let handle = self.code_handle()?;
        let cached = self
            .rt
            .space
            .code(handle)?
            .literal_classes
            .get(class_index as usize)
            .cloned()
            .flatten();
        if let Some(class) = cached {
            return self.rt.space.alloc_with_class(class, values);
        }

        let prototype = self.rt.intrinsics.object_prototype;
        let mut class = self.rt.space.root_class(Some(prototype))?;
        let mut unique = names.len() <= self.rt.config.dictionary_threshold;
        for &name in names {
            let name = string_at(&code, name)?;
            if class.find(&name).is_some() {
                unique = false;
                break;
            }
            class = class.add_property(&name, PropertyAttributes::DEFAULT);
        }
        if unique {
            if let Some(slot) = self.rt.space.code_mut(handle)?.literal_classes.get_mut(class_index as usize) {
                *slot = Some(class.clone());
            }
            return self.rt.space.alloc_with_class(class, values);
        }

        // Repeated names or a large literal: define one by one, last value wins.
        let object = self.new_object()?;
        for (&name, value) in names.iter().zip(values) {
            let name = string_at(&code, name)?;
            self.rt
                .space
                .define_own_property_l(object, &name, value, PropertyAttributes::DEFAULT)?;
        }
        Ok(object)
    }

    fn new_regexp(&mut self, inst: Inst) -> VmResult<GcRef> {
        let [_, index, _, _] = inst.a;
        let code = self.code()?;
        let template = *code.regexps.get(index as usize).ok_or_else(|| bad_operand(inst))?;
        let source = string_at(code, template.source)?;
        let flags = string_at(code, template.flags)?;
        let prototype = self.rt.intrinsics.regexp_prototype;
        let handle = self.rt.space.alloc_object(
            Some(prototype),
            ObjectKind::RegExp {
                source: source.clone(),
                flags: flags.clone(),
            },
        )?;
        let properties = [
            ("lastIndex", Value::Int32(0), PropertyAttributes::from_bits(PropertyAttributes::WRITABLE)),
            ("source", Value::String(source), PropertyAttributes::FROZEN),
            ("flags", Value::String(flags), PropertyAttributes::FROZEN),
        ];
        for (name, value, attributes) in properties {
            self.rt
                .space
                .define_own_property_l(handle, &JsString::from(name), value, attributes)?;
        }
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_index_rejects_negative_and_fractional_keys() {
        assert_eq!(element_index(&Value::Int32(3)), Some(3));
        assert_eq!(element_index(&Value::Int32(-1)), None);
        assert_eq!(element_index(&Value::Double(2.5)), None);
        assert_eq!(element_index(&Value::from("1")), None);
    }

    #[test]
    fn test_string_indexing_counts_utf16_units() {
        assert_eq!(string_length("a\u{1F600}"), 3);
        assert_eq!(string_char_at("abc", 1), Some(Value::from("b")));
        assert_eq!(string_char_at("abc", 3), None);
    }
}
