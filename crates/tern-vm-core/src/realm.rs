//! Intrinsic objects
//!
//! The prototypes the dispatch loop allocates against, the global object,
//! and the few built-in functions it recognizes by identity (`apply`,
//! `call`, `bind`, `eval`). Everything else a host wants on the global
//! object is added through [`crate::Runtime::define_host_function`].

use std::sync::Arc;

use tern_vm_gc::{GcRef, RootProvider, Trace, Tracer};

use crate::class::PropertyAttributes;
use crate::error::{ErrorKind, VmError, VmResult};
use crate::frame::FrameType;
use crate::interpreter::Interpreter;
use crate::object::{Builtin, Callable, GlobalVariables, HostFunctionId, ObjectKind};
use crate::runtime::{HostFn, HostFunction};
use crate::space::ObjectSpace;
use crate::value::{JsString, Value};

/// Per-runtime intrinsic objects
#[derive(Debug, Clone)]
pub struct Intrinsics {
    /// `Object.prototype`
    pub object_prototype: GcRef,
    /// `Function.prototype`
    pub function_prototype: GcRef,
    /// `Array.prototype`
    pub array_prototype: GcRef,
    /// `RegExp.prototype`
    pub regexp_prototype: GcRef,
    /// Error prototypes in [`ErrorKind::ALL`] order
    pub error_prototypes: [GcRef; 7],
    /// The global object
    pub global: GcRef,
    /// `Function.prototype.apply`
    pub apply: GcRef,
    /// The global `eval`
    pub eval: GcRef,
}

struct Setup<'a> {
    space: &'a mut ObjectSpace,
    hosts: &'a mut Vec<HostFunction>,
    function_prototype: GcRef,
}

impl Setup<'_> {
    fn function(
        &mut self,
        name: &str,
        builtin: Option<Builtin>,
        func: impl Fn(&mut Interpreter<'_>, &Value, &[Value]) -> VmResult<Value> + Send + Sync + 'static,
    ) -> VmResult<GcRef> {
        let id = register_host(self.hosts, name, Arc::new(func));
        self.space.alloc_object(
            Some(self.function_prototype),
            ObjectKind::Function(Callable::Host { id, builtin }),
        )
    }

    fn method(
        &mut self,
        holder: GcRef,
        name: &str,
        builtin: Option<Builtin>,
        func: impl Fn(&mut Interpreter<'_>, &Value, &[Value]) -> VmResult<Value> + Send + Sync + 'static,
    ) -> VmResult<GcRef> {
        let function = self.function(name, builtin, func)?;
        self.hidden(holder, name, Value::Object(function))?;
        Ok(function)
    }

    fn hidden(&mut self, holder: GcRef, name: &str, value: Value) -> VmResult<()> {
        self.space
            .define_own_property_l(holder, &JsString::from(name), value, PropertyAttributes::HIDDEN)?;
        Ok(())
    }
}

/// Add a host function to the table
pub(crate) fn register_host(hosts: &mut Vec<HostFunction>, name: &str, func: Arc<HostFn>) -> HostFunctionId {
    hosts.push(HostFunction {
        name: JsString::from(name),
        func,
    });
    HostFunctionId((hosts.len() - 1) as u32)
}

impl Intrinsics {
    /// Allocate the intrinsics and populate the global object
    pub(crate) fn create(space: &mut ObjectSpace, hosts: &mut Vec<HostFunction>) -> VmResult<Self> {
        let object_prototype = space.alloc_object(None, ObjectKind::Ordinary)?;
        let function_prototype = space.alloc_object(
            Some(object_prototype),
            ObjectKind::Function(Callable::Host {
                id: register_host(hosts, "", Arc::new(empty_function)),
                builtin: None,
            }),
        )?;
        let array_prototype = space.alloc_object(Some(object_prototype), ObjectKind::Array)?;
        let regexp_prototype = space.alloc_object(Some(object_prototype), ObjectKind::Ordinary)?;
        let global = space.alloc_object(
            Some(object_prototype),
            ObjectKind::Global(GlobalVariables::default()),
        )?;

        let mut setup = Setup {
            space,
            hosts,
            function_prototype,
        };

        setup.method(object_prototype, "toString", None, object_to_string)?;
        setup.method(object_prototype, "valueOf", None, |_, this, _| Ok(this.clone()))?;
        setup.method(object_prototype, "hasOwnProperty", None, object_has_own_property)?;

        let apply = setup.method(function_prototype, "apply", Some(Builtin::Apply), function_apply)?;
        setup.method(function_prototype, "call", Some(Builtin::Call), function_call)?;
        setup.method(function_prototype, "bind", Some(Builtin::Bind), function_bind)?;

        setup.method(array_prototype, "push", None, array_push)?;

        let mut error_prototypes = [object_prototype; 7];
        for kind in ErrorKind::ALL {
            let parent = match kind {
                ErrorKind::Error => object_prototype,
                _ => error_prototypes[ErrorKind::Error.index()],
            };
            let prototype = setup.space.alloc_object(Some(parent), ObjectKind::Ordinary)?;
            error_prototypes[kind.index()] = prototype;
            setup.hidden(prototype, "name", Value::string(kind.name()))?;
            if kind == ErrorKind::Error {
                setup.hidden(prototype, "message", Value::string(""))?;
                setup.method(prototype, "toString", None, error_to_string)?;
            }
            let constructor = setup.function(kind.name(), None, move |interp, _, args| {
                let message = match args.first() {
                    Some(value) if !value.is_undefined() => Some(interp.to_string(value)?),
                    _ => None,
                };
                interp.new_error(kind, message.as_deref()).map(Value::Object)
            })?;
            setup.hidden(constructor, "prototype", Value::Object(prototype))?;
            setup.hidden(prototype, "constructor", Value::Object(constructor))?;
            setup.hidden(global, kind.name(), Value::Object(constructor))?;
        }

        let eval = setup.method(global, "eval", Some(Builtin::Eval), global_eval)?;
        setup.hidden(global, "globalThis", Value::Object(global))?;
        setup.hidden(global, "NaN", Value::Double(f64::NAN))?;
        setup.hidden(global, "Infinity", Value::Double(f64::INFINITY))?;
        setup.hidden(global, "undefined", Value::Undefined)?;

        Ok(Self {
            object_prototype,
            function_prototype,
            array_prototype,
            regexp_prototype,
            error_prototypes,
            global,
            apply,
            eval,
        })
    }

    /// Prototype for errors of a kind
    #[inline]
    pub fn error_prototype(&self, kind: ErrorKind) -> GcRef {
        self.error_prototypes[kind.index()]
    }
}

impl Trace for Intrinsics {
    fn trace(&self, tracer: &mut Tracer<'_>) {
        for handle in [
            self.object_prototype,
            self.function_prototype,
            self.array_prototype,
            self.regexp_prototype,
            self.global,
            self.apply,
            self.eval,
        ] {
            tracer.mark(handle);
        }
        for &prototype in &self.error_prototypes {
            tracer.mark(prototype);
        }
    }
}

impl RootProvider for Intrinsics {
    fn trace_roots(&self, tracer: &mut Tracer<'_>) {
        self.trace(tracer);
    }
}

// ==================== Built-in functions ====================

fn empty_function(_interp: &mut Interpreter<'_>, _this: &Value, _args: &[Value]) -> VmResult<Value> {
    Ok(Value::Undefined)
}

fn object_to_string(interp: &mut Interpreter<'_>, this: &Value, _args: &[Value]) -> VmResult<Value> {
    let tag = match this {
        Value::Undefined => "Undefined",
        Value::Null => "Null",
        Value::Object(handle) => match interp.space().object(*handle)?.kind() {
            ObjectKind::Array => "Array",
            ObjectKind::Arguments => "Arguments",
            ObjectKind::Error(_) => "Error",
            ObjectKind::Function(_) => "Function",
            ObjectKind::RegExp { .. } => "RegExp",
            ObjectKind::Ordinary | ObjectKind::Global(_) => "Object",
        },
        Value::Boolean(_) => "Boolean",
        Value::Int32(_) | Value::Double(_) => "Number",
        Value::String(_) => "String",
        Value::Boxed(_) => "Object",
    };
    Ok(Value::string(format!("[object {tag}]")))
}

fn object_has_own_property(interp: &mut Interpreter<'_>, this: &Value, args: &[Value]) -> VmResult<Value> {
    let key = interp.to_string(args.first().unwrap_or(&Value::Undefined))?;
    let Some(handle) = this.as_object() else {
        return Ok(Value::Boolean(false));
    };
    let object = interp.space().object(handle)?;
    let own = object.find_own(&key).is_some()
        || crate::space::array_index(&key)
            .is_some_and(|index| object.has_elements() && (index as usize) < object.elements().len())
        || matches!(object.kind(), ObjectKind::Global(vars) if vars.find(&key).is_some());
    Ok(Value::Boolean(own))
}

fn error_to_string(interp: &mut Interpreter<'_>, this: &Value, _args: &[Value]) -> VmResult<Value> {
    let Some(handle) = this.as_object() else {
        return Err(VmError::type_error("Error.prototype.toString called on non-object"));
    };
    let name = interp.get_named(handle, "name")?;
    let name = if name.is_undefined() {
        JsString::from("Error")
    } else {
        interp.to_string(&name)?
    };
    let message = interp.get_named(handle, "message")?;
    let message = if message.is_undefined() {
        JsString::from("")
    } else {
        interp.to_string(&message)?
    };
    Ok(Value::string(match (name.is_empty(), message.is_empty()) {
        (_, true) => name.to_string(),
        (true, false) => message.to_string(),
        (false, false) => format!("{name}: {message}"),
    }))
}

/// Elements of an array-like argument list
pub(crate) fn list_from_array_like(interp: &mut Interpreter<'_>, value: &Value) -> VmResult<Vec<Value>> {
    match value {
        Value::Undefined | Value::Null => Ok(Vec::new()),
        Value::Object(handle) => {
            let object = interp.space().object(*handle)?;
            if object.has_elements() {
                return Ok(object.elements().to_vec());
            }
            let length = interp.get_named(*handle, "length")?;
            let length = interp.to_number(&length)?;
            let length = if length.is_finite() && length > 0.0 { length as u32 } else { 0 };
            let mut values = Vec::with_capacity(length.min(1 << 16) as usize);
            for index in 0..length {
                values.push(interp.get_named(*handle, &index.to_string())?);
            }
            Ok(values)
        }
        _ => Err(VmError::type_error("CreateListFromArrayLike called on non-object")),
    }
}

fn function_apply(interp: &mut Interpreter<'_>, this: &Value, args: &[Value]) -> VmResult<Value> {
    let receiver = args.first().cloned().unwrap_or_default();
    let list = list_from_array_like(interp, args.get(1).unwrap_or(&Value::Undefined))?;
    interp.call_function_as(this, receiver, &list, FrameType::ViaApply)
}

fn function_call(interp: &mut Interpreter<'_>, this: &Value, args: &[Value]) -> VmResult<Value> {
    let receiver = args.first().cloned().unwrap_or_default();
    let rest = args.get(1..).unwrap_or(&[]);
    interp.call_function_as(this, receiver, rest, FrameType::ViaCall)
}

fn function_bind(interp: &mut Interpreter<'_>, this: &Value, args: &[Value]) -> VmResult<Value> {
    let Some((target, _)) = interp.space().callable(this) else {
        return Err(VmError::type_error("Bind must be called on a function"));
    };
    let bound = Callable::Bound {
        target,
        this: args.first().cloned().unwrap_or_default(),
        args: args.get(1..).unwrap_or(&[]).to_vec(),
    };
    let prototype = interp.intrinsics().function_prototype;
    let handle = interp
        .space_mut()
        .alloc_object(Some(prototype), ObjectKind::Function(bound))?;
    Ok(Value::Object(handle))
}

fn array_push(interp: &mut Interpreter<'_>, this: &Value, args: &[Value]) -> VmResult<Value> {
    let Some(handle) = this.as_object() else {
        return Err(VmError::type_error("Array.prototype.push called on non-object"));
    };
    let object = interp.space_mut().object_mut(handle)?;
    if !matches!(object.kind(), ObjectKind::Array) {
        return Err(VmError::type_error("Array.prototype.push called on non-array"));
    }
    object
        .elements
        .try_reserve(args.len())
        .map_err(|_| VmError::OutOfMemory)?;
    object.elements.extend_from_slice(args);
    Ok(Value::number(object.elements.len() as f64))
}

fn global_eval(interp: &mut Interpreter<'_>, _this: &Value, args: &[Value]) -> VmResult<Value> {
    match args.first() {
        Some(Value::String(source)) => interp.indirect_eval(source),
        Some(other) => Ok(other.clone()),
        None => Ok(Value::Undefined),
    }
}
