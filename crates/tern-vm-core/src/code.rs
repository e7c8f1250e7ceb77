//! Code instances
//!
//! A [`CodeInstance`] is the heap-resident, per-realm view of an
//! `Arc<StaticCode>`: it owns the inline caches, the lazily created code
//! instances of nested functions, and the counters that decide when to ask
//! for native code. Many code instances may share one static code.

use std::sync::Arc;

use tern_vm_bytecode::StaticCode;
use tern_vm_gc::{GcRef, Trace, Tracer};

use crate::cache::{CacheSlab, GlobalCache};
use crate::class::ClassRef;
use crate::native::NativeEntry;
use crate::object::ScopeChain;
use crate::value::{JsString, Value};

/// Last number converted by a `ToString` site
#[derive(Debug, Clone)]
pub struct FormatStringCache {
    /// Input number
    pub from: Value,
    /// Its string form
    pub to: JsString,
}

/// Last source compiled by an `Eval` site
#[derive(Debug, Clone)]
pub struct EvalCache {
    /// Source text
    pub source: JsString,
    /// Compiled eval code
    pub code: Arc<StaticCode>,
}

/// Per-realm instance of compiled code
#[derive(Debug)]
pub struct CodeInstance {
    pub(crate) static_code: Arc<StaticCode>,
    pub(crate) global: GcRef,
    pub(crate) scope_chain: ScopeChain,
    pub(crate) get_caches: CacheSlab,
    pub(crate) put_caches: CacheSlab,
    pub(crate) global_caches: Vec<GlobalCache>,
    pub(crate) format_caches: Vec<Option<FormatStringCache>>,
    pub(crate) eval_caches: Vec<Option<EvalCache>>,
    pub(crate) literal_classes: Vec<Option<ClassRef>>,
    pub(crate) functions: Vec<Option<GcRef>>,
    pub(crate) native: Option<NativeEntry>,
    pub(crate) call_count: u32,
    pub(crate) slow_case_calls: u32,
    /// 0: none seen, 1: seen since the last native compile, 2: recompiled for it
    pub(crate) has_integer_overflows: u8,
}

impl CodeInstance {
    /// Instantiate static code against a global object and scope chain
    pub fn new(
        static_code: Arc<StaticCode>,
        global: GcRef,
        scope_chain: ScopeChain,
        chain_limit: usize,
    ) -> Self {
        static_code.increment_ref();
        let code = &static_code;
        Self {
            get_caches: CacheSlab::new(code.property_get_caches_count as usize, chain_limit),
            put_caches: CacheSlab::new(code.property_put_caches_count as usize, chain_limit),
            global_caches: vec![GlobalCache::Empty; code.global_caches_count()],
            format_caches: vec![None; code.format_string_caches_count as usize],
            eval_caches: vec![None; code.eval_caches_count as usize],
            literal_classes: vec![None; code.object_literal_classes.len()],
            functions: vec![None; code.functions.len()],
            native: None,
            call_count: 0,
            slow_case_calls: 0,
            has_integer_overflows: 0,
            global,
            scope_chain,
            static_code,
        }
    }

    /// Shared static code
    pub fn static_code(&self) -> &Arc<StaticCode> {
        &self.static_code
    }

    /// Global object
    pub fn global(&self) -> GcRef {
        self.global
    }

    /// Times this code was entered
    pub fn call_count(&self) -> u32 {
        self.call_count
    }

    /// Slow paths taken so far
    pub fn slow_case_calls(&self) -> u32 {
        self.slow_case_calls
    }

    /// Generated code, if any
    pub fn native_entry(&self) -> Option<NativeEntry> {
        self.native
    }

    /// Named get caches
    pub fn get_caches(&self) -> &CacheSlab {
        &self.get_caches
    }

    /// Named put caches
    pub fn put_caches(&self) -> &CacheSlab {
        &self.put_caches
    }

    /// Global access caches
    pub fn global_caches(&self) -> &[GlobalCache] {
        &self.global_caches
    }

    /// Whether the slow-case count justifies generating native code
    pub fn should_generate_native_dispatcher(&self, generate_factor: u32) -> bool {
        let threshold = (self.static_code.codewords.len() as u64) * generate_factor as u64;
        self.slow_case_calls as u64 >= threshold.max(1)
    }

    /// Whether slow cases since the last compile justify regenerating native code
    pub fn should_regenerate_native_dispatcher(&self, regenerate_factor: u32) -> bool {
        let threshold = (self.static_code.codewords.len() as u64) * regenerate_factor as u64;
        self.native.is_some() && self.slow_case_calls as u64 >= threshold.max(1)
    }

    /// Note an int32 overflow; true when native code should be regenerated
    pub(crate) fn record_integer_overflow(&mut self) -> bool {
        if self.has_integer_overflows == 0 {
            self.has_integer_overflows = 1;
        }
        self.has_integer_overflows == 1 && self.native.is_some()
    }

    /// Approximate heap footprint
    pub fn size_hint(&self) -> usize {
        std::mem::size_of::<Self>()
            + (self.get_caches.site_count() + self.put_caches.site_count())
                * std::mem::size_of::<crate::cache::PropertyCache>()
    }
}

impl Drop for CodeInstance {
    fn drop(&mut self) {
        self.static_code.decrement_ref();
    }
}

impl Trace for CodeInstance {
    fn trace(&self, tracer: &mut Tracer<'_>) {
        tracer.mark(self.global);
        for &object in &self.scope_chain {
            tracer.mark(object);
        }
        for &function in self.functions.iter().flatten() {
            tracer.mark(function);
        }
        self.get_caches.trace(tracer);
        self.put_caches.trace(tracer);
        for class in self.literal_classes.iter().flatten() {
            tracer.mark_opt(class.prototype());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tern_vm_bytecode::CodeBuilder;

    #[test]
    fn test_sites_sized_from_static_code() {
        let mut b = CodeBuilder::program();
        let (r, o) = (b.temp(), b.temp());
        b.get_named(r, o, "a")
            .get_named(r, o, "b")
            .put_named(o, "c", r)
            .get_global(r, "g")
            .to_string(r, r)
            .exit();
        let code = Arc::new(b.finish().unwrap());
        let instance = CodeInstance::new(code.clone(), GcRef::default(), ScopeChain::new(), 4);
        assert_eq!(instance.get_caches().site_count(), 2);
        assert_eq!(instance.put_caches().site_count(), 1);
        assert_eq!(instance.global_caches().len(), 1);
        assert_eq!(instance.format_caches.len(), 1);
        assert_eq!(code.ref_count(), 1);
        drop(instance);
        assert_eq!(code.ref_count(), 0);
    }

    #[test]
    fn test_native_threshold_scales_with_code_size() {
        let mut b = CodeBuilder::program();
        b.exit();
        let code = Arc::new(b.finish().unwrap());
        let mut instance = CodeInstance::new(code, GcRef::default(), ScopeChain::new(), 4);
        assert!(!instance.should_generate_native_dispatcher(2));
        instance.slow_case_calls = 2;
        assert!(instance.should_generate_native_dispatcher(2));
        assert!(!instance.record_integer_overflow());
        instance.native = Some(NativeEntry { handle: 1 });
        assert!(instance.record_integer_overflow());
    }
}
