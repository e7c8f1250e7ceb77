//! Debugger and profiler hooks
//!
//! Both are optional trait objects installed on an execution context. The
//! dispatch loop only builds an [`InstructionLocation`] when a debugger is
//! attached.

use std::sync::Arc;

use tern_vm_bytecode::{StaticCode, profile};

use crate::value::Value;

/// Where execution is when a hook fires
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstructionLocation {
    /// Function display name
    pub function: String,
    /// Script URL, if known
    pub url: Option<Arc<str>>,
    /// Codeword index
    pub ip: u32,
    /// Source line, if the code carries debug records
    pub line: Option<u32>,
    /// Source column, if the code carries debug records
    pub column: Option<u32>,
}

impl InstructionLocation {
    /// Location of `ip` in `code`
    pub fn new(code: &StaticCode, ip: u32) -> Self {
        let record = code.find_debug_record(ip);
        Self {
            function: code.display_name().to_string(),
            url: code.url.clone(),
            ip,
            line: record.map(|r| r.location.line),
            column: record.map(|r| r.location.column),
        }
    }
}

/// Debugger callbacks; every method defaults to doing nothing
pub trait DebugHooks: Send {
    /// A call instruction is about to transfer control
    fn call_start(&mut self, _location: &InstructionLocation) {}
    /// A call instruction finished and control is back in the caller
    fn call_complete(&mut self, _location: &InstructionLocation) {}
    /// An interpreted function started running
    fn enter_function(&mut self, _location: &InstructionLocation) {}
    /// An interpreted function is about to be left, by return or unwinding
    fn leave_function(&mut self, _location: &InstructionLocation) {}
    /// A function returns a value
    fn on_return(&mut self, _location: &InstructionLocation, _value: &Value) {}
    /// An exception was thrown
    fn on_exception(&mut self, _location: &InstructionLocation, _value: &Value) {}
}

/// Receives profiling observations from the dispatch loop
pub trait ProfilingSink: Send {
    /// A slow path ran at the instruction starting at `ip`
    fn slow_case(&mut self, code: &StaticCode, ip: u32, weight: u8);
    /// A register operand at codeword `word` held a value of these type bits
    fn register_type(&mut self, code: &StaticCode, word: u32, type_bits: u8);
    /// A named get at codeword `word` hit or missed its cache
    fn get_cache(&mut self, code: &StaticCode, word: u32, hit: bool);
}

/// Records observations in the static code's profile bytes
#[derive(Debug, Default, Clone, Copy)]
pub struct CodeProfiler;

impl ProfilingSink for CodeProfiler {
    fn slow_case(&mut self, code: &StaticCode, ip: u32, weight: u8) {
        code.profile()
            .record_slow_case(code.codewords.len(), ip as usize, weight);
    }

    fn register_type(&mut self, code: &StaticCode, word: u32, type_bits: u8) {
        code.profile()
            .record_type(code.codewords.len(), word as usize, type_bits);
    }

    fn get_cache(&mut self, code: &StaticCode, word: u32, hit: bool) {
        let flag = if hit {
            profile::GET_CACHE_HIT
        } else {
            profile::GET_FAILED_INLINE
        };
        code.profile()
            .set_flag(code.codewords.len(), word as usize, flag);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tern_vm_bytecode::CodeBuilder;

    #[test]
    fn test_code_profiler_writes_profile_bytes() {
        let mut b = CodeBuilder::program();
        let r = b.temp();
        let o = b.temp();
        b.location(3, 7).get_named(r, o, "x").exit();
        let code = b.finish().unwrap();
        let mut profiler = CodeProfiler;
        profiler.slow_case(&code, 0, 2);
        profiler.register_type(&code, 2, 0x40);
        profiler.get_cache(&code, 4, false);
        assert_eq!(code.profile().get(0), 2);
        assert_eq!(code.profile().get(2), 0x40);
        assert_eq!(code.profile().get(4), profile::GET_FAILED_INLINE);

        let location = InstructionLocation::new(&code, 0);
        assert_eq!(location.line, Some(3));
        assert_eq!(location.column, Some(7));
    }
}
