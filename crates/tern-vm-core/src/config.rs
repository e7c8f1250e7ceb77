//! Runtime configuration
//!
//! Every knob has a default; a host can also load the whole structure from
//! a configuration file through serde.

use serde::{Deserialize, Serialize};
use tern_vm_gc::GcConfig;

/// Native code generation triggers
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JitConfig {
    /// Ask the native backend for a dispatcher at all (default: false)
    pub enabled: bool,
    /// A code instance becomes a candidate once its slow-case count reaches
    /// `codewords * generate_factor` (default: 1)
    pub generate_factor: u32,
    /// Native code is regenerated once `codewords * regenerate_factor` more
    /// slow cases accumulate after a compile (default: 4)
    pub regenerate_factor: u32,
    /// Record per-codeword profile bytes while interpreting (default: follows `enabled`)
    pub profile: Option<bool>,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            generate_factor: 1,
            regenerate_factor: 4,
            profile: None,
        }
    }
}

impl JitConfig {
    /// Whether profile bytes are recorded
    pub fn profiling_enabled(&self) -> bool {
        self.profile.unwrap_or(self.enabled)
    }
}

/// Runtime configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    /// Maximum number of active JS frames (default: 16384)
    pub max_call_depth: usize,
    /// Maximum nesting of host re-entries such as ToPrimitive calls (default: 256)
    pub max_host_nesting: u32,
    /// Checkpoints between out-of-time checks at startup (default: 1024)
    pub initial_time_quota: u32,
    /// Ceiling for the adaptive time quota (default: 1 << 20)
    pub max_time_quota: u32,
    /// Capacity of the first register block (default: 4096)
    pub register_block_slots: usize,
    /// Each new register block is this many times larger than the last (default: 2)
    pub register_growth_ratio: usize,
    /// Hard ceiling on register slots across all blocks (default: 1 << 24)
    pub max_register_slots: usize,
    /// Saved frames per frame-stack block (default: 256)
    pub frame_block_frames: usize,
    /// Maximum entries in one property cache chain (default: 4)
    pub cache_chain_limit: usize,
    /// Objects switch to dictionary mode past this many properties (default: 64)
    pub dictionary_threshold: usize,
    /// Frames recorded in an uncaught exception's stack trace (default: 32)
    pub stack_trace_depth: usize,
    /// Compiled programs kept by source text (default: 32)
    pub program_cache_capacity: usize,
    /// Heap settings
    pub gc: GcConfig,
    /// Native code settings
    pub jit: JitConfig,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            max_call_depth: 16 * 1024,
            max_host_nesting: 256,
            initial_time_quota: 1024,
            max_time_quota: 1 << 20,
            register_block_slots: 4096,
            register_growth_ratio: 2,
            max_register_slots: 1 << 24,
            frame_block_frames: 256,
            cache_chain_limit: 4,
            dictionary_threshold: 64,
            stack_trace_depth: 32,
            program_cache_capacity: 32,
            gc: GcConfig::default(),
            jit: JitConfig::default(),
        }
    }
}

impl VmConfig {
    /// Set the call depth limit
    pub fn max_call_depth(mut self, depth: usize) -> Self {
        self.max_call_depth = depth;
        self
    }

    /// Set the starting time quota
    pub fn initial_time_quota(mut self, quota: u32) -> Self {
        self.initial_time_quota = quota.max(1);
        self
    }

    /// Set the register arena geometry
    pub fn register_blocks(mut self, first_block: usize, max_slots: usize) -> Self {
        self.register_block_slots = first_block.max(1);
        self.max_register_slots = max_slots;
        self
    }

    /// Set the property cache chain limit
    pub fn cache_chain_limit(mut self, limit: usize) -> Self {
        self.cache_chain_limit = limit.max(1);
        self
    }

    /// Set the heap configuration
    pub fn gc(mut self, gc: GcConfig) -> Self {
        self.gc = gc;
        self
    }

    /// Enable native code generation
    pub fn jit(mut self, jit: JitConfig) -> Self {
        self.jit = jit;
        self
    }
}
