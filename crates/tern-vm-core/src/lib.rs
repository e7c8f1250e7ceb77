//! # Tern VM Core
//!
//! Execution core for compiled ECMAScript: the dispatch loop, its register
//! arena and frame stack, inline caches, and the heap glue.
//!
//! ## Design Principles
//!
//! - **Register-based**: Frames are windows into a growable block arena; calls overlap the caller's tail
//! - **One loop per entry**: Script-to-script calls never recurse in Rust; only host re-entry does
//! - **Hidden classes**: Inline caches key on class ids and a prototype epoch
//! - **Cooperative**: Time quotas and suspend requests park a context at a checkpoint
//! - **Pluggable tiers**: Native code and eval compilation sit behind traits

#![warn(clippy::all)]
#![warn(missing_docs)]
#![deny(unsafe_code)]

mod access;
pub mod arena;
pub mod cache;
mod calls;
pub mod class;
pub mod code;
pub mod config;
pub mod context;
pub mod convert;
pub mod error;
pub mod frame;
pub mod gc;
pub mod hooks;
pub mod interpreter;
pub mod native;
pub mod object;
pub mod ops;
pub mod program_cache;
pub mod realm;
pub mod runtime;
pub mod space;
pub mod value;

pub use cache::{CacheSlab, CacheStats, GlobalCache, PropertyCache};
pub use code::CodeInstance;
pub use config::{JitConfig, VmConfig};
pub use context::{Completion, ExecutionContext};
pub use error::{ErrorKind, StackFrame, ThrownValue, VmError, VmResult};
pub use frame::{ExitKind, FrameType, VirtualStackFrame};
pub use hooks::{CodeProfiler, DebugHooks, InstructionLocation, ProfilingSink};
pub use interpreter::Interpreter;
pub use native::{DeoptState, NativeBackend, NativeEntry, NativeOutcome, NoNativeBackend, TrampolineFrame};
pub use object::{Builtin, Callable, HostFunctionId, JsObject, ObjectKind};
pub use ops::{Hint, strict_equals};
pub use program_cache::ProgramCache;
pub use realm::Intrinsics;
pub use runtime::{ContextId, EvalCompiler, HostFn, HostFunction, Program, Runtime};
pub use space::ObjectSpace;
pub use value::{JsString, Value};
