//! Saved interpreter frames
//!
//! The active frame's state lives in the execution context; a call saves
//! it here and a return restores it. Saved frames sit in a block stack so
//! deep recursion never reallocates and moves existing frames.

use std::sync::Arc;

use tern_vm_bytecode::{CodeKind, StaticCode};
use tern_vm_gc::{GcRef, Trace, Tracer};

use crate::arena::{BlockStack, Window};
use crate::error::{VmError, VmResult};

/// How a frame was entered
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FrameType {
    /// Ordinary call from bytecode
    #[default]
    Normal,
    /// `valueOf` / `toString` called during a primitive conversion
    ViaToPrimitive,
    /// `Function.prototype.apply` or a spread call
    ViaApply,
    /// `Function.prototype.call`
    ViaCall,
    /// Bound function forwarding to its target
    ViaBind,
}

/// Marks a frame whose return leaves the dispatch loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// Outermost program or host-initiated call
    Entry,
    /// Nested re-entry from a host function or conversion
    Reentry,
}

/// One frame's interpreter state
#[derive(Debug, Clone, Default)]
pub struct VirtualStackFrame {
    /// Next instruction
    pub ip: u32,
    /// Register window
    pub window: Window,
    /// Slots of the window shared with the caller's window
    pub overlap: usize,
    /// Overlapped slots carried into a fresh block; handed back on release
    pub copy: usize,
    /// The window starts a fresh register block
    pub first_in_block: bool,
    /// Code instance being executed; `None` for boundary frames
    pub code: Option<GcRef>,
    /// Static code of [`Self::code`], kept here to skip a heap lookup per instruction
    pub static_code: Option<Arc<StaticCode>>,
    /// Materialized variable object, for functions that call eval
    pub variable_object: Option<GcRef>,
    /// Materialized `arguments` object
    pub arguments_object: Option<GcRef>,
    /// Actual argument count
    pub argc: u32,
    /// Arguments beyond the declared formals
    pub extra_arguments: u32,
    /// Entered through `new`
    pub in_constructor: bool,
    /// How the frame was entered
    pub frame_type: FrameType,
    /// Set on boundary frames
    pub exit: Option<ExitKind>,
    /// Caller register receiving the return value when the window does not
    /// overlap the caller's
    pub return_register: Option<u32>,
}

impl VirtualStackFrame {
    /// Whether this frame runs eval code
    pub fn is_eval(&self) -> bool {
        self.static_code
            .as_ref()
            .is_some_and(|code| code.kind == CodeKind::Eval)
    }

    /// Name for stack traces
    pub fn function_name(&self) -> &str {
        self.static_code
            .as_ref()
            .map(|code| code.display_name())
            .unwrap_or("<native>")
    }
}

impl Trace for VirtualStackFrame {
    fn trace(&self, tracer: &mut Tracer<'_>) {
        tracer.mark_opt(self.code);
        tracer.mark_opt(self.variable_object);
        tracer.mark_opt(self.arguments_object);
    }
}

/// Stack of saved frames with a depth limit
#[derive(Debug)]
pub struct FrameStack {
    stack: BlockStack<VirtualStackFrame>,
    depth: usize,
    max_depth: usize,
}

impl FrameStack {
    /// Create a frame stack
    pub fn new(block_frames: usize, max_depth: usize) -> Self {
        Self {
            stack: BlockStack::new(block_frames, 2, max_depth.saturating_add(block_frames) * 2),
            depth: 0,
            max_depth,
        }
    }

    /// Save a frame; fails with a stack overflow at the depth limit
    pub fn push(&mut self, frame: VirtualStackFrame) -> VmResult<()> {
        self.push_with(|| frame)
    }

    /// Save the frame produced by `frame` once its slot is secured, so a
    /// failed push leaves the caller's state untouched
    pub fn push_with(&mut self, frame: impl FnOnce() -> VirtualStackFrame) -> VmResult<()> {
        if self.depth >= self.max_depth {
            return Err(VmError::StackOverflow);
        }
        let (window, _) = self.stack.allocate(1, 0, 0)?;
        self.stack.slots_mut(window)[0] = frame();
        self.depth += 1;
        Ok(())
    }

    /// Restore the most recently saved frame
    pub fn pop(&mut self) -> Option<VirtualStackFrame> {
        if self.depth == 0 {
            return None;
        }
        let (window, first) = self.stack.top_window(1)?;
        let frame = std::mem::take(&mut self.stack.slots_mut(window)[0]);
        self.stack.free(window, 0, 0, first);
        self.depth -= 1;
        Some(frame)
    }

    /// Number of saved frames
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Whether a push would fail
    pub fn is_full(&self) -> bool {
        self.depth >= self.max_depth
    }

    /// Saved frames, most recent first
    pub fn iter(&self) -> impl Iterator<Item = &VirtualStackFrame> {
        self.stack.live_rev()
    }

    /// Mutable access to the `n`th saved frame, most recent first
    pub fn nth_mut(&mut self, n: usize) -> Option<&mut VirtualStackFrame> {
        self.stack.nth_from_top_mut(n)
    }
}

impl Trace for FrameStack {
    fn trace(&self, tracer: &mut Tracer<'_>) {
        tracer.trace_all(self.stack.live());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(ip: u32) -> VirtualStackFrame {
        VirtualStackFrame {
            ip,
            ..VirtualStackFrame::default()
        }
    }

    #[test]
    fn test_push_pop_across_blocks() {
        let mut frames = FrameStack::new(2, 100);
        for ip in 0..7 {
            frames.push(frame(ip)).unwrap();
        }
        assert_eq!(frames.depth(), 7);
        let order: Vec<u32> = frames.iter().map(|f| f.ip).collect();
        assert_eq!(order, vec![6, 5, 4, 3, 2, 1, 0]);
        frames.nth_mut(1).unwrap().argc = 9;
        for ip in (0..7).rev() {
            let f = frames.pop().unwrap();
            assert_eq!(f.ip, ip);
            if ip == 5 {
                assert_eq!(f.argc, 9);
            }
        }
        assert!(frames.pop().is_none());
    }

    #[test]
    fn test_depth_limit() {
        let mut frames = FrameStack::new(4, 3);
        for ip in 0..3 {
            frames.push(frame(ip)).unwrap();
        }
        assert!(frames.is_full());
        assert!(matches!(frames.push(frame(3)), Err(VmError::StackOverflow)));
        assert_eq!(frames.depth(), 3);
    }
}
