//! Execution context: one cooperative thread of the program.
//!
//! A context owns four typed value stacks and a unified frame stack holding
//! function activations and nested block scopes. Frames record the depth of
//! every typed stack at entry (the watermarks); every exit path, whether a
//! block close, a return, break/continue or trap handling, truncates the
//! stacks back to those marks.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;

use tarn_core::types::{self, Storage};
use tarn_core::{ErrInfo, Image, Value};

use crate::error::{RuntimeError, SourcePos, TrapKind};
use crate::vm::types::{OptValue, STACK_SIZE};
use crate::vm::Vm;

/// One frame of the unified call/block stack.
#[derive(Debug, Clone, Copy, Default)]
pub struct Frame {
    /// Function activation (pushed by `CallById`/`Local`) rather than a
    /// nested block.
    pub is_func: bool,
    /// Inline function-like block: variable lookup may continue past it into
    /// the caller's frames.
    pub is_local: bool,
    /// Set between the call instruction and the callee's `InitVars`, which
    /// configures the frame in place.
    pub pending: bool,
    /// Offset of the frame's `InitVars` word; shifts are relative to it.
    pub start: i32,
    /// Return offset for function frames.
    pub ret: i32,
    pub flags: u16,
    /// Watermarks: typed-stack depths at entry.
    pub int: usize,
    pub float: usize,
    pub str_: usize,
    pub any: usize,
    /// Loop iterations spent inside this frame.
    pub cycle: u64,
    pub break_shift: i32,
    pub continue_shift: i32,
    pub try_shift: i32,
    pub recover_shift: i32,
    pub retry_shift: i32,
    /// The frame's try handler is currently active.
    pub in_recover: bool,
}

pub struct Context {
    pub vm: Arc<Vm>,
    pub image: Arc<Image>,
    pub calls: Vec<Frame>,
    pub sint: Vec<i64>,
    pub sfloat: Vec<f64>,
    pub sstr: Vec<String>,
    pub sany: Vec<Value>,
    /// Optional-parameter overrides consulted by `OptPars`/`JmpOpt`.
    pub optional: Vec<OptValue>,
    pub thread_id: i64,
    /// Wake channel used while awaiting a child context.
    pub wake_tx: Sender<i64>,
    pub wake_rx: Receiver<i64>,
    /// Cumulative `Cycle` hits, charged against the VM budget.
    pub cycles: u64,
    /// Error object the active try handler exposes through `Catch`.
    pub caught: Option<ErrInfo>,
}

impl Context {
    pub fn new(vm: Arc<Vm>, thread_id: i64) -> Self {
        let image = vm.image.clone();
        let (wake_tx, wake_rx) = mpsc::channel();
        Self {
            vm,
            image,
            calls: Vec::new(),
            sint: Vec::with_capacity(STACK_SIZE),
            sfloat: Vec::with_capacity(STACK_SIZE),
            sstr: Vec::with_capacity(STACK_SIZE),
            sany: Vec::with_capacity(STACK_SIZE),
            optional: Vec::new(),
            thread_id,
            wake_tx,
            wake_rx,
            cycles: 0,
            caught: None,
        }
    }

    pub(crate) fn trap(&self, kind: TrapKind, message: impl Into<String>) -> RuntimeError {
        RuntimeError::new(kind, message)
    }

    pub(crate) fn resolve_pos(&self, offset: usize) -> Option<SourcePos> {
        self.image.resolve_pos(offset as i32).map(|p| SourcePos {
            path: self.image.string(p.path).to_string(),
            func: self.image.string(p.name).to_string(),
            line: p.line,
            column: p.column,
        })
    }

    // === Typed stack primitives ===

    pub(crate) fn push_int(&mut self, v: i64) -> Result<(), RuntimeError> {
        if self.sint.len() >= STACK_SIZE {
            return Err(self.trap(TrapKind::StackOverflow, "integer stack overflow"));
        }
        self.sint.push(v);
        Ok(())
    }

    pub(crate) fn push_float(&mut self, v: f64) -> Result<(), RuntimeError> {
        if self.sfloat.len() >= STACK_SIZE {
            return Err(self.trap(TrapKind::StackOverflow, "float stack overflow"));
        }
        self.sfloat.push(v);
        Ok(())
    }

    pub(crate) fn push_str(&mut self, v: String) -> Result<(), RuntimeError> {
        if self.sstr.len() >= STACK_SIZE {
            return Err(self.trap(TrapKind::StackOverflow, "string stack overflow"));
        }
        self.sstr.push(v);
        Ok(())
    }

    pub(crate) fn push_any(&mut self, v: Value) -> Result<(), RuntimeError> {
        if self.sany.len() >= STACK_SIZE {
            return Err(self.trap(TrapKind::StackOverflow, "any stack overflow"));
        }
        self.sany.push(v);
        Ok(())
    }

    pub(crate) fn pop_int(&mut self) -> Result<i64, RuntimeError> {
        self.sint
            .pop()
            .ok_or_else(|| self.trap(TrapKind::StackUnderflow, "integer stack underflow"))
    }

    pub(crate) fn pop_float(&mut self) -> Result<f64, RuntimeError> {
        self.sfloat
            .pop()
            .ok_or_else(|| self.trap(TrapKind::StackUnderflow, "float stack underflow"))
    }

    pub(crate) fn pop_str(&mut self) -> Result<String, RuntimeError> {
        self.sstr
            .pop()
            .ok_or_else(|| self.trap(TrapKind::StackUnderflow, "string stack underflow"))
    }

    pub(crate) fn pop_any(&mut self) -> Result<Value, RuntimeError> {
        self.sany
            .pop()
            .ok_or_else(|| self.trap(TrapKind::StackUnderflow, "any stack underflow"))
    }

    /// Pop one value from the stack selected by `tag` into the uniform
    /// representation.
    pub(crate) fn value_from_stack(&mut self, tag: u16) -> Result<Value, RuntimeError> {
        match Storage::of(tag) {
            Storage::Int => Ok(Value::Int(self.pop_int()?)),
            Storage::Float => Ok(Value::Float(self.pop_float()?)),
            Storage::Str => Ok(Value::Str(self.pop_str()?)),
            Storage::Any => self.pop_any(),
            Storage::None => Err(self.trap(
                TrapKind::TypeAssertion,
                format!("cannot pop value of tag {tag:#x}"),
            )),
        }
    }

    /// Push a uniform value onto the stack selected by `tag`.
    pub(crate) fn value_to_stack(&mut self, tag: u16, value: Value) -> Result<(), RuntimeError> {
        match Storage::of(tag) {
            Storage::Int => {
                let v = value.as_int().ok_or_else(|| {
                    self.trap(TrapKind::TypeAssertion, "expected an integer value")
                })?;
                self.push_int(v)
            }
            Storage::Float => {
                let v = value.as_float().ok_or_else(|| {
                    self.trap(TrapKind::TypeAssertion, "expected a float value")
                })?;
                self.push_float(v)
            }
            Storage::Str => match value {
                Value::Str(s) => self.push_str(s),
                _ => Err(self.trap(TrapKind::TypeAssertion, "expected a string value")),
            },
            Storage::Any => self.push_any(value),
            Storage::None => Ok(()),
        }
    }

    // === Frame primitives ===

    pub(crate) fn depths(&self) -> (usize, usize, usize, usize) {
        (
            self.sint.len(),
            self.sfloat.len(),
            self.sstr.len(),
            self.sany.len(),
        )
    }

    /// Truncate all four stacks to a frame's watermarks.
    pub(crate) fn truncate_to(&mut self, frame: &Frame) {
        self.sint.truncate(frame.int);
        self.sfloat.truncate(frame.float);
        self.sstr.truncate(frame.str_);
        self.sany.truncate(frame.any);
    }

    pub(crate) fn push_frame(&mut self, frame: Frame) -> Result<(), RuntimeError> {
        if self.calls.len() as u32 >= self.vm.depth {
            return Err(self.trap(TrapKind::DepthOverflow, "maximum block depth reached"));
        }
        self.calls.push(frame);
        Ok(())
    }

    /// Frame addressed by a block shift, counted from innermost.
    pub(crate) fn frame_at(&self, shift: u16) -> Result<usize, RuntimeError> {
        let len = self.calls.len();
        if (shift as usize) < len {
            Ok(len - 1 - shift as usize)
        } else {
            Err(self.trap(
                TrapKind::StackUnderflow,
                format!("no enclosing frame at shift {shift}"),
            ))
        }
    }

    /// Watermark of `storage` for the frame at index `fidx`: variable slot
    /// `i` of that storage class lives at `watermark + i`.
    pub(crate) fn var_base(&self, fidx: usize, storage: Storage) -> usize {
        let f = &self.calls[fidx];
        match storage {
            Storage::Int => f.int,
            Storage::Float => f.float,
            Storage::Str => f.str_,
            _ => f.any,
        }
    }

    /// Push a copy of the addressed variable onto its stack.
    pub(crate) fn get_var(&mut self, shift: u16, tag: u16, index: u16) -> Result<(), RuntimeError> {
        let fidx = self.frame_at(shift)?;
        let storage = Storage::of(tag);
        let slot = self.var_base(fidx, storage) + index as usize;
        match storage {
            Storage::Int => {
                let v = *self.slot_int(slot)?;
                self.push_int(v)
            }
            Storage::Float => {
                let v = *self.slot_float(slot)?;
                self.push_float(v)
            }
            Storage::Str => {
                let v = self.slot_str(slot)?.clone();
                self.push_str(v)
            }
            Storage::Any => {
                let v = self.slot_any(slot)?.clone();
                self.push_any(v)
            }
            Storage::None => Err(self.trap(TrapKind::TypeAssertion, "variable without storage")),
        }
    }

    pub(crate) fn slot_int(&self, slot: usize) -> Result<&i64, RuntimeError> {
        self.sint
            .get(slot)
            .ok_or_else(|| self.trap(TrapKind::StackUnderflow, "integer slot out of frame"))
    }

    pub(crate) fn slot_float(&self, slot: usize) -> Result<&f64, RuntimeError> {
        self.sfloat
            .get(slot)
            .ok_or_else(|| self.trap(TrapKind::StackUnderflow, "float slot out of frame"))
    }

    pub(crate) fn slot_str(&self, slot: usize) -> Result<&String, RuntimeError> {
        self.sstr
            .get(slot)
            .ok_or_else(|| self.trap(TrapKind::StackUnderflow, "string slot out of frame"))
    }

    pub(crate) fn slot_any(&self, slot: usize) -> Result<&Value, RuntimeError> {
        self.sany
            .get(slot)
            .ok_or_else(|| self.trap(TrapKind::StackUnderflow, "any slot out of frame"))
    }

    /// Walk outward for the innermost frame protecting against `err`,
    /// unwind to it and return the handler offset to resume at.
    pub(crate) fn enter_handler(&mut self, err: &RuntimeError) -> Option<usize> {
        let fidx = self
            .calls
            .iter()
            .rposition(|f| f.try_shift != 0 && !f.in_recover)?;
        let frame = self.calls[fidx];
        self.truncate_to(&frame);
        self.calls.truncate(fidx + 1);
        self.calls[fidx].in_recover = true;
        self.caught = Some(ErrInfo {
            id: err.kind.id(),
            message: err.message.clone(),
            pos: err.pos.as_ref().map(ToString::to_string).unwrap_or_default(),
        });
        Some((frame.start + frame.try_shift) as usize)
    }

    /// Storage-class counts of the first `parcount` declared variable tags.
    pub(crate) fn par_counts(tags: &[u16], parcount: usize) -> (usize, usize, usize, usize) {
        let (mut i, mut f, mut s, mut a) = (0, 0, 0, 0);
        for tag in &tags[..parcount.min(tags.len())] {
            match Storage::of(*tag) {
                Storage::Int => i += 1,
                Storage::Float => f += 1,
                Storage::Str => s += 1,
                Storage::Any => a += 1,
                Storage::None => {}
            }
        }
        (i, f, s, a)
    }

    /// Zero value pushed for a declared, non-parameter variable.
    pub(crate) fn push_zero(&mut self, tag: u16) -> Result<(), RuntimeError> {
        match Storage::of(tag) {
            Storage::Int => self.push_int(0),
            Storage::Float => self.push_float(0.0),
            Storage::Str => self.push_str(String::new()),
            Storage::Any => self.push_any(zero_any(tag)),
            Storage::None => Ok(()),
        }
    }
}

/// Default value for an any-class variable declaration.
fn zero_any(tag: u16) -> Value {
    match tag {
        types::TYPE_ARR => Value::arr(Vec::new()),
        types::TYPE_MAP => Value::map(indexmap::IndexMap::new()),
        types::TYPE_BUF => Value::buf(Vec::new()),
        types::TYPE_SET => Value::set(Vec::new()),
        types::TYPE_RANGE => Value::Range { from: 0, to: 0 },
        types::TYPE_OBJ => Value::obj(Value::None),
        _ => Value::None,
    }
}
