//! The instruction dispatch loop.
//!
//! One flat match over the opcode table. The spawn/embed/assignment families
//! delegate to their modules; everything else is inline. A trap raised by an
//! arm unwinds to the innermost try frame or, when none protects it, leaves
//! `run` with the position of the failing instruction attached.

use std::sync::atomic::Ordering;
use std::thread;

use tarn_core::opcode::{
    self, Opcode, BL_BREAK, BL_CONTINUE, BL_PARS, BL_RECOVER, BL_RETRY, BL_TRY, BL_VARS,
};
use tarn_core::types::Storage;
use tarn_core::{ErrInfo, Value};

use crate::context::{Context, Frame};
use crate::embed;
use crate::error::{RuntimeError, TrapKind};
use crate::exec::{assign, object};
use crate::vm::types::{Param, FLAG_CLOSED, FLAG_STOPPED};

enum Flow {
    Continue,
    Finished(Option<(u16, Value)>),
}

enum RetOutcome {
    Jump(usize),
    Finished(Option<(u16, Value)>),
}

impl Context {
    /// Execute from `offset` until the context completes or fails. The
    /// result is the value a trailing `Ret` left, with its declared tag.
    pub fn run(&mut self, offset: usize) -> Result<Option<(u16, Value)>, RuntimeError> {
        let image = self.image.clone();
        let code = image.code.as_slice();
        let mut pc = offset;
        loop {
            // Single combined flag keeps the hot path to one atomic load.
            let flags = self.vm.flags.load(Ordering::Relaxed);
            if flags != 0 {
                if flags & FLAG_CLOSED != 0 {
                    let e = self.trap(TrapKind::Terminated, "execution terminated");
                    return Err(self.locate(e, pc));
                }
                while self.vm.flags.load(Ordering::Relaxed) & FLAG_STOPPED != 0 {
                    thread::yield_now();
                }
                continue;
            }
            let at = pc;
            match self.step(code, &mut pc) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Finished(result)) => return Ok(result),
                Err(e) => {
                    let e = self.locate(e, at);
                    if e.kind.catchable() {
                        if let Some(handler) = self.enter_handler(&e) {
                            pc = handler;
                            continue;
                        }
                    }
                    return Err(e);
                }
            }
        }
    }

    fn locate(&self, mut e: RuntimeError, pc: usize) -> RuntimeError {
        if e.pos.is_none() {
            e.pos = self.resolve_pos(pc);
        }
        e
    }

    fn word_at(&self, code: &[i32], at: usize) -> Result<i32, RuntimeError> {
        code.get(at)
            .copied()
            .ok_or_else(|| self.trap(TrapKind::UnknownInstruction, "truncated instruction"))
    }

    fn jump(&self, from: usize, rel: i32) -> Result<usize, RuntimeError> {
        let target = from as i64 + rel as i64;
        if target < 0 {
            Err(self.trap(TrapKind::UnknownInstruction, "jump outside code"))
        } else {
            Ok(target as usize)
        }
    }

    fn step(&mut self, code: &[i32], pc: &mut usize) -> Result<Flow, RuntimeError> {
        let w = self.word_at(code, *pc)?;
        let raw = opcode::op_of(w);
        let op = Opcode::from_u16(raw).ok_or_else(|| {
            self.trap(TrapKind::UnknownInstruction, format!("unknown instruction {raw}"))
        })?;
        let param = opcode::param_of(w);

        match op {
            Opcode::Nop => *pc += 1,

            // === Pushes ===
            Opcode::Push32 => {
                let v = self.word_at(code, *pc + 1)? as i64;
                self.push_int(v)?;
                *pc += 2;
            }
            Opcode::Push64 => {
                let lo = self.word_at(code, *pc + 1)? as u32 as u64;
                let hi = self.word_at(code, *pc + 2)? as u32 as u64;
                self.push_int((hi << 32 | lo) as i64)?;
                *pc += 3;
            }
            Opcode::PushFloat => {
                let lo = self.word_at(code, *pc + 1)? as u32 as u64;
                let hi = self.word_at(code, *pc + 2)? as u32 as u64;
                self.push_float(f64::from_bits(hi << 32 | lo))?;
                *pc += 3;
            }
            Opcode::PushStr => {
                let s = self.image.string(param).to_string();
                self.push_str(s)?;
                *pc += 1;
            }
            Opcode::PushFunc => {
                let id = self.word_at(code, *pc + 1)?;
                self.push_any(Value::Func(id))?;
                *pc += 2;
            }

            // === Integer arithmetic, bitwise, comparison ===
            Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::Div
            | Opcode::Mod
            | Opcode::BitOr
            | Opcode::BitXor
            | Opcode::BitAnd
            | Opcode::Lshift
            | Opcode::Rshift => {
                let b = self.pop_int()?;
                let a = self.pop_int()?;
                let v = assign::int_arith(op, a, b)?;
                self.push_int(v)?;
                *pc += 1;
            }
            Opcode::BitNot => {
                let a = self.pop_int()?;
                self.push_int(!a)?;
                *pc += 1;
            }
            Opcode::Sign => {
                let a = self.pop_int()?;
                self.push_int(a.wrapping_neg())?;
                *pc += 1;
            }
            Opcode::Not => {
                let a = self.pop_int()?;
                self.push_int((a == 0) as i64)?;
                *pc += 1;
            }
            Opcode::Eq => {
                let b = self.pop_int()?;
                let a = self.pop_int()?;
                self.push_int((a == b) as i64)?;
                *pc += 1;
            }
            Opcode::Lt => {
                let b = self.pop_int()?;
                let a = self.pop_int()?;
                self.push_int((a < b) as i64)?;
                *pc += 1;
            }
            Opcode::Gt => {
                let b = self.pop_int()?;
                let a = self.pop_int()?;
                self.push_int((a > b) as i64)?;
                *pc += 1;
            }

            // === Float arithmetic and comparison ===
            Opcode::AddFloat => {
                let b = self.pop_float()?;
                let a = self.pop_float()?;
                self.push_float(a + b)?;
                *pc += 1;
            }
            Opcode::SubFloat => {
                let b = self.pop_float()?;
                let a = self.pop_float()?;
                self.push_float(a - b)?;
                *pc += 1;
            }
            Opcode::MulFloat => {
                let b = self.pop_float()?;
                let a = self.pop_float()?;
                self.push_float(a * b)?;
                *pc += 1;
            }
            Opcode::DivFloat => {
                let b = self.pop_float()?;
                let a = self.pop_float()?;
                self.push_float(a / b)?;
                *pc += 1;
            }
            Opcode::SignFloat => {
                let a = self.pop_float()?;
                self.push_float(-a)?;
                *pc += 1;
            }
            Opcode::EqFloat => {
                let b = self.pop_float()?;
                let a = self.pop_float()?;
                self.push_int((a == b) as i64)?;
                *pc += 1;
            }
            Opcode::LtFloat => {
                let b = self.pop_float()?;
                let a = self.pop_float()?;
                self.push_int((a < b) as i64)?;
                *pc += 1;
            }
            Opcode::GtFloat => {
                let b = self.pop_float()?;
                let a = self.pop_float()?;
                self.push_int((a > b) as i64)?;
                *pc += 1;
            }

            // === String operations ===
            Opcode::AddStr => {
                let b = self.pop_str()?;
                let mut a = self.pop_str()?;
                a.push_str(&b);
                self.push_str(a)?;
                *pc += 1;
            }
            Opcode::EqStr => {
                let b = self.pop_str()?;
                let a = self.pop_str()?;
                self.push_int((a == b) as i64)?;
                *pc += 1;
            }
            Opcode::LtStr => {
                let b = self.pop_str()?;
                let a = self.pop_str()?;
                self.push_int((a < b) as i64)?;
                *pc += 1;
            }
            Opcode::GtStr => {
                let b = self.pop_str()?;
                let a = self.pop_str()?;
                self.push_int((a > b) as i64)?;
                *pc += 1;
            }

            // === Variables ===
            Opcode::GetVar => {
                let (tag, index) = opcode::unpack(self.word_at(code, *pc + 1)?);
                self.get_var(param, tag, index)?;
                *pc += 2;
            }
            Opcode::SetVar => {
                let (tag, index) = opcode::unpack(self.word_at(code, *pc + 1)?);
                let (count, assign_code) = opcode::unpack(self.word_at(code, *pc + 2)?);
                let mut levels = Vec::with_capacity(count as usize);
                for k in 0..count as usize {
                    levels.push(opcode::unpack(self.word_at(code, *pc + 3 + k)?));
                }
                let mut adv = 3 + count as usize;
                let delta = if assign_code == Opcode::IncDec as u16 {
                    let d = self.word_at(code, *pc + adv)? as i64;
                    adv += 1;
                    d
                } else {
                    0
                };
                assign::set_var(self, param, tag, index, assign_code, &levels, delta)?;
                *pc += adv;
            }
            Opcode::Dup => {
                match Storage::of(param) {
                    Storage::Int => {
                        let v = *self.sint.last().ok_or_else(|| {
                            self.trap(TrapKind::StackUnderflow, "integer stack underflow")
                        })?;
                        self.push_int(v)?;
                    }
                    Storage::Float => {
                        let v = *self.sfloat.last().ok_or_else(|| {
                            self.trap(TrapKind::StackUnderflow, "float stack underflow")
                        })?;
                        self.push_float(v)?;
                    }
                    Storage::Str => {
                        let v = self
                            .sstr
                            .last()
                            .cloned()
                            .ok_or_else(|| {
                                self.trap(TrapKind::StackUnderflow, "string stack underflow")
                            })?;
                        self.push_str(v)?;
                    }
                    _ => {
                        let v = self
                            .sany
                            .last()
                            .cloned()
                            .ok_or_else(|| {
                                self.trap(TrapKind::StackUnderflow, "any stack underflow")
                            })?;
                        self.push_any(v)?;
                    }
                }
                *pc += 1;
            }
            Opcode::Pop => {
                match Storage::of(param) {
                    Storage::Int => {
                        self.pop_int()?;
                    }
                    Storage::Float => {
                        self.pop_float()?;
                    }
                    Storage::Str => {
                        self.pop_str()?;
                    }
                    _ => {
                        self.pop_any()?;
                    }
                }
                *pc += 1;
            }

            // === Loops ===
            Opcode::Cycle => {
                if let Some(f) = self.calls.last_mut() {
                    f.cycle += 1;
                }
                self.cycles += 1;
                if self.cycles > self.vm.cycle {
                    return Err(self.trap(
                        TrapKind::CycleOverflow,
                        format!("loop budget of {} exhausted", self.vm.cycle),
                    ));
                }
                *pc += 1;
            }
            Opcode::ForInc => {
                let fidx = self.frame_at(0)?;
                let slot = self.var_base(fidx, Storage::Int) + param as usize;
                let v = *self.slot_int(slot)?;
                self.sint[slot] = v.wrapping_add(1);
                *pc += 1;
            }

            // === Control transfer ===
            Opcode::Jmp => {
                let rel = self.word_at(code, *pc + 1)?;
                *pc = self.jump(*pc, rel)?;
            }
            Opcode::Jze => {
                let rel = self.word_at(code, *pc + 1)?;
                if self.pop_int()? == 0 {
                    *pc = self.jump(*pc, rel)?;
                } else {
                    *pc += 2;
                }
            }
            Opcode::Jnz => {
                let rel = self.word_at(code, *pc + 1)?;
                if self.pop_int()? != 0 {
                    *pc = self.jump(*pc, rel)?;
                } else {
                    *pc += 2;
                }
            }
            Opcode::Jeq => {
                let rel = self.word_at(code, *pc + 1)?;
                let equal = match Storage::of(param) {
                    Storage::Int => {
                        let case = self.pop_int()?;
                        let top = *self.sint.last().ok_or_else(|| {
                            self.trap(TrapKind::StackUnderflow, "integer stack underflow")
                        })?;
                        case == top
                    }
                    Storage::Str => {
                        let case = self.pop_str()?;
                        let top = self.sstr.last().ok_or_else(|| {
                            self.trap(TrapKind::StackUnderflow, "string stack underflow")
                        })?;
                        case == *top
                    }
                    Storage::Float => {
                        let case = self.pop_float()?;
                        let top = *self.sfloat.last().ok_or_else(|| {
                            self.trap(TrapKind::StackUnderflow, "float stack underflow")
                        })?;
                        case == top
                    }
                    _ => {
                        return Err(
                            self.trap(TrapKind::TypeAssertion, "unsupported case comparison")
                        )
                    }
                };
                if equal {
                    *pc = self.jump(*pc, rel)?;
                } else {
                    *pc += 2;
                }
            }
            Opcode::JmpOpt => {
                let rel = self.word_at(code, *pc + 1)?;
                let supplied = self.optional.iter().any(|o| o.var == param as i32);
                if supplied {
                    *pc = self.jump(*pc, rel)?;
                } else {
                    *pc += 2;
                }
            }

            // === Frames ===
            Opcode::InitVars => {
                *pc = self.init_vars(code, *pc, param)?;
            }
            Opcode::DelVars => {
                let frame = self.calls.pop().ok_or_else(|| {
                    self.trap(TrapKind::StackUnderflow, "no block to close")
                })?;
                self.truncate_to(&frame);
                *pc += 1;
            }
            Opcode::OptPars => {
                let count = param as usize;
                for k in 0..count {
                    let (tag, var) = opcode::unpack(self.word_at(code, *pc + 1 + k)?);
                    let supplied = self
                        .optional
                        .iter()
                        .find(|o| o.var == var as i32)
                        .map(|o| o.value.clone());
                    if let Some(value) = supplied {
                        let storage = Storage::of(tag);
                        let fidx = self.frame_at(0)?;
                        let slot = self.var_base(fidx, storage) + var as usize;
                        let target = match storage {
                            Storage::Int => assign::Target::IntSlot(slot),
                            Storage::Float => assign::Target::FloatSlot(slot),
                            Storage::Str => assign::Target::StrSlot(slot),
                            _ => assign::Target::AnySlot(slot),
                        };
                        assign::write_target(self, &target, value)?;
                    }
                }
                *pc += 1 + count;
            }

            // === Try flow ===
            Opcode::Recover => {
                let fidx = self
                    .calls
                    .iter()
                    .rposition(|f| f.recover_shift != 0)
                    .ok_or_else(|| {
                        self.trap(TrapKind::UnknownInstruction, "no recover handler installed")
                    })?;
                let frame = self.calls[fidx];
                self.truncate_to(&frame);
                self.calls.truncate(fidx + 1);
                self.calls[fidx].in_recover = false;
                self.caught = None;
                *pc = self.jump(frame.start as usize, frame.recover_shift)?;
            }
            Opcode::Retry => {
                let fidx = self
                    .calls
                    .iter()
                    .rposition(|f| f.retry_shift != 0)
                    .ok_or_else(|| {
                        self.trap(TrapKind::UnknownInstruction, "no retry handler installed")
                    })?;
                let frame = self.calls[fidx];
                self.truncate_to(&frame);
                self.calls.truncate(fidx + 1);
                self.calls[fidx].in_recover = false;
                self.caught = None;
                *pc = self.jump(frame.start as usize, frame.retry_shift)?;
            }
            Opcode::Catch => {
                let info = self.caught.clone().unwrap_or(ErrInfo {
                    id: 0,
                    message: String::new(),
                    pos: String::new(),
                });
                self.push_any(Value::Error(Box::new(info)))?;
                *pc += 1;
            }

            Opcode::Break | Opcode::Continue => {
                let flag = if op == Opcode::Break {
                    BL_BREAK
                } else {
                    BL_CONTINUE
                };
                let fidx = self
                    .calls
                    .iter()
                    .rposition(|f| f.flags & flag != 0)
                    .ok_or_else(|| {
                        self.trap(TrapKind::UnknownInstruction, "no enclosing loop")
                    })?;
                let frame = self.calls[fidx];
                self.truncate_to(&frame);
                self.calls.truncate(fidx + 1);
                let shift = if op == Opcode::Break {
                    frame.break_shift
                } else {
                    frame.continue_shift
                };
                *pc = self.jump(frame.start as usize, shift)?;
            }

            // === Aggregates ===
            Opcode::InitObj => {
                let (obj_tag, elem_tag) = opcode::unpack(self.word_at(code, *pc + 1)?);
                object::init_obj(self, param as usize, obj_tag, elem_tag)?;
                *pc += 2;
            }
            Opcode::Range => {
                let to = self.pop_int()?;
                let from = self.pop_int()?;
                self.push_any(Value::Range { from, to })?;
                *pc += 1;
            }
            Opcode::Array => {
                let elem_tag = self.word_at(code, *pc + 1)? as u16;
                object::init_obj(self, param as usize, tarn_core::types::TYPE_ARR, elem_tag)?;
                *pc += 2;
            }
            Opcode::Len => {
                object::len_op(self, param)?;
                *pc += 1;
            }
            Opcode::Index => {
                let count = param as usize;
                let mut levels = Vec::with_capacity(count);
                for k in 0..count {
                    levels.push(opcode::unpack(self.word_at(code, *pc + 1 + k)?));
                }
                if levels.is_empty() {
                    return Err(self.trap(TrapKind::UnknownInstruction, "empty index level list"));
                }
                object::index_op(self, &levels)?;
                *pc += 1 + count;
            }

            // === Constants ===
            Opcode::ConstById => {
                let id = self.word_at(code, *pc + 1)?;
                let c = self.vm.consts.read().get(&id).cloned().ok_or_else(|| {
                    self.trap(TrapKind::UnknownInstruction, format!("unknown constant {id}"))
                })?;
                self.value_to_stack(c.tag, c.value)?;
                *pc += 2;
            }
            Opcode::Iota => {
                self.push_int(param as i64)?;
                *pc += 1;
            }

            // === Calls ===
            Opcode::CallById => {
                let fid = self.word_at(code, *pc + 1)?;
                let entry = self.func_entry(fid)?;
                let (di, df, ds, da) = self.depths();
                self.push_frame(Frame {
                    is_func: true,
                    pending: true,
                    start: entry,
                    ret: (*pc + 2) as i32,
                    int: di,
                    float: df,
                    str_: ds,
                    any: da,
                    ..Default::default()
                })?;
                *pc = entry as usize;
            }
            Opcode::Local => {
                let entry = self.word_at(code, *pc + 1)?;
                if entry < 0 {
                    return Err(self.trap(TrapKind::UnknownInstruction, "jump outside code"));
                }
                let (di, df, ds, da) = self.depths();
                self.push_frame(Frame {
                    is_func: true,
                    is_local: true,
                    pending: true,
                    start: entry,
                    ret: (*pc + 2) as i32,
                    int: di,
                    float: df,
                    str_: ds,
                    any: da,
                    ..Default::default()
                })?;
                *pc = entry as usize;
            }
            Opcode::EmbedFunc => {
                let v = self.pop_any()?;
                let Value::Func(fid) = v else {
                    return Err(self.trap(TrapKind::TypeAssertion, "expected a function reference"));
                };
                let entry = self.func_entry(fid)?;
                let (di, df, ds, da) = self.depths();
                self.push_frame(Frame {
                    is_func: true,
                    pending: true,
                    start: entry,
                    ret: (*pc + 1) as i32,
                    int: di,
                    float: df,
                    str_: ds,
                    any: da,
                    ..Default::default()
                })?;
                *pc = entry as usize;
            }
            Opcode::Ret => match self.do_ret(param)? {
                RetOutcome::Jump(target) => *pc = target,
                RetOutcome::Finished(result) => return Ok(Flow::Finished(result)),
            },
            Opcode::End => {
                return Err(self.trap(TrapKind::UnknownInstruction, "end of function reached"));
            }

            // === Embeds ===
            Opcode::Embed => {
                let variadic = self
                    .vm
                    .embeds
                    .sig(param)
                    .map(|s| s.variadic)
                    .ok_or_else(|| {
                        self.trap(TrapKind::UnknownInstruction, format!("unknown embed {param}"))
                    })?;
                let mut adv = 1;
                let tail = if variadic {
                    let count = self.word_at(code, *pc + 1)? as usize;
                    let mut tags = Vec::with_capacity(count);
                    for k in 0..count {
                        tags.push(self.word_at(code, *pc + 2 + k)? as u16);
                    }
                    adv = 2 + count;
                    let mut vals = Vec::with_capacity(count);
                    for tag in tags.iter().rev() {
                        vals.push(self.value_from_stack(*tag)?);
                    }
                    vals.reverse();
                    Some(vals)
                } else {
                    None
                };
                embed::call_embed(self, param, tail)?;
                *pc += adv;
            }

            // === Spawn ===
            Opcode::GoById => {
                let fid = self.word_at(code, *pc + 1)?;
                let packed = self.word_at(code, *pc + 2)? as u32;
                let parcount = param as usize;
                let mut params = Vec::with_capacity(parcount);
                for i in (0..parcount).rev() {
                    let storage = Storage::from_code(((packed >> (2 * i)) & 3) as u16);
                    params.push(match storage {
                        Storage::Str => Param::Str(self.pop_str()?),
                        Storage::Float => Param::Float(self.pop_float()?),
                        Storage::Any => Param::Any(self.pop_any()?),
                        _ => Param::Int(self.pop_int()?),
                    });
                }
                params.reverse();
                let vm = self.vm.clone();
                let tid = vm.spawn_context(fid, params)?;
                self.push_int(tid)?;
                *pc += 3;
            }

            // Assignment selectors are only valid inside SetVar's operand.
            Opcode::AssignPtr
            | Opcode::Assign
            | Opcode::AssignAdd
            | Opcode::AssignSub
            | Opcode::AssignMul
            | Opcode::AssignDiv
            | Opcode::AssignMod
            | Opcode::AssignBitOr
            | Opcode::AssignBitXor
            | Opcode::AssignBitAnd
            | Opcode::AssignLshift
            | Opcode::AssignRshift
            | Opcode::IncDec => {
                return Err(self.trap(
                    TrapKind::UnknownInstruction,
                    "assignment selector dispatched as instruction",
                ));
            }
        }
        Ok(Flow::Continue)
    }

    fn func_entry(&self, fid: i32) -> Result<i32, RuntimeError> {
        self.image.funcs.get(&fid).copied().ok_or_else(|| {
            self.trap(TrapKind::UnknownInstruction, format!("unknown function {fid}"))
        })
    }

    /// `InitVars`: open a block frame, or configure the pending function
    /// frame left by the call instruction. Returns the offset after the
    /// operand words.
    fn init_vars(&mut self, code: &[i32], pc: usize, flags: u16) -> Result<usize, RuntimeError> {
        let mut i = pc + 1;
        let mut break_shift = 0;
        let mut continue_shift = 0;
        let mut try_shift = 0;
        let mut recover_shift = 0;
        let mut retry_shift = 0;
        if flags & BL_BREAK != 0 {
            break_shift = self.word_at(code, i)?;
            i += 1;
        }
        if flags & BL_CONTINUE != 0 {
            continue_shift = self.word_at(code, i)?;
            i += 1;
        }
        if flags & BL_TRY != 0 {
            try_shift = self.word_at(code, i)?;
            i += 1;
        }
        if flags & BL_RECOVER != 0 {
            recover_shift = self.word_at(code, i)?;
            i += 1;
        }
        if flags & BL_RETRY != 0 {
            retry_shift = self.word_at(code, i)?;
            i += 1;
        }
        let mut tags: Vec<u16> = Vec::new();
        let mut parcount = 0usize;
        if flags & (BL_VARS | BL_PARS) != 0 {
            let (varcount, pars) = opcode::unpack(self.word_at(code, i)?);
            i += 1;
            parcount = pars as usize;
            for k in 0..varcount as usize {
                tags.push(self.word_at(code, i + k)? as u16);
            }
            i += varcount as usize;
        }

        let (pi, pf, ps, pa) = Context::par_counts(&tags, parcount);
        let (di, df, ds, da) = self.depths();
        if di < pi || df < pf || ds < ps || da < pa {
            return Err(self.trap(TrapKind::StackUnderflow, "missing parameters"));
        }
        let marks = (di - pi, df - pf, ds - ps, da - pa);

        let pending = self.calls.last().map(|f| f.pending).unwrap_or(false);
        if pending {
            let f = self.calls.last_mut().expect("pending frame");
            f.pending = false;
            f.start = pc as i32;
            f.flags = flags;
            f.int = marks.0;
            f.float = marks.1;
            f.str_ = marks.2;
            f.any = marks.3;
            f.break_shift = break_shift;
            f.continue_shift = continue_shift;
            f.try_shift = try_shift;
            f.recover_shift = recover_shift;
            f.retry_shift = retry_shift;
        } else {
            self.push_frame(Frame {
                is_func: false,
                is_local: false,
                pending: false,
                start: pc as i32,
                ret: 0,
                flags,
                int: marks.0,
                float: marks.1,
                str_: marks.2,
                any: marks.3,
                cycle: 0,
                break_shift,
                continue_shift,
                try_shift,
                recover_shift,
                retry_shift,
                in_recover: false,
            })?;
        }
        for tag in tags.iter().skip(parcount) {
            self.push_zero(*tag)?;
        }
        Ok(i)
    }

    fn do_ret(&mut self, tag: u16) -> Result<RetOutcome, RuntimeError> {
        let val = if Storage::of(tag) == Storage::None {
            None
        } else {
            Some(self.value_from_stack(tag)?)
        };
        match self.calls.iter().rposition(|f| f.is_func) {
            Some(fidx) => {
                let frame = self.calls[fidx];
                self.truncate_to(&frame);
                if let Some(v) = val {
                    self.value_to_stack(tag, v)?;
                }
                self.calls.truncate(fidx);
                Ok(RetOutcome::Jump(frame.ret as usize))
            }
            None => Ok(RetOutcome::Finished(val.map(|v| (tag, v)))),
        }
    }
}
