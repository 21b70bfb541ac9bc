//! `SetVar` and the assignment family.
//!
//! An assignment target is resolved into an explicit lvalue (a typed-stack
//! slot or an element inside a shared aggregate), then the selected
//! `Assign` operation is applied to it. Compound variants reuse the
//! arithmetic semantics of the corresponding opcodes and surface the same
//! traps; the assigned value is left on the stack of its type for expression
//! use.

use tarn_core::opcode::Opcode;
use tarn_core::types::{self, Storage};
use tarn_core::value::{ArrRef, BufRef, MapRef, ObjRef, SetRef, StructRef};
use tarn_core::{value, Value};

use crate::context::Context;
use crate::error::{RuntimeError, TrapKind};

/// A resolved assignment target.
pub(crate) enum Target {
    IntSlot(usize),
    FloatSlot(usize),
    StrSlot(usize),
    AnySlot(usize),
    ArrElem(ArrRef, usize),
    MapElem(MapRef, String),
    BufElem(BufRef, usize),
    SetBit(SetRef, usize),
    StructField(StructRef, usize),
    ObjBox(ObjRef),
    /// Character `idx` of the string in stack slot `slot`.
    StrChar(usize, usize),
}

/// One nested-indexing key, popped from the int or str stack.
pub(crate) enum IndexKey {
    Int(i64),
    Str(String),
}

/// Pop the index keys for a level list. Keys were pushed in level order, so
/// the last level's key is on top of its stack.
pub(crate) fn pop_keys(
    ctx: &mut Context,
    levels: &[(u16, u16)],
) -> Result<Vec<IndexKey>, RuntimeError> {
    let mut keys = Vec::with_capacity(levels.len());
    for (container, _) in levels.iter().rev() {
        if *container == types::TYPE_MAP {
            keys.push(IndexKey::Str(ctx.pop_str()?));
        } else {
            keys.push(IndexKey::Int(ctx.pop_int()?));
        }
    }
    keys.reverse();
    Ok(keys)
}

fn key_index(ctx: &Context, key: &IndexKey) -> Result<usize, RuntimeError> {
    match key {
        IndexKey::Int(v) if *v >= 0 => Ok(*v as usize),
        IndexKey::Int(v) => Err(ctx.trap(
            TrapKind::IndexOutOfRange,
            format!("negative index {v}"),
        )),
        IndexKey::Str(_) => Err(ctx.trap(TrapKind::TypeAssertion, "expected an integer index")),
    }
}

/// Lvalue for an element of `container`.
fn element_target(
    ctx: &Context,
    container: Value,
    key: &IndexKey,
) -> Result<Target, RuntimeError> {
    match container {
        Value::Arr(a) => {
            let idx = key_index(ctx, key)?;
            let len = a.read().len();
            if idx >= len {
                return Err(ctx.trap(
                    TrapKind::IndexOutOfRange,
                    format!("index {idx} out of range [0..{len})"),
                ));
            }
            Ok(Target::ArrElem(a, idx))
        }
        Value::Map(m) => match key {
            IndexKey::Str(k) => Ok(Target::MapElem(m, k.clone())),
            IndexKey::Int(_) => {
                Err(ctx.trap(TrapKind::TypeAssertion, "expected a string key"))
            }
        },
        Value::Buf(b) => {
            let idx = key_index(ctx, key)?;
            let len = b.read().len();
            if idx >= len {
                return Err(ctx.trap(
                    TrapKind::IndexOutOfRange,
                    format!("index {idx} out of range [0..{len})"),
                ));
            }
            Ok(Target::BufElem(b, idx))
        }
        Value::Set(s) => Ok(Target::SetBit(s, key_index(ctx, key)?)),
        Value::Struct(st) => {
            let idx = key_index(ctx, key)?;
            let len = st.read().fields.len();
            if idx >= len {
                return Err(ctx.trap(
                    TrapKind::IndexOutOfRange,
                    format!("field {idx} out of range [0..{len})"),
                ));
            }
            Ok(Target::StructField(st, idx))
        }
        Value::Obj(o) => {
            let inner = o.read().clone();
            match inner {
                Value::None => Ok(Target::ObjBox(o)),
                other => element_target(ctx, other, key),
            }
        }
        other => Err(ctx.trap(
            TrapKind::TypeAssertion,
            format!("cannot index into {other}"),
        )),
    }
}

/// Resolve `(block shift, index)` plus nested-index levels into a target.
pub(crate) fn resolve(
    ctx: &mut Context,
    shift: u16,
    tag: u16,
    index: u16,
    levels: &[(u16, u16)],
    keys: Vec<IndexKey>,
) -> Result<Target, RuntimeError> {
    let fidx = ctx.frame_at(shift)?;
    let storage = Storage::of(tag);
    let slot = ctx.var_base(fidx, storage) + index as usize;
    let mut target = match storage {
        Storage::Int => Target::IntSlot(slot),
        Storage::Float => Target::FloatSlot(slot),
        Storage::Str => Target::StrSlot(slot),
        Storage::Any => Target::AnySlot(slot),
        Storage::None => {
            return Err(ctx.trap(TrapKind::TypeAssertion, "variable without storage"))
        }
    };
    for ((container_tag, _), key) in levels.iter().zip(keys) {
        if *container_tag == types::TYPE_STR {
            // Character assignment reaches through the string slot.
            let Target::StrSlot(slot) = target else {
                return Err(ctx.trap(
                    TrapKind::TypeAssertion,
                    "character assignment outside a string variable",
                ));
            };
            let idx = key_index(ctx, &key)?;
            let len = ctx.slot_str(slot)?.chars().count();
            if idx >= len {
                return Err(ctx.trap(
                    TrapKind::IndexOutOfRange,
                    format!("index {idx} out of range [0..{len})"),
                ));
            }
            target = Target::StrChar(slot, idx);
            continue;
        }
        let container = read_target(ctx, &target)?;
        target = element_target(ctx, container, &key)?;
    }
    Ok(target)
}

/// Current value of a target.
pub(crate) fn read_target(ctx: &Context, target: &Target) -> Result<Value, RuntimeError> {
    match target {
        Target::IntSlot(slot) => Ok(Value::Int(*ctx.slot_int(*slot)?)),
        Target::FloatSlot(slot) => Ok(Value::Float(*ctx.slot_float(*slot)?)),
        Target::StrSlot(slot) => Ok(Value::Str(ctx.slot_str(*slot)?.clone())),
        Target::AnySlot(slot) => Ok(ctx.slot_any(*slot)?.clone()),
        Target::ArrElem(a, idx) => a.read().get(*idx).cloned().ok_or_else(|| {
            ctx.trap(TrapKind::IndexOutOfRange, format!("index {idx} out of range"))
        }),
        Target::MapElem(m, k) => m.read().get(k).cloned().ok_or_else(|| {
            ctx.trap(TrapKind::IndexOutOfRange, format!("undefined map key {k:?}"))
        }),
        Target::BufElem(b, idx) => b.read().get(*idx).map(|v| Value::Int(*v as i64)).ok_or_else(
            || ctx.trap(TrapKind::IndexOutOfRange, format!("index {idx} out of range")),
        ),
        Target::SetBit(s, idx) => Ok(Value::Int(value::set_get(s, *idx) as i64)),
        Target::StructField(st, idx) => st.read().fields.get(*idx).cloned().ok_or_else(|| {
            ctx.trap(TrapKind::IndexOutOfRange, format!("field {idx} out of range"))
        }),
        Target::ObjBox(o) => Ok(o.read().clone()),
        Target::StrChar(slot, idx) => {
            let s = ctx.slot_str(*slot)?;
            s.chars()
                .nth(*idx)
                .map(|c| Value::Int(c as i64))
                .ok_or_else(|| ctx.trap(TrapKind::IndexOutOfRange, "string index out of range"))
        }
    }
}

/// Store a value into a target. Buf elements enforce the byte range.
pub(crate) fn write_target(
    ctx: &mut Context,
    target: &Target,
    value: Value,
) -> Result<(), RuntimeError> {
    match target {
        Target::IntSlot(slot) => {
            let v = value
                .as_int()
                .ok_or_else(|| ctx.trap(TrapKind::TypeAssertion, "expected an integer value"))?;
            ctx.slot_int(*slot)?;
            ctx.sint[*slot] = v;
            Ok(())
        }
        Target::FloatSlot(slot) => {
            let v = value
                .as_float()
                .ok_or_else(|| ctx.trap(TrapKind::TypeAssertion, "expected a float value"))?;
            ctx.slot_float(*slot)?;
            ctx.sfloat[*slot] = v;
            Ok(())
        }
        Target::StrSlot(slot) => match value {
            Value::Str(s) => {
                ctx.slot_str(*slot)?;
                ctx.sstr[*slot] = s;
                Ok(())
            }
            _ => Err(ctx.trap(TrapKind::TypeAssertion, "expected a string value")),
        },
        Target::AnySlot(slot) => {
            ctx.slot_any(*slot)?;
            ctx.sany[*slot] = value;
            Ok(())
        }
        Target::ArrElem(a, idx) => match a.write().get_mut(*idx) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(ctx.trap(
                TrapKind::IndexOutOfRange,
                format!("index {idx} out of range"),
            )),
        },
        Target::MapElem(m, k) => {
            m.write().insert(k.clone(), value);
            Ok(())
        }
        Target::BufElem(b, idx) => {
            let v = value
                .as_int()
                .ok_or_else(|| ctx.trap(TrapKind::TypeAssertion, "expected an integer value"))?;
            if !(0..=255).contains(&v) {
                return Err(ctx.trap(
                    TrapKind::ByteRange,
                    format!("{v} does not fit in a byte"),
                ));
            }
            match b.write().get_mut(*idx) {
                Some(byte) => {
                    *byte = v as u8;
                    Ok(())
                }
                None => Err(ctx.trap(
                    TrapKind::IndexOutOfRange,
                    format!("index {idx} out of range"),
                )),
            }
        }
        Target::SetBit(s, idx) => {
            let v = value
                .as_int()
                .ok_or_else(|| ctx.trap(TrapKind::TypeAssertion, "expected an integer value"))?;
            value::set_put(s, *idx, v != 0);
            Ok(())
        }
        Target::StructField(st, idx) => match st.write().fields.get_mut(*idx) {
            Some(field) => {
                *field = value;
                Ok(())
            }
            None => Err(ctx.trap(
                TrapKind::IndexOutOfRange,
                format!("field {idx} out of range"),
            )),
        },
        Target::ObjBox(o) => {
            *o.write() = value;
            Ok(())
        }
        Target::StrChar(slot, idx) => {
            let v = value
                .as_int()
                .ok_or_else(|| ctx.trap(TrapKind::TypeAssertion, "expected a character value"))?;
            let c = char::from_u32(v as u32)
                .ok_or_else(|| ctx.trap(TrapKind::TypeAssertion, "invalid character code"))?;
            ctx.slot_str(*slot)?;
            let s = &ctx.sstr[*slot];
            let replaced: String = s
                .chars()
                .enumerate()
                .map(|(i, old)| if i == *idx { c } else { old })
                .collect();
            ctx.sstr[*slot] = replaced;
            Ok(())
        }
    }
}

/// Integer arithmetic shared by the plain opcodes and the compound
/// assignments, so both surface identical results and traps.
pub(crate) fn int_arith(op: Opcode, a: i64, b: i64) -> Result<i64, RuntimeError> {
    match op {
        Opcode::Add | Opcode::AssignAdd => Ok(a.wrapping_add(b)),
        Opcode::Sub | Opcode::AssignSub => Ok(a.wrapping_sub(b)),
        Opcode::Mul | Opcode::AssignMul => Ok(a.wrapping_mul(b)),
        Opcode::Div | Opcode::AssignDiv => {
            if b == 0 {
                Err(RuntimeError::new(
                    TrapKind::DivideByZero,
                    "division by zero",
                ))
            } else {
                Ok(a.wrapping_div(b))
            }
        }
        Opcode::Mod | Opcode::AssignMod => {
            if b == 0 {
                Err(RuntimeError::new(
                    TrapKind::DivideByZero,
                    "division by zero",
                ))
            } else {
                Ok(a.wrapping_rem(b))
            }
        }
        Opcode::BitOr | Opcode::AssignBitOr => Ok(a | b),
        Opcode::BitXor | Opcode::AssignBitXor => Ok(a ^ b),
        Opcode::BitAnd | Opcode::AssignBitAnd => Ok(a & b),
        Opcode::Lshift | Opcode::AssignLshift => {
            if b < 0 {
                Err(RuntimeError::new(TrapKind::ShiftRange, "negative shift"))
            } else if b >= 64 {
                Ok(0)
            } else {
                Ok(a.wrapping_shl(b as u32))
            }
        }
        Opcode::Rshift | Opcode::AssignRshift => {
            if b < 0 {
                Err(RuntimeError::new(TrapKind::ShiftRange, "negative shift"))
            } else if b >= 64 {
                Ok(if a < 0 { -1 } else { 0 })
            } else {
                Ok(a.wrapping_shr(b as u32))
            }
        }
        _ => Err(RuntimeError::new(
            TrapKind::UnknownInstruction,
            "unsupported integer operation",
        )),
    }
}

/// `SetVar`: resolve the target and apply the selected assignment.
pub(crate) fn set_var(
    ctx: &mut Context,
    shift: u16,
    tag: u16,
    index: u16,
    assign_code: u16,
    levels: &[(u16, u16)],
    delta: i64,
) -> Result<(), RuntimeError> {
    let op = Opcode::from_u16(assign_code).filter(is_assign_op).ok_or_else(|| {
        ctx.trap(
            TrapKind::UnknownInstruction,
            format!("unknown assignment code {assign_code}"),
        )
    })?;
    let value_tag = levels.last().map(|l| l.1).unwrap_or(tag);
    let incoming = if op == Opcode::IncDec {
        None
    } else {
        Some(ctx.value_from_stack(value_tag)?)
    };
    let keys = pop_keys(ctx, levels)?;
    let target = resolve(ctx, shift, tag, index, levels, keys)?;
    apply(ctx, &target, op, value_tag, incoming, delta)
}

fn is_assign_op(op: &Opcode) -> bool {
    (Opcode::AssignPtr as u16..=Opcode::IncDec as u16).contains(&(*op as u16))
}

fn apply(
    ctx: &mut Context,
    target: &Target,
    op: Opcode,
    value_tag: u16,
    incoming: Option<Value>,
    delta: i64,
) -> Result<(), RuntimeError> {
    match op {
        Opcode::Assign | Opcode::AssignPtr => {
            let mut v = incoming.expect("assignment value");
            if op == Opcode::Assign && Storage::of(value_tag) == Storage::Any {
                v = v.deep_copy();
            }
            write_target(ctx, target, v.clone())?;
            ctx.value_to_stack(value_tag, v)
        }
        Opcode::IncDec => {
            let cur = read_target(ctx, target)?
                .as_int()
                .ok_or_else(|| ctx.trap(TrapKind::TypeAssertion, "expected an integer target"))?;
            let next = cur.wrapping_add(delta);
            write_target(ctx, target, Value::Int(next))?;
            ctx.push_int(next)
        }
        _ => {
            let incoming = incoming.expect("assignment value");
            match Storage::of(value_tag) {
                Storage::Int => {
                    let rhs = incoming.as_int().ok_or_else(|| {
                        ctx.trap(TrapKind::TypeAssertion, "expected an integer value")
                    })?;
                    let cur = read_target(ctx, target)?.as_int().ok_or_else(|| {
                        ctx.trap(TrapKind::TypeAssertion, "expected an integer target")
                    })?;
                    let next = int_arith(op, cur, rhs)?;
                    write_target(ctx, target, Value::Int(next))?;
                    ctx.push_int(next)
                }
                Storage::Float => {
                    let rhs = incoming.as_float().ok_or_else(|| {
                        ctx.trap(TrapKind::TypeAssertion, "expected a float value")
                    })?;
                    let cur = read_target(ctx, target)?.as_float().ok_or_else(|| {
                        ctx.trap(TrapKind::TypeAssertion, "expected a float target")
                    })?;
                    let next = match op {
                        Opcode::AssignAdd => cur + rhs,
                        Opcode::AssignSub => cur - rhs,
                        Opcode::AssignMul => cur * rhs,
                        Opcode::AssignDiv => cur / rhs,
                        _ => {
                            return Err(ctx.trap(
                                TrapKind::TypeAssertion,
                                "unsupported float assignment",
                            ))
                        }
                    };
                    write_target(ctx, target, Value::Float(next))?;
                    ctx.push_float(next)
                }
                Storage::Str => {
                    if op != Opcode::AssignAdd {
                        return Err(
                            ctx.trap(TrapKind::TypeAssertion, "unsupported string assignment")
                        );
                    }
                    let rhs = match incoming {
                        Value::Str(s) => s,
                        _ => {
                            return Err(
                                ctx.trap(TrapKind::TypeAssertion, "expected a string value")
                            )
                        }
                    };
                    let cur = match read_target(ctx, target)? {
                        Value::Str(s) => s,
                        _ => {
                            return Err(
                                ctx.trap(TrapKind::TypeAssertion, "expected a string target")
                            )
                        }
                    };
                    let next = cur + &rhs;
                    write_target(ctx, target, Value::Str(next.clone()))?;
                    ctx.push_str(next)
                }
                _ => Err(ctx.trap(
                    TrapKind::TypeAssertion,
                    "unsupported compound assignment target",
                )),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_arith_matches_operator_semantics() {
        assert_eq!(int_arith(Opcode::Add, 6, 7).unwrap(), 13);
        assert_eq!(int_arith(Opcode::AssignAdd, 6, 7).unwrap(), 13);
        assert_eq!(int_arith(Opcode::Lshift, 1, 70).unwrap(), 0);
        assert_eq!(int_arith(Opcode::Rshift, -8, 70).unwrap(), -1);
        assert_eq!(
            int_arith(Opcode::Div, 1, 0).unwrap_err().kind,
            TrapKind::DivideByZero
        );
        assert_eq!(
            int_arith(Opcode::AssignMod, 1, 0).unwrap_err().kind,
            TrapKind::DivideByZero
        );
        assert_eq!(
            int_arith(Opcode::AssignLshift, 1, -1).unwrap_err().kind,
            TrapKind::ShiftRange
        );
    }
}
