//! Aggregate construction, rvalue indexing and length.

use indexmap::IndexMap;

use tarn_core::types::{self, Storage};
use tarn_core::value::{self, StructValue};
use tarn_core::Value;

use crate::context::Context;
use crate::error::{RuntimeError, TrapKind};
use crate::exec::assign::{pop_keys, IndexKey};

/// `InitObj`: build an aggregate from `count` stack entries.
pub(crate) fn init_obj(
    ctx: &mut Context,
    count: usize,
    obj_tag: u16,
    elem_tag: u16,
) -> Result<(), RuntimeError> {
    let built = match obj_tag {
        types::TYPE_ARR => {
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                items.push(ctx.value_from_stack(elem_tag)?);
            }
            items.reverse();
            Value::arr(items)
        }
        types::TYPE_MAP => {
            let mut entries = Vec::with_capacity(count);
            for _ in 0..count {
                let v = ctx.value_from_stack(elem_tag)?;
                let k = ctx.pop_str()?;
                entries.push((k, v));
            }
            let mut map = IndexMap::with_capacity(count);
            for (k, v) in entries.into_iter().rev() {
                map.insert(k, v);
            }
            Value::map(map)
        }
        types::TYPE_BUF => {
            let mut bytes = Vec::with_capacity(count);
            for _ in 0..count {
                let v = ctx.pop_int()?;
                if !(0..=255).contains(&v) {
                    return Err(ctx.trap(
                        TrapKind::ByteRange,
                        format!("{v} does not fit in a byte"),
                    ));
                }
                bytes.push(v as u8);
            }
            bytes.reverse();
            Value::buf(bytes)
        }
        types::TYPE_SET => {
            let set = Value::set(Vec::new());
            if let Value::Set(handle) = &set {
                for _ in 0..count {
                    let bit = ctx.pop_int()?;
                    if bit < 0 {
                        return Err(ctx.trap(
                            TrapKind::IndexOutOfRange,
                            format!("negative set element {bit}"),
                        ));
                    }
                    value::set_put(handle, bit as usize, true);
                }
            }
            set
        }
        types::TYPE_STRUCT => {
            let def = ctx
                .image
                .structs
                .get(elem_tag as usize)
                .ok_or_else(|| {
                    ctx.trap(
                        TrapKind::TypeAssertion,
                        format!("unknown struct descriptor {elem_tag}"),
                    )
                })?
                .clone();
            let mut fields = Vec::with_capacity(def.fields.len());
            for tag in def.fields.iter().rev() {
                fields.push(ctx.value_from_stack(*tag)?);
            }
            fields.reverse();
            Value::Struct(std::sync::Arc::new(parking_lot::RwLock::new(StructValue {
                def: elem_tag,
                fields,
            })))
        }
        types::TYPE_OBJ => Value::obj(ctx.value_from_stack(elem_tag)?),
        other => {
            return Err(ctx.trap(
                TrapKind::TypeAssertion,
                format!("cannot construct object of tag {other:#x}"),
            ))
        }
    };
    ctx.push_any(built)
}

/// `Index`: pop a container and apply one or more indexing levels.
pub(crate) fn index_op(ctx: &mut Context, levels: &[(u16, u16)]) -> Result<(), RuntimeError> {
    let keys = pop_keys(ctx, levels)?;
    let first = levels.first().expect("index levels");
    let mut current = match Storage::of(first.0) {
        Storage::Str => Value::Str(ctx.pop_str()?),
        Storage::Any => ctx.pop_any()?,
        _ => {
            return Err(ctx.trap(
                TrapKind::TypeAssertion,
                format!("cannot index into tag {:#x}", first.0),
            ))
        }
    };
    for key in &keys {
        current = index_value(ctx, current, key)?;
    }
    let result_tag = levels.last().expect("index levels").1;
    ctx.value_to_stack(result_tag, current)
}

/// One indexing step on a value.
pub(crate) fn index_value(
    ctx: &Context,
    container: Value,
    key: &IndexKey,
) -> Result<Value, RuntimeError> {
    let int_key = |ctx: &Context| -> Result<usize, RuntimeError> {
        match key {
            IndexKey::Int(v) if *v >= 0 => Ok(*v as usize),
            IndexKey::Int(v) => Err(ctx.trap(
                TrapKind::IndexOutOfRange,
                format!("negative index {v}"),
            )),
            IndexKey::Str(_) => {
                Err(ctx.trap(TrapKind::TypeAssertion, "expected an integer index"))
            }
        }
    };
    match container {
        Value::Arr(a) => {
            let idx = int_key(ctx)?;
            let items = a.read();
            match items.get(idx) {
                Some(v) => Ok(v.clone()),
                None => Err(ctx.trap(
                    TrapKind::IndexOutOfRange,
                    format!("index {idx} out of range [0..{})", items.len()),
                )),
            }
        }
        Value::Map(m) => match key {
            IndexKey::Str(k) => m.read().get(k).cloned().ok_or_else(|| {
                ctx.trap(TrapKind::IndexOutOfRange, format!("undefined map key {k:?}"))
            }),
            IndexKey::Int(_) => Err(ctx.trap(TrapKind::TypeAssertion, "expected a string key")),
        },
        Value::Buf(b) => {
            let idx = int_key(ctx)?;
            b.read().get(idx).map(|v| Value::Int(*v as i64)).ok_or_else(|| {
                ctx.trap(TrapKind::IndexOutOfRange, format!("index {idx} out of range"))
            })
        }
        Value::Set(s) => {
            let idx = int_key(ctx)?;
            Ok(Value::Int(value::set_get(&s, idx) as i64))
        }
        Value::Str(s) => {
            let idx = int_key(ctx)?;
            s.chars()
                .nth(idx)
                .map(|c| Value::Int(c as i64))
                .ok_or_else(|| {
                    ctx.trap(TrapKind::IndexOutOfRange, format!("index {idx} out of range"))
                })
        }
        Value::Range { from, to } => {
            let idx = int_key(ctx)? as i64;
            let span = (to - from).abs();
            if idx >= span {
                return Err(ctx.trap(
                    TrapKind::IndexOutOfRange,
                    format!("index {idx} out of range [0..{span})"),
                ));
            }
            Ok(Value::Int(if from <= to { from + idx } else { from - idx }))
        }
        Value::Struct(st) => {
            let idx = int_key(ctx)?;
            st.read().fields.get(idx).cloned().ok_or_else(|| {
                ctx.trap(TrapKind::IndexOutOfRange, format!("field {idx} out of range"))
            })
        }
        Value::Obj(o) => {
            let inner = o.read().clone();
            index_value(ctx, inner, key)
        }
        other => Err(ctx.trap(
            TrapKind::TypeAssertion,
            format!("cannot index into {other}"),
        )),
    }
}

/// `Len`: pop a container of `tag` and push its length.
pub(crate) fn len_op(ctx: &mut Context, tag: u16) -> Result<(), RuntimeError> {
    let len = match Storage::of(tag) {
        Storage::Str => {
            let s = ctx.pop_str()?;
            s.chars().count()
        }
        Storage::Any => {
            let v = ctx.pop_any()?;
            v.len().ok_or_else(|| {
                ctx.trap(TrapKind::TypeAssertion, format!("{v} has no length"))
            })?
        }
        _ => {
            return Err(ctx.trap(
                TrapKind::TypeAssertion,
                format!("tag {tag:#x} has no length"),
            ))
        }
    };
    ctx.push_int(len as i64)
}
