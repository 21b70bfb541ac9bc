//! Host-embed table and the standard set shipped with the core.
//!
//! The full standard library lives outside this crate; the set here is what
//! the execution core itself needs (exit, the context map, spawn joining)
//! plus enough conversions to exercise the calling contract.

use std::time::Duration;

use tarn_core::embed::{table_checksum, EmbedSig};
use tarn_core::types::{TYPE_ARR, TYPE_BOOL, TYPE_INT, TYPE_NONE, TYPE_STR};
use tarn_core::Value;

use crate::context::Context;
use crate::error::{RuntimeError, TrapKind};

/// A host function: consumes its declared parameters, may return a value of
/// the declared type, may fail with a message. `runtime` embeds use the
/// context handle; the rest ignore it.
pub type EmbedFn = fn(&mut Context, Vec<Value>) -> Result<Option<Value>, RuntimeError>;

/// A custom embed supplied through settings, appended after the standard set.
pub struct CustomEmbed {
    pub sig: EmbedSig,
    pub func: EmbedFn,
}

pub struct EmbedTable {
    sigs: Vec<EmbedSig>,
    funcs: Vec<EmbedFn>,
    stdlib_len: usize,
}

impl EmbedTable {
    /// The standard set, IDs in declaration order.
    pub fn standard() -> Self {
        Self::with_custom(Vec::new())
    }

    pub fn with_custom(custom: Vec<CustomEmbed>) -> Self {
        let mut sigs: Vec<EmbedSig> = Vec::new();
        let mut funcs: Vec<EmbedFn> = Vec::new();
        let mut declare = |sig: EmbedSig, func: EmbedFn| {
            sigs.push(sig);
            funcs.push(func);
        };
        declare(sig("str", vec![TYPE_INT], TYPE_STR, false, false), em_str);
        declare(sig("int", vec![TYPE_STR], TYPE_INT, false, true), em_int);
        declare(sig("exit", vec![TYPE_INT], TYPE_NONE, false, true), em_exit);
        declare(sig("print", vec![TYPE_STR], TYPE_NONE, true, false), em_print);
        declare(
            sig("ctxset", vec![TYPE_STR, TYPE_STR], TYPE_NONE, true, false),
            em_ctxset,
        );
        declare(sig("ctxget", vec![TYPE_STR], TYPE_STR, true, false), em_ctxget);
        declare(sig("ctxis", vec![TYPE_STR], TYPE_BOOL, true, false), em_ctxis);
        declare(sig("wait", vec![TYPE_INT], TYPE_NONE, true, true), em_wait);
        declare(sig("sleep", vec![TYPE_INT], TYPE_NONE, true, false), em_sleep);
        declare(sig("args", vec![], TYPE_ARR, true, false), em_args);
        declare(sig("readstr", vec![], TYPE_STR, true, false), em_readstr);
        declare(
            EmbedSig {
                name: "concat",
                pars: vec![],
                ret: TYPE_STR,
                variadic: true,
                runtime: false,
                can_error: false,
            },
            em_concat,
        );
        let stdlib_len = sigs.len();
        for c in custom {
            sigs.push(c.sig);
            funcs.push(c.func);
        }
        Self {
            sigs,
            funcs,
            stdlib_len,
        }
    }

    pub fn crc_stdlib(&self) -> u64 {
        table_checksum(&self.sigs[..self.stdlib_len])
    }

    /// Zero when no custom embeds are installed.
    pub fn crc_custom(&self) -> u64 {
        if self.sigs.len() == self.stdlib_len {
            0
        } else {
            table_checksum(&self.sigs[self.stdlib_len..])
        }
    }

    pub fn sig(&self, id: u16) -> Option<&EmbedSig> {
        self.sigs.get(id as usize)
    }

    pub fn func(&self, id: u16) -> Option<EmbedFn> {
        self.funcs.get(id as usize).copied()
    }

    pub fn find(&self, name: &str) -> Option<u16> {
        self.sigs.iter().position(|s| s.name == name).map(|i| i as u16)
    }
}

fn sig(name: &'static str, pars: Vec<u16>, ret: u16, runtime: bool, can_error: bool) -> EmbedSig {
    EmbedSig {
        name,
        pars,
        ret,
        variadic: false,
        runtime,
        can_error,
    }
}

/// Pop declared parameters, invoke the host function and push its result.
/// The variadic tail, when present, arrives as one trailing arr value.
pub(crate) fn call_embed(
    ctx: &mut Context,
    id: u16,
    tail: Option<Vec<Value>>,
) -> Result<(), RuntimeError> {
    let (pars, ret, func) = {
        let sig = ctx.vm.embeds.sig(id).ok_or_else(|| {
            RuntimeError::new(TrapKind::UnknownInstruction, format!("unknown embed {id}"))
        })?;
        (
            sig.pars.clone(),
            sig.ret,
            ctx.vm.embeds.func(id).expect("embed function"),
        )
    };
    let mut args = Vec::with_capacity(pars.len() + 1);
    for tag in pars.iter().rev() {
        args.push(ctx.value_from_stack(*tag)?);
    }
    args.reverse();
    if let Some(tail) = tail {
        args.push(Value::arr(tail));
    }
    match func(ctx, args)? {
        Some(v) => ctx.value_to_stack(ret, v),
        None => Ok(()),
    }
}

fn arg_int(args: &[Value], i: usize) -> Result<i64, RuntimeError> {
    args.get(i).and_then(Value::as_int).ok_or_else(|| {
        RuntimeError::new(TrapKind::Embed, format!("argument {i} must be an integer"))
    })
}

fn arg_str(args: &[Value], i: usize) -> Result<&str, RuntimeError> {
    args.get(i).and_then(Value::as_str).ok_or_else(|| {
        RuntimeError::new(TrapKind::Embed, format!("argument {i} must be a string"))
    })
}

fn em_str(_ctx: &mut Context, args: Vec<Value>) -> Result<Option<Value>, RuntimeError> {
    Ok(Some(Value::Str(arg_int(&args, 0)?.to_string())))
}

fn em_int(_ctx: &mut Context, args: Vec<Value>) -> Result<Option<Value>, RuntimeError> {
    let s = arg_str(&args, 0)?;
    let v = s.trim().parse::<i64>().map_err(|_| {
        RuntimeError::new(TrapKind::Embed, format!("invalid integer {s:?}"))
    })?;
    Ok(Some(Value::Int(v)))
}

fn em_exit(_ctx: &mut Context, args: Vec<Value>) -> Result<Option<Value>, RuntimeError> {
    Err(RuntimeError::exit(arg_int(&args, 0)?))
}

fn em_print(ctx: &mut Context, args: Vec<Value>) -> Result<Option<Value>, RuntimeError> {
    let s = arg_str(&args, 0)?;
    ctx.vm.io.lock().write_out(s.as_bytes());
    Ok(None)
}

fn em_ctxset(ctx: &mut Context, args: Vec<Value>) -> Result<Option<Value>, RuntimeError> {
    let key = arg_str(&args, 0)?.to_string();
    let value = arg_str(&args, 1)?.to_string();
    ctx.vm.context.write().insert(key, value);
    Ok(None)
}

fn em_ctxget(ctx: &mut Context, args: Vec<Value>) -> Result<Option<Value>, RuntimeError> {
    let key = arg_str(&args, 0)?;
    let value = ctx.vm.context.read().get(key).cloned().unwrap_or_default();
    Ok(Some(Value::Str(value)))
}

fn em_ctxis(ctx: &mut Context, args: Vec<Value>) -> Result<Option<Value>, RuntimeError> {
    let key = arg_str(&args, 0)?;
    let found = ctx.vm.context.read().contains_key(key);
    Ok(Some(Value::Int(found as i64)))
}

/// Join a spawned context: block until it posts completion.
fn em_wait(ctx: &mut Context, args: Vec<Value>) -> Result<Option<Value>, RuntimeError> {
    let tid = arg_int(&args, 0)?;
    {
        let mut threads = ctx.vm.threads.lock();
        match threads.entries.get_mut(&tid) {
            None => {
                return Err(RuntimeError::new(
                    TrapKind::Embed,
                    format!("unknown thread {tid}"),
                ))
            }
            Some(entry) if entry.finished => return Ok(None),
            Some(entry) => entry.waiters.push(ctx.wake_tx.clone()),
        }
    }
    loop {
        if ctx.vm.closed() {
            return Err(RuntimeError::new(TrapKind::Terminated, "execution terminated"));
        }
        match ctx.wake_rx.recv_timeout(Duration::from_millis(10)) {
            Ok(id) if id == tid => return Ok(None),
            Ok(_) => {}
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                return Err(RuntimeError::new(TrapKind::Embed, "wake channel closed"))
            }
        }
    }
}

fn em_sleep(ctx: &mut Context, args: Vec<Value>) -> Result<Option<Value>, RuntimeError> {
    let total = arg_int(&args, 0)?.max(0) as u64;
    let mut left = total;
    while left > 0 {
        if ctx.vm.closed() {
            return Err(RuntimeError::new(TrapKind::Terminated, "execution terminated"));
        }
        let chunk = left.min(10);
        std::thread::sleep(Duration::from_millis(chunk));
        left -= chunk;
        ctx.vm.report_progress(total - left, total);
    }
    Ok(None)
}

/// Variadic: stringify and join every trailing argument.
fn em_concat(_ctx: &mut Context, args: Vec<Value>) -> Result<Option<Value>, RuntimeError> {
    let mut out = String::new();
    if let Some(Value::Arr(tail)) = args.last() {
        for v in tail.read().iter() {
            out.push_str(&v.to_string());
        }
    }
    Ok(Some(Value::Str(out)))
}

fn em_args(ctx: &mut Context, _args: Vec<Value>) -> Result<Option<Value>, RuntimeError> {
    let items = ctx
        .vm
        .cmd_line
        .iter()
        .map(|s| Value::Str(s.clone()))
        .collect();
    Ok(Some(Value::arr(items)))
}

/// Drain standard input: the pre-supplied buffer first, then the stream
/// override. Without either the result is empty; the process stream is never
/// touched.
fn em_readstr(ctx: &mut Context, _args: Vec<Value>) -> Result<Option<Value>, RuntimeError> {
    use std::io::Read;

    let mut io = ctx.vm.io.lock();
    let mut buf = String::new();
    let read = if let Some(input) = &mut io.input {
        input.read_to_string(&mut buf)
    } else if let Some(stdin) = &mut io.stdin {
        stdin.read_to_string(&mut buf)
    } else {
        Ok(0)
    };
    read.map_err(|e| RuntimeError::new(TrapKind::Embed, format!("stdin read failed: {e}")))?;
    Ok(Some(Value::Str(buf)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_table_is_consistent() {
        let t = EmbedTable::standard();
        assert_eq!(t.crc_custom(), 0);
        assert_ne!(t.crc_stdlib(), 0);
        let id = t.find("str").unwrap();
        assert_eq!(t.sig(id).unwrap().ret, TYPE_STR);
        assert!(t.func(id).is_some());
        assert!(t.find("nonexistent").is_none());
    }

    #[test]
    fn custom_embeds_change_only_custom_crc() {
        fn noop(_: &mut Context, _: Vec<Value>) -> Result<Option<Value>, RuntimeError> {
            Ok(None)
        }
        let plain = EmbedTable::standard();
        let custom = EmbedTable::with_custom(vec![CustomEmbed {
            sig: EmbedSig {
                name: "custom",
                pars: vec![TYPE_INT],
                ret: TYPE_NONE,
                variadic: false,
                runtime: false,
                can_error: false,
            },
            func: noop,
        }]);
        assert_eq!(plain.crc_stdlib(), custom.crc_stdlib());
        assert_ne!(custom.crc_custom(), 0);
        assert_eq!(custom.find("custom"), Some(plain.sigs.len() as u16));
    }
}
