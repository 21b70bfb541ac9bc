//! Signal port, I/O overrides, constant initialization and custom embeds.

use std::io::Write;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tarn_core::embed::EmbedSig;
use tarn_core::opcode::{Opcode, BL_BREAK, BL_CONTINUE};
use tarn_core::types::{TYPE_INT, TYPE_NONE, TYPE_STR};
use tarn_core::{Image, ImageBuilder, Value};
use tarn_vm::{run, CustomEmbed, EmbedTable, Settings, SysSignal, TrapKind};

fn stamped(mut b: ImageBuilder) -> Image {
    b.stamp(EmbedTable::standard().crc_stdlib(), 0);
    b.finish()
}

fn push32(b: &mut ImageBuilder, v: i32) {
    b.emit(Opcode::Push32, 0);
    b.word(v);
}

fn endless_loop() -> ImageBuilder {
    let mut b = ImageBuilder::new();
    let iv = b.emit(Opcode::InitVars, BL_BREAK | BL_CONTINUE);
    let break_at = b.word(0);
    let continue_at = b.word(0);
    let head = b.here();
    b.patch(continue_at, head - iv);
    b.emit(Opcode::Cycle, 0);
    let back = b.emit(Opcode::Jmp, 0);
    b.word(head - back);
    let after = b.here();
    b.patch(break_at, after - iv);
    b.emit(Opcode::DelVars, 0);
    b.emit(Opcode::Ret, TYPE_NONE);
    b
}

#[test]
fn terminate_signal_stops_the_run() {
    let (tx, rx) = mpsc::channel();
    tx.send(SysSignal::Terminate).unwrap();
    let settings = Settings {
        cycle: u64::MAX,
        sys: Some(rx),
        ..Default::default()
    };
    let err = run(stamped(endless_loop()), settings).unwrap_err();
    assert_eq!(err.kind, TrapKind::Terminated);
    drop(tx);
}

#[test]
fn suspended_run_finishes_after_resume() {
    let (tx, rx) = mpsc::channel();
    tx.send(SysSignal::Suspend).unwrap();
    let resumer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        let _ = tx.send(SysSignal::Resume);
        let _ = tx.send(SysSignal::Close);
    });
    let mut b = ImageBuilder::new();
    push32(&mut b, 1);
    b.emit(Opcode::Ret, TYPE_INT);
    let settings = Settings {
        sys: Some(rx),
        ..Default::default()
    };
    match run(stamped(b), settings).unwrap() {
        Some(Value::Int(v)) => assert_eq!(v, 1),
        other => panic!("expected an int result, got {other:?}"),
    }
    resumer.join().unwrap();
}

#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[test]
fn print_writes_through_the_stdout_override() {
    let table = EmbedTable::standard();
    let out = SharedBuf::default();
    let mut b = ImageBuilder::new();
    let hello = b.intern("hello");
    b.emit(Opcode::PushStr, hello);
    b.emit(Opcode::Embed, table.find("print").unwrap());
    b.emit(Opcode::Ret, TYPE_NONE);
    let settings = Settings {
        stdout: Some(Box::new(out.clone())),
        ..Default::default()
    };
    run(stamped(b), settings).unwrap();
    assert_eq!(&*out.0.lock().unwrap(), b"hello");
}

#[test]
fn well_known_and_evaluated_constants() {
    let mut b = ImageBuilder::new();
    b.path("demo.tarn");
    b.init_const(100); // iota base
    b.init_const(101); // depth limit
    b.init_const(102); // cycle limit
    b.init_const(103); // script path
    b.init_const(110); // evaluated initializer
    b.emit(Opcode::ConstById, 0);
    b.word(110);
    b.emit(Opcode::ConstById, 0);
    b.word(101);
    b.emit(Opcode::Add, 0);
    b.emit(Opcode::Ret, TYPE_INT);
    b.func(110);
    push32(&mut b, 12);
    b.emit(Opcode::Ret, TYPE_INT);

    let settings = Settings {
        depth: 77,
        ..Default::default()
    };
    match run(stamped(b), settings).unwrap() {
        Some(Value::Int(v)) => assert_eq!(v, 12 + 77),
        other => panic!("expected an int result, got {other:?}"),
    }
}

#[test]
fn failing_initializer_aborts_before_entry() {
    let table = EmbedTable::standard();
    let mut b = ImageBuilder::new();
    b.init_const(100);
    b.init_const(110);
    // entry would exit(3); it must never run
    push32(&mut b, 3);
    b.emit(Opcode::Embed, table.find("exit").unwrap());
    b.emit(Opcode::End, 0);
    b.func(110);
    push32(&mut b, 1);
    push32(&mut b, 0);
    b.emit(Opcode::Div, 0);
    b.emit(Opcode::Ret, TYPE_INT);

    let err = run(stamped(b), Settings::default()).unwrap_err();
    assert_eq!(err.kind, TrapKind::DivideByZero);
}

fn em_double(
    _ctx: &mut tarn_vm::Context,
    args: Vec<Value>,
) -> Result<Option<Value>, tarn_vm::RuntimeError> {
    let v = args[0].as_int().unwrap_or(0);
    Ok(Some(Value::Int(v * 2)))
}

fn double_embed() -> CustomEmbed {
    CustomEmbed {
        sig: EmbedSig {
            name: "double",
            pars: vec![TYPE_INT],
            ret: TYPE_INT,
            variadic: false,
            runtime: false,
            can_error: false,
        },
        func: em_double,
    }
}

#[test]
fn custom_embed_called_by_id() {
    let table = EmbedTable::with_custom(vec![double_embed()]);
    let mut b = ImageBuilder::new();
    push32(&mut b, 21);
    b.emit(Opcode::Embed, table.find("double").unwrap());
    b.emit(Opcode::Ret, TYPE_INT);
    b.stamp(table.crc_stdlib(), table.crc_custom());

    let settings = Settings {
        custom: vec![double_embed()],
        ..Default::default()
    };
    match run(b.finish(), settings).unwrap() {
        Some(Value::Int(v)) => assert_eq!(v, 42),
        other => panic!("expected an int result, got {other:?}"),
    }
}

#[test]
fn nonzero_custom_checksum_must_match() {
    let mut b = ImageBuilder::new();
    push32(&mut b, 1);
    b.emit(Opcode::Ret, TYPE_INT);
    b.stamp(EmbedTable::standard().crc_stdlib(), 0xbad);
    let err = run(b.finish(), Settings::default()).unwrap_err();
    assert_eq!(err.kind, TrapKind::CrcMismatch);
}

#[test]
fn string_args_embed_reports_command_line() {
    let table = EmbedTable::standard();
    let mut b = ImageBuilder::new();
    b.emit(Opcode::Embed, table.find("args").unwrap());
    b.emit(Opcode::Len, tarn_core::types::TYPE_ARR);
    b.emit(Opcode::Ret, TYPE_INT);
    let settings = Settings {
        cmd_line: vec!["one".into(), "two".into()],
        ..Default::default()
    };
    match run(stamped(b), settings).unwrap() {
        Some(Value::Int(v)) => assert_eq!(v, 2),
        other => panic!("expected an int result, got {other:?}"),
    }
}

#[test]
fn sleep_embed_returns() {
    let table = EmbedTable::standard();
    let mut b = ImageBuilder::new();
    push32(&mut b, 15);
    b.emit(Opcode::Embed, table.find("sleep").unwrap());
    push32(&mut b, 1);
    b.emit(Opcode::Ret, TYPE_INT);
    match run(stamped(b), Settings::default()).unwrap() {
        Some(Value::Int(v)) => assert_eq!(v, 1),
        other => panic!("expected an int result, got {other:?}"),
    }
}

#[test]
fn readstr_drains_the_supplied_input() {
    let table = EmbedTable::standard();
    let mut b = ImageBuilder::new();
    b.emit(Opcode::Embed, table.find("readstr").unwrap());
    b.emit(Opcode::Ret, TYPE_STR);
    let settings = Settings {
        input: Some(b"from-buffer".to_vec()),
        ..Default::default()
    };
    match run(stamped(b), settings).unwrap() {
        Some(Value::Str(s)) => assert_eq!(s, "from-buffer"),
        other => panic!("expected a string result, got {other:?}"),
    }
}

#[test]
fn variadic_embed_collects_its_tail() {
    let table = EmbedTable::standard();
    let mut b = ImageBuilder::new();
    push32(&mut b, 4);
    let x = b.intern("x");
    b.emit(Opcode::PushStr, x);
    b.emit(Opcode::Embed, table.find("concat").unwrap());
    b.word(2);
    b.word(TYPE_INT as i32);
    b.word(TYPE_STR as i32);
    b.emit(Opcode::Ret, TYPE_STR);
    match run(stamped(b), Settings::default()).unwrap() {
        Some(Value::Str(s)) => assert_eq!(s, "4x"),
        other => panic!("expected a string result, got {other:?}"),
    }
}

#[test]
fn sleep_reports_progress() {
    use std::sync::atomic::{AtomicUsize, Ordering};

    let table = EmbedTable::standard();
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    let mut b = ImageBuilder::new();
    push32(&mut b, 25);
    b.emit(Opcode::Embed, table.find("sleep").unwrap());
    b.emit(Opcode::Ret, TYPE_NONE);
    let settings = Settings {
        progress: Some(Box::new(move |done, total| {
            assert!(done <= total);
            seen.fetch_add(1, Ordering::SeqCst);
        })),
        ..Default::default()
    };
    run(stamped(b), settings).unwrap();
    assert!(calls.load(Ordering::SeqCst) >= 1);
}

fn em_charge(
    ctx: &mut tarn_vm::Context,
    args: Vec<Value>,
) -> Result<Option<Value>, tarn_vm::RuntimeError> {
    let path = args[0].as_str().unwrap_or_default().to_string();
    let delta = args[1].as_int().unwrap_or(0);
    let ok = ctx
        .vm
        .playground
        .as_ref()
        .map(|p| p.charge(&path, delta))
        .unwrap_or(true);
    Ok(Some(Value::Int(ok as i64)))
}

fn charge_embed() -> CustomEmbed {
    CustomEmbed {
        sig: EmbedSig {
            name: "charge",
            pars: vec![TYPE_STR, TYPE_INT],
            ret: tarn_core::types::TYPE_BOOL,
            variadic: false,
            runtime: true,
            can_error: false,
        },
        func: em_charge,
    }
}

#[test]
fn playground_quota_rejects_oversized_writes() {
    let table = EmbedTable::with_custom(vec![charge_embed()]);
    let mut b = ImageBuilder::new();
    let file = b.intern("out.txt");
    // first charge fits, the second exceeds the quota
    b.emit(Opcode::PushStr, file);
    push32(&mut b, 60);
    b.emit(Opcode::Embed, table.find("charge").unwrap());
    b.emit(Opcode::PushStr, file);
    push32(&mut b, 60);
    b.emit(Opcode::Embed, table.find("charge").unwrap());
    // ok1 + 10 * ok2
    push32(&mut b, 10);
    b.emit(Opcode::Mul, 0);
    b.emit(Opcode::Add, 0);
    b.emit(Opcode::Ret, TYPE_INT);
    b.stamp(table.crc_stdlib(), table.crc_custom());

    let settings = Settings {
        custom: vec![charge_embed()],
        playground: Some(tarn_vm::PlaygroundLimits {
            size_limit: 100,
            files_limit: 4,
        }),
        ..Default::default()
    };
    match run(b.finish(), settings).unwrap() {
        Some(Value::Int(v)) => assert_eq!(v, 1, "first accepted, second rejected"),
        other => panic!("expected an int result, got {other:?}"),
    }
}

#[test]
fn string_literal_round_trip() {
    let mut b = ImageBuilder::new();
    let s = b.intern("guard");
    b.emit(Opcode::PushStr, s);
    b.emit(Opcode::Ret, TYPE_STR);
    match run(stamped(b), Settings::default()).unwrap() {
        Some(Value::Str(v)) => assert_eq!(v, "guard"),
        other => panic!("expected a string result, got {other:?}"),
    }
}
