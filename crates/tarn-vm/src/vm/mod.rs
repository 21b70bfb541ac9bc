//! VM-wide state and the host entry point.
//!
//! `run` checks the image's embed checksums, materializes the constants
//! table, starts the completion reaper and the optional signal listener,
//! executes the root context at offset 0 on the calling thread, then drains
//! child outcomes until every spawned context is reaped.

pub mod types;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use tarn_core::types::{TYPE_INT, TYPE_STR};
use tarn_core::{Image, Value};

use crate::context::Context;
use crate::embed::EmbedTable;
use crate::error::{RuntimeError, TrapKind};
use types::{
    Const, Param, PlaygroundFs, ProgressFn, Settings, SysSignal, ThreadEntry, ThreadTable, VmIo,
    CONST_CYCLE, CONST_DEPTH, CONST_SCRIPT, CYCLE_LIMIT, DEPTH_LIMIT, FLAG_CLOSED, FLAG_STOPPED,
};

/// Shared state of one run. Contexts hold it by `Arc`; everything mutable is
/// behind a lock or an atomic.
pub struct Vm {
    pub image: Arc<Image>,
    pub embeds: EmbedTable,
    /// Constants table; read-only once `run` finishes initialization.
    pub consts: RwLock<HashMap<i32, Const>>,
    /// Program-visible key/value area, shared across contexts.
    pub context: RwLock<HashMap<String, String>>,
    /// Combined suspend/terminate bits, polled between instructions.
    pub flags: AtomicU8,
    /// Active spawned-context count, maintained by the reaper.
    pub count: AtomicI64,
    pub threads: Mutex<ThreadTable>,
    pub io: Mutex<VmIo>,
    pub cycle: u64,
    pub depth: u32,
    pub cmd_line: Vec<String>,
    pub playground: Option<PlaygroundFs>,
    pub progress: Option<ProgressFn>,
    count_tx: Mutex<Sender<i64>>,
    err_tx: Mutex<Sender<RuntimeError>>,
    done: AtomicBool,
}

impl Vm {
    pub fn stopped(&self) -> bool {
        self.flags.load(Ordering::Relaxed) & FLAG_STOPPED != 0
    }

    pub fn closed(&self) -> bool {
        self.flags.load(Ordering::Relaxed) & FLAG_CLOSED != 0
    }

    pub fn suspend(&self) {
        self.flags.fetch_or(FLAG_STOPPED, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.flags.fetch_and(!FLAG_STOPPED, Ordering::SeqCst);
    }

    /// Interrupt every running context at its next instruction boundary.
    /// Suspended contexts are released so they can observe termination.
    pub fn close_all(&self) {
        let prev = self
            .flags
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |f| {
                Some((f | FLAG_CLOSED) & !FLAG_STOPPED)
            })
            .unwrap_or(0);
        if prev & FLAG_CLOSED == 0 {
            debug!("terminating all contexts");
        }
    }

    /// Report host-side progress through the settings callback, if any.
    pub fn report_progress(&self, done: u64, total: u64) {
        if let Some(cb) = &self.progress {
            cb(done, total);
        }
    }

    /// Create a context for `funcs[fid]` on its own OS thread, seeded with
    /// the given parameters. Returns the new thread identity.
    pub(crate) fn spawn_context(
        self: &Arc<Self>,
        fid: i32,
        params: Vec<Param>,
    ) -> Result<i64, RuntimeError> {
        let entry = *self.image.funcs.get(&fid).ok_or_else(|| {
            RuntimeError::new(
                TrapKind::UnknownInstruction,
                format!("unknown function {fid}"),
            )
        })? as usize;
        let mut threads = self.threads.lock();
        threads.next_id += 1;
        let tid = threads.next_id;
        threads.entries.insert(tid, ThreadEntry::default());
        self.count.fetch_add(1, Ordering::SeqCst);
        debug!(thread = tid, func = fid, "spawning context");
        let vm = self.clone();
        let handle = thread::spawn(move || {
            let mut ctx = Context::new(vm.clone(), tid);
            let seeded: Result<(), RuntimeError> =
                params.into_iter().try_for_each(|p| match p {
                    Param::Int(v) => ctx.push_int(v),
                    Param::Float(v) => ctx.push_float(v),
                    Param::Str(v) => ctx.push_str(v),
                    Param::Any(v) => ctx.push_any(v),
                });
            let outcome = seeded.and_then(|_| ctx.run(entry).map(|_| ()));
            vm.finish_context(tid, outcome.err());
        });
        threads.handles.push(handle);
        Ok(tid)
    }

    /// Post a context's completion: notify waiters, report the error, bump
    /// the completion channel.
    pub(crate) fn finish_context(&self, tid: i64, err: Option<RuntimeError>) {
        debug!(thread = tid, failed = err.is_some(), "context finished");
        {
            let mut threads = self.threads.lock();
            if let Some(entry) = threads.entries.get_mut(&tid) {
                entry.finished = true;
                for waiter in entry.waiters.drain(..) {
                    let _ = waiter.send(tid);
                }
            }
        }
        if let Some(e) = err {
            let _ = self.err_tx.lock().send(e);
        }
        let _ = self.count_tx.lock().send(1);
    }

    /// Evaluate the image's init sequence into the constants table.
    fn init_consts(self: &Arc<Self>) -> Result<(), RuntimeError> {
        let image = self.image.clone();
        let mut iota_base = 0;
        for (i, &id) in image.init.iter().enumerate() {
            if i == 0 {
                iota_base = id;
                self.consts.write().insert(
                    id,
                    Const {
                        tag: TYPE_INT,
                        value: Value::Int(0),
                    },
                );
                continue;
            }
            let entry = match id - iota_base {
                CONST_DEPTH => {
                    self.consts.write().insert(
                        id,
                        Const {
                            tag: TYPE_INT,
                            value: Value::Int(self.depth as i64),
                        },
                    );
                    continue;
                }
                CONST_CYCLE => {
                    self.consts.write().insert(
                        id,
                        Const {
                            tag: TYPE_INT,
                            value: Value::Int(self.cycle as i64),
                        },
                    );
                    continue;
                }
                CONST_SCRIPT => {
                    self.consts.write().insert(
                        id,
                        Const {
                            tag: TYPE_STR,
                            value: Value::Str(image.path.clone()),
                        },
                    );
                    continue;
                }
                _ => *image.funcs.get(&id).ok_or_else(|| {
                    RuntimeError::new(
                        TrapKind::NoRunEntry,
                        format!("missing initializer for constant {id}"),
                    )
                })?,
            };
            debug!(constant = id, "evaluating initializer");
            let mut ctx = Context::new(self.clone(), 0);
            let (tag, value) = ctx.run(entry as usize)?.ok_or_else(|| {
                RuntimeError::new(
                    TrapKind::TypeAssertion,
                    format!("initializer for constant {id} returned no value"),
                )
            })?;
            self.consts.write().insert(id, Const { tag, value });
        }
        Ok(())
    }
}

/// Receiver ends of the VM's channels, consumed by `run`'s drain loop.
/// Embedders driving a single context directly may ignore them.
pub struct VmHandles {
    pub count_rx: Receiver<i64>,
    pub err_rx: Receiver<RuntimeError>,
    pub sys: Option<Receiver<SysSignal>>,
}

impl Vm {
    /// Validate the image against the host's embed set and assemble the
    /// shared state of one run.
    pub fn assemble(
        image: Image,
        mut settings: Settings,
    ) -> Result<(Arc<Vm>, VmHandles), RuntimeError> {
        if settings.cycle == 0 {
            settings.cycle = CYCLE_LIMIT;
        }
        if settings.depth == 0 {
            settings.depth = DEPTH_LIMIT;
        }
        if image.code.is_empty() {
            return Err(RuntimeError::new(TrapKind::NoRunEntry, "empty image"));
        }

        let embeds = EmbedTable::with_custom(std::mem::take(&mut settings.custom));
        if image.crc_stdlib != embeds.crc_stdlib() {
            return Err(RuntimeError::new(
                TrapKind::CrcMismatch,
                "standard embed set checksum mismatch",
            ));
        }
        if image.crc_custom != 0 && image.crc_custom != embeds.crc_custom() {
            return Err(RuntimeError::new(
                TrapKind::CrcMismatch,
                "custom embed set checksum mismatch",
            ));
        }

        let (count_tx, count_rx) = mpsc::channel();
        let (err_tx, err_rx) = mpsc::channel();
        let sys = settings.sys.take();

        let vm = Arc::new(Vm {
            image: Arc::new(image),
            embeds,
            consts: RwLock::new(HashMap::new()),
            context: RwLock::new(HashMap::new()),
            flags: AtomicU8::new(0),
            count: AtomicI64::new(0),
            threads: Mutex::new(ThreadTable::default()),
            io: Mutex::new(VmIo {
                stdin: settings.stdin.take(),
                stdout: settings.stdout.take(),
                stderr: settings.stderr.take(),
                input: settings.input.take().map(std::io::Cursor::new),
            }),
            cycle: settings.cycle,
            depth: settings.depth,
            cmd_line: std::mem::take(&mut settings.cmd_line),
            playground: settings.playground.map(PlaygroundFs::new),
            progress: settings.progress.take(),
            count_tx: Mutex::new(count_tx),
            err_tx: Mutex::new(err_tx),
            done: AtomicBool::new(false),
        });
        Ok((
            vm,
            VmHandles {
                count_rx,
                err_rx,
                sys,
            },
        ))
    }
}

/// Execute an image. Returns the root context's result value: the integer
/// exit code when the program used the exit mechanism, the value its entry
/// returned, or `None`. A fatal error is returned instead, the root
/// context's own error preferred over children's.
pub fn run(image: Image, settings: Settings) -> Result<Option<Value>, RuntimeError> {
    let (vm, handles) = Vm::assemble(image, settings)?;
    let VmHandles {
        count_rx,
        err_rx,
        sys,
    } = handles;

    vm.init_consts()?;

    let reaper = {
        let vm = vm.clone();
        thread::spawn(move || reap(vm, count_rx))
    };
    let listener = sys.map(|rx| {
        let vm = vm.clone();
        thread::spawn(move || listen(vm, rx))
    });

    debug!("root context started");
    let mut root = Context::new(vm.clone(), 0);
    let (result, mut err) = match root.run(0) {
        Ok(v) => (v.map(|(_, value)| value), None),
        Err(e) => (None, Some(e)),
    };
    if err.is_some() {
        vm.close_all();
    }

    // Drain child outcomes until the reaper has seen every completion.
    while vm.count.load(Ordering::SeqCst) > 0 {
        match err_rx.recv_timeout(Duration::from_millis(5)) {
            Ok(e) => {
                vm.close_all();
                if err.is_none() {
                    err = Some(e);
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    while let Ok(e) = err_rx.try_recv() {
        if err.is_none() {
            err = Some(e);
        }
    }

    vm.done.store(true, Ordering::SeqCst);
    let _ = vm.count_tx.lock().send(0);
    let _ = reaper.join();
    if let Some(listener) = listener {
        let _ = listener.join();
    }
    let handles: Vec<_> = vm.threads.lock().handles.drain(..).collect();
    for handle in handles {
        let _ = handle.join();
    }

    match err {
        Some(e) if e.kind == TrapKind::Exit => Ok(Some(Value::Int(e.code))),
        Some(e) => Err(e),
        None => Ok(result),
    }
}

/// Decrement the active count for every completion message; the zero
/// sentinel ends the loop.
fn reap(vm: Arc<Vm>, count_rx: Receiver<i64>) {
    while let Ok(x) = count_rx.recv() {
        if x == 0 {
            break;
        }
        vm.count.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Map signal-port tokens onto the VM flag bits. The timeout keeps shutdown
/// from hanging on a silent port.
fn listen(vm: Arc<Vm>, rx: Receiver<SysSignal>) {
    loop {
        match rx.recv_timeout(Duration::from_millis(50)) {
            Ok(SysSignal::Close) => break,
            Ok(SysSignal::Suspend) => {
                debug!("suspending contexts");
                vm.suspend();
            }
            Ok(SysSignal::Resume) => {
                debug!("resuming contexts");
                vm.resume();
            }
            Ok(SysSignal::Terminate) => {
                let _ = vm
                    .err_tx
                    .lock()
                    .send(RuntimeError::new(TrapKind::Terminated, "execution terminated"));
                vm.close_all();
            }
            Err(RecvTimeoutError::Timeout) => {
                if vm.done.load(Ordering::SeqCst) {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}
