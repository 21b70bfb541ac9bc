//! Typed-stack virtual machine executing tarn bytecode images.
//!
//! The entry point is [`vm::run`]: it validates the image against the host's
//! embed set, materializes constants, runs the root execution context at
//! offset 0 and reaps every context the program spawned. Each context runs
//! on its own OS thread over four typed value stacks and a unified
//! call/block frame stack; shared state is limited to the image, the
//! constants table, the program-visible context map and the VM control
//! flags.

pub mod context;
mod dispatch;
pub mod embed;
pub mod error;
mod exec;
pub mod vm;

pub use context::{Context, Frame};
pub use embed::{CustomEmbed, EmbedFn, EmbedTable};
pub use error::{RuntimeError, SourcePos, TrapKind};
pub use vm::types::{
    Param, PlaygroundLimits, ProgressFn, Settings, SysSignal, CYCLE_LIMIT, DEPTH_LIMIT, STACK_SIZE,
};
pub use vm::{run, Vm, VmHandles};
