//! IA-32 processor core: architectural state, segmentation, exception and
//! interrupt delivery, and an interpreter for the 32-bit integer instruction
//! set.
//!
//! A [`Vcpu`] owns its memory bus and port space. The host drives it with
//! [`Vcpu::step`] / [`Vcpu::run`] and feeds it interrupts either directly
//! ([`Vcpu::raise_irq`]), through a cloneable [`IrqLines`] handle from another
//! thread, or by polling an [`InterruptController`].

#![forbid(unsafe_code)]

mod exception;
mod interp;
mod interrupts;
mod io;
mod irq;
mod memory;
pub mod segmentation;
pub mod state;
mod time;
mod vcpu;

pub use exception::{Exception, Fault, InternalError};
pub use interrupts::{InterruptSource, PendingEventState};
pub use io::{NullPorts, PortIo};
pub use irq::{InterruptController, IrqLines};
pub use segmentation::Descriptor;
pub use state::{CpuContext, CpuMode, CpuState, MsrState, Segment, TableRegister};
pub use time::{Deadline, TimeSource};
pub use vcpu::{CpuConfig, RunSummary, StepOutcome, Vcpu};
