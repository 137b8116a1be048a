//! The per-processor step loop: interrupt sampling, fetch/decode/execute,
//! fault redirection and the tick counter.

use ember_mmu::{MemoryBus, Mmu};
use ember_x86::{decode, ByteSource, DecodeError, DecodeMode};
use tracing::{debug, trace, warn};

use crate::exception::{CpuResult, Exception, Fault, InternalError};
use crate::interp::Flow;
use crate::interrupts::{InterruptSource, PendingEventState};
use crate::io::{NullPorts, PortIo};
use crate::irq::{InterruptController, IrqLines};
use crate::state::{CpuState, CR0_PE, CR0_PG, DR6_BS, FLAG_IF, FLAG_TF};
use crate::time::TimeSource;

const NMI_VECTOR: u8 = 2;

/// Identity reported by CPUID and left in EDX at reset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuConfig {
    pub vendor: [u8; 12],
    /// Family/model/stepping: CPUID leaf 1 EAX and EDX after reset.
    pub signature: u32,
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self {
            vendor: *b"EmberX86Core",
            signature: 0x0543,
        }
    }
}

/// Result of one [`Vcpu::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// An instruction executed and retired.
    Retired,
    /// An exception was raised and delivered to its handler (or escalated to #DF).
    FaultRaised(u8),
    /// INT n / INT3 / INTO transferred to its handler.
    SoftwareInterrupt(u8),
    /// An external interrupt or NMI was delivered at the step boundary.
    InterruptDelivered(u8),
    /// The processor is halted and nothing woke it.
    Halted,
    /// Triple fault: the processor was reset to its power-on state.
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub steps: u64,
    pub last: Option<StepOutcome>,
}

/// One emulated logical processor together with the memory bus and port
/// space it drives.
pub struct Vcpu<B, P = NullPorts> {
    pub state: CpuState,
    pub pending: PendingEventState,
    pub mmu: Mmu,
    pub time: TimeSource,
    pub bus: B,
    pub ports: P,
    irq: IrqLines,
    pub(crate) config: CpuConfig,
    /// EIP of the instruction being executed; faults report this address.
    pub(crate) inst_eip: u32,
}

/// Instruction bytes fetched lazily through segmentation and paging.
struct CodeFetch<'a, B, P> {
    cpu: &'a mut Vcpu<B, P>,
    eip: u32,
    ip_mask: u32,
}

impl<B: MemoryBus, P: PortIo> ByteSource for CodeFetch<'_, B, P> {
    type Error = Fault;

    fn fetch(&mut self, offset: usize) -> Result<u8, Fault> {
        let ip = self.eip.wrapping_add(offset as u32) & self.ip_mask;
        self.cpu.fetch_code_byte(ip)
    }
}

impl<B: MemoryBus, P: PortIo> Vcpu<B, P> {
    pub fn new(config: CpuConfig, bus: B, ports: P) -> Self {
        let state = CpuState::reset(config.signature);
        let mut mmu = Mmu::new();
        mmu.restore_control_registers(state.cr0, state.cr3, state.cr4);
        Self {
            state,
            pending: PendingEventState::default(),
            mmu,
            time: TimeSource::new(),
            bus,
            ports,
            irq: IrqLines::new(),
            config,
            inst_eip: 0,
        }
    }

    pub fn config(&self) -> &CpuConfig {
        &self.config
    }

    /// Handle for raising interrupts from another thread.
    pub fn irq_lines(&self) -> IrqLines {
        self.irq.clone()
    }

    pub fn raise_irq(&mut self, vector: u8) {
        self.pending.inject_external_interrupt(vector);
    }

    pub fn raise_nmi(&mut self) {
        self.pending.raise_nmi();
    }

    /// Advance the tick counter (idle time) and queue any timer interrupts
    /// that became due.
    pub fn advance_ticks(&mut self, ticks: u64) {
        for vector in self.time.advance(ticks) {
            trace!(vector, ticks = self.time.ticks(), "timer deadline due");
            self.pending.inject_external_interrupt(vector);
        }
    }

    /// Drain an external interrupt controller into the pending queue.
    pub fn poll(&mut self, ctrl: &mut impl InterruptController) {
        while let Some(vector) = ctrl.poll_interrupt() {
            self.pending.inject_external_interrupt(vector);
        }
    }

    pub fn set_cr0(&mut self, value: u32) {
        let old = self.state.cr0;
        self.state.cr0 = value;
        self.mmu.set_cr0(value);
        if (old ^ value) & (CR0_PE | CR0_PG) != 0 {
            debug!(cr0 = value, mode = ?self.state.mode(), "mode change");
        }
    }

    pub fn set_cr3(&mut self, value: u32) {
        self.state.cr3 = value;
        self.mmu.set_cr3(value);
    }

    pub fn set_cr4(&mut self, value: u32) {
        self.state.cr4 = value;
        self.mmu.set_cr4(value);
    }

    /// Re-mirror CR0/CR3/CR4 into the MMU after editing `state` directly.
    /// The TLB is left alone.
    pub fn sync_mmu(&mut self) {
        self.mmu
            .restore_control_registers(self.state.cr0, self.state.cr3, self.state.cr4);
    }

    /// Power-on reset. The tick counter and scheduled deadlines survive;
    /// every other piece of processor state returns to its initial value.
    pub fn reset(&mut self) {
        self.state = CpuState::reset(self.config.signature);
        self.pending = PendingEventState::default();
        self.mmu = Mmu::new();
        self.sync_mmu();
        self.inst_eip = 0;
    }

    /// Run one step: sample interrupts, then execute one instruction unless
    /// an interrupt was delivered or the processor is halted. The tick
    /// counter advances by one either way.
    pub fn step(&mut self) -> Result<StepOutcome, InternalError> {
        let outcome = self.step_inner()?;
        self.advance_ticks(1);
        Ok(outcome)
    }

    /// Step until `max_steps` have run, or the processor halts with
    /// interrupts disabled and no NMI pending.
    pub fn run(&mut self, max_steps: u64) -> Result<RunSummary, InternalError> {
        let mut summary = RunSummary {
            steps: 0,
            last: None,
        };
        while summary.steps < max_steps {
            let outcome = self.step()?;
            summary.steps += 1;
            summary.last = Some(outcome);
            if self.state.halted && !self.state.flag(FLAG_IF) && !self.pending.nmi_pending() {
                debug!(steps = summary.steps, "halted with interrupts disabled");
                break;
            }
        }
        Ok(summary)
    }

    fn step_inner(&mut self) -> Result<StepOutcome, InternalError> {
        let (vectors, nmi) = self.irq.drain();
        for vector in vectors {
            self.pending.inject_external_interrupt(vector);
        }
        if nmi {
            self.pending.raise_nmi();
        }

        if self.pending.interrupt_inhibit() == 0 {
            if self.pending.take_nmi() {
                return self.deliver_external(NMI_VECTOR);
            }
            if self.state.flag(FLAG_IF) {
                if let Some(vector) = self.pending.external_interrupts.pop_front() {
                    return self.deliver_external(vector);
                }
            }
        }

        if self.state.halted {
            return Ok(StepOutcome::Halted);
        }
        self.execute_one()
    }

    fn deliver_external(&mut self, vector: u8) -> Result<StepOutcome, InternalError> {
        self.state.halted = false;
        let eip = self.state.eip;
        match self.deliver(vector, None, InterruptSource::External, eip) {
            Ok(()) => {
                trace!(vector, "external interrupt delivered");
                Ok(StepOutcome::InterruptDelivered(vector))
            }
            Err(Fault::Guest(e)) => self.raise_exception(e, eip),
            Err(Fault::Internal(e)) => Err(self.internal(e)),
        }
    }

    fn fetch_decode(&mut self) -> CpuResult<ember_x86::Instruction> {
        let (mode, ip_mask) = if self.state.code_is_32() {
            (DecodeMode::Bits32, u32::MAX)
        } else {
            (DecodeMode::Bits16, 0xffff)
        };
        let eip = self.state.eip;
        let mut src = CodeFetch {
            cpu: self,
            eip,
            ip_mask,
        };
        decode(&mut src, mode).map_err(|e| match e {
            DecodeError::Invalid => Exception::InvalidOpcode.into(),
            DecodeError::TooLong => Exception::GeneralProtection(0).into(),
            DecodeError::Fetch(fault) => fault,
        })
    }

    fn execute_one(&mut self) -> Result<StepOutcome, InternalError> {
        let saved = self.state.clone();
        self.inst_eip = self.state.eip;
        let single_step = self.state.flag(FLAG_TF);

        let result = match self.fetch_decode() {
            Ok(inst) => self.exec(&inst),
            Err(e) => Err(e),
        };
        let flow = match result {
            Ok(flow) => flow,
            Err(Fault::Guest(e)) => {
                self.state = saved;
                return self.raise_exception(e, self.inst_eip);
            }
            Err(Fault::Internal(e)) => {
                self.state = saved;
                return Err(self.internal(e));
            }
        };

        self.pending.retire_instruction();
        let next = self.state.eip;
        let mut outcome = StepOutcome::Retired;
        match flow {
            Flow::Next => {}
            Flow::InhibitInterrupts => self.pending.inhibit_interrupts_for_one_instruction(),
            Flow::Halt => {
                self.state.halted = true;
                outcome = StepOutcome::Halted;
            }
            Flow::Interrupt(vector) => {
                return match self.deliver(vector, None, InterruptSource::Software, next) {
                    Ok(()) => Ok(StepOutcome::SoftwareInterrupt(vector)),
                    Err(Fault::Guest(e)) => self.raise_exception(e, self.inst_eip),
                    Err(Fault::Internal(e)) => Err(self.internal(e)),
                };
            }
        }

        if single_step {
            self.state.dr[6] |= DR6_BS;
            return self.raise_exception(Exception::Debug, next);
        }
        Ok(outcome)
    }

    /// Deliver a processor exception, escalating to #DF if delivery faults
    /// and resetting on a fault while delivering #DF.
    ///
    /// Software interrupts (INT n, INT3, INTO) never come through here: a
    /// fault while delivering one of those is a fresh exception.
    fn raise_exception(&mut self, e: Exception, return_eip: u32) -> Result<StepOutcome, InternalError> {
        let vector = e.vector();
        if let Exception::PageFault { addr, .. } = e {
            self.state.cr2 = addr;
        }
        debug!(vector, error_code = ?e.error_code(), eip = return_eip, "exception");

        let nested = match self.deliver(vector, e.error_code(), InterruptSource::Exception, return_eip) {
            Ok(()) => return Ok(StepOutcome::FaultRaised(vector)),
            Err(Fault::Internal(err)) => return Err(self.internal(err)),
            Err(Fault::Guest(nested)) => nested,
        };

        if e == Exception::DoubleFault {
            return Ok(self.triple_fault(nested));
        }
        if let Exception::PageFault { addr, .. } = nested {
            self.state.cr2 = addr;
        }
        debug!(first = vector, second = nested.vector(), "double fault");
        let df = Exception::DoubleFault;
        match self.deliver(df.vector(), df.error_code(), InterruptSource::Exception, return_eip) {
            Ok(()) => Ok(StepOutcome::FaultRaised(df.vector())),
            Err(Fault::Guest(third)) => Ok(self.triple_fault(third)),
            Err(Fault::Internal(err)) => Err(self.internal(err)),
        }
    }

    fn triple_fault(&mut self, cause: Exception) -> StepOutcome {
        warn!(
            vector = cause.vector(),
            eip = self.inst_eip,
            "triple fault, resetting processor"
        );
        self.reset();
        StepOutcome::Reset
    }

    fn internal(&self, e: InternalError) -> InternalError {
        warn!(error = %e, eip = self.inst_eip, "internal emulator error");
        e
    }
}
