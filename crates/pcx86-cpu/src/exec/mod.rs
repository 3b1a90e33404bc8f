//! The top-level execution loop.
//!
//! [`Scheduler::run_slice`] runs the CPU for one cooperative slice of cycles.
//! At every instruction or block boundary it observes reset requests and
//! triple faults, fires due timers, delivers interrupts, and then either runs
//! a cached translation of the current block or interprets one instruction
//! (recording it when the block entry is hot).

use tracing::{debug, warn};

use crate::interp::Step;
use crate::interrupts::{CpuExit, InterruptController};
use crate::jit::{ExitReason, JitBackend, JitConfig, JitRuntime, TraceRecorder};
use crate::mem::CpuBus;
use crate::time::{CycleCounter, TimerQueue};
use crate::timing;
use crate::vcpu::Vcpu;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Cycles per cooperative slice.
    pub slice_cycles: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { slice_cycles: 10_000 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecState {
    Interpreting,
    ExecutingCompiled,
    /// The last instruction faulted and the exception was delivered.
    Faulted,
    Halted,
}

/// Why [`Scheduler::run_slice`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceExit {
    /// The cycle budget ran out.
    BudgetExhausted,
    /// The CPU is halted and nothing pending can wake it this slice.
    Halted,
    /// A reset request or a triple fault reset the CPU.
    Reset,
}

/// An interrupt controller with nothing to say.
struct NoController;

impl InterruptController for NoController {
    fn poll_interrupt(&mut self) -> Option<u8> {
        None
    }
}

#[derive(Debug)]
pub struct Scheduler<K: JitBackend> {
    config: SchedulerConfig,
    jit: JitRuntime<K>,
    recorder: TraceRecorder,
    /// The next instruction starts a block: the previous one ended a block,
    /// faulted, or control arrived by interrupt, reset or a compiled exit.
    at_entry: bool,
    /// A compiled block stopped in front of an instruction it could not
    /// finish; that instruction is interpreted next.
    interpret_next: bool,
    state: ExecState,
    clock: CycleCounter,
    timers: TimerQueue,
    resets: u64,
}

impl<K: JitBackend> Scheduler<K> {
    pub fn new(config: SchedulerConfig, jit_config: JitConfig, backend: K) -> Self {
        Self {
            config,
            recorder: TraceRecorder::new(jit_config.max_block_insns),
            jit: JitRuntime::new(jit_config, backend),
            at_entry: true,
            interpret_next: false,
            state: ExecState::Interpreting,
            clock: CycleCounter::new(config.slice_cycles),
            timers: TimerQueue::new(),
            resets: 0,
        }
    }

    #[inline]
    pub fn state(&self) -> ExecState {
        self.state
    }

    #[inline]
    pub fn jit(&self) -> &JitRuntime<K> {
        &self.jit
    }

    #[inline]
    pub fn jit_mut(&mut self) -> &mut JitRuntime<K> {
        &mut self.jit
    }

    #[inline]
    pub fn timers_mut(&mut self) -> &mut TimerQueue {
        &mut self.timers
    }

    #[inline]
    pub fn clock(&self) -> &CycleCounter {
        &self.clock
    }

    /// Resets performed (requests and triple faults).
    #[inline]
    pub fn resets(&self) -> u64 {
        self.resets
    }

    /// Run one slice with interrupts coming only from the vCPU's own IRQ
    /// line and the timer queue.
    pub fn run_slice<B: CpuBus>(&mut self, vcpu: &mut Vcpu<B>) -> SliceExit {
        self.run_slice_with(vcpu, &mut NoController)
    }

    /// Run one slice, polling `pic` for external interrupts at every
    /// boundary where they are accepted.
    pub fn run_slice_with<B: CpuBus, C: InterruptController>(
        &mut self,
        vcpu: &mut Vcpu<B>,
        pic: &mut C,
    ) -> SliceExit {
        self.clock.reload(self.config.slice_cycles);
        loop {
            if vcpu.pending.take_reset() || vcpu.exit == Some(CpuExit::TripleFault) {
                self.reset(vcpu);
                return SliceExit::Reset;
            }
            for vector in self.timers.run_due(vcpu.state.tsc) {
                vcpu.pending.raise_irq(vector);
            }
            if self.clock.expired() {
                return SliceExit::BudgetExhausted;
            }

            if vcpu.service_interrupts() || vcpu.poll_and_deliver(pic) {
                self.recorder.abort();
                self.at_entry = true;
                self.interpret_next = false;
                self.state = ExecState::Interpreting;
                self.charge(vcpu, timing::fault_cost(vcpu.state.model()));
                continue;
            }

            if vcpu.state.halted {
                self.state = ExecState::Halted;
                if !self.idle(vcpu) {
                    return SliceExit::Halted;
                }
                continue;
            }

            let may_enter = !self.interpret_next
                && !self.recorder.is_recording()
                && !vcpu.pending.interrupts_inhibited();
            if may_enter {
                if let Some(key) = self.jit.block_key(vcpu) {
                    if let Some(exit) = self.jit.try_execute(vcpu, &key) {
                        self.state = ExecState::ExecutingCompiled;
                        self.clock.clock_cycles(exit.cycles);
                        self.at_entry = true;
                        // Events raised inside the block are taken before
                        // the interpreter picks up the stopped instruction.
                        self.interpret_next =
                            matches!(exit.reason, ExitReason::Fallback | ExitReason::Fault);
                        continue;
                    }
                    if self.at_entry && self.jit.note_miss(vcpu, &key) {
                        self.recorder.start(key, vcpu.state.config);
                    }
                }
            }
            self.interpret_one(vcpu);
        }
    }

    fn interpret_one<B: CpuBus>(&mut self, vcpu: &mut Vcpu<B>) {
        self.interpret_next = false;
        let step = vcpu.step();
        match step {
            Step::Retired { insn, cycles, .. } => {
                self.at_entry = insn.op.ends_block();
                self.state = ExecState::Interpreting;
                self.clock.clock_cycles(cycles);
            }
            Step::Faulted { cycles, .. } => {
                self.at_entry = true;
                self.state = ExecState::Faulted;
                self.clock.clock_cycles(cycles);
            }
            Step::Halted => self.state = ExecState::Halted,
        }
        if let Some(trace) = self.recorder.observe(&step, vcpu) {
            self.jit.install(trace, vcpu);
        }
    }

    /// Let time pass while halted: up to the next timer deadline or the end
    /// of the slice. False when the rest of the slice was burned.
    fn idle<B: CpuBus>(&mut self, vcpu: &mut Vcpu<B>) -> bool {
        let left = u64::try_from(self.clock.remaining()).unwrap_or(0);
        let now = vcpu.state.tsc;
        let skip = match self.timers.next_deadline() {
            Some(deadline) if deadline.saturating_sub(now) < left => {
                deadline.saturating_sub(now).max(1)
            }
            _ => left.max(1),
        };
        let burned_slice = skip >= left;
        self.charge(vcpu, u32::try_from(skip).unwrap_or(u32::MAX));
        !burned_slice
    }

    fn charge<B: CpuBus>(&mut self, vcpu: &mut Vcpu<B>, cycles: u32) {
        self.clock.clock_cycles(cycles);
        vcpu.state.tsc = vcpu.state.tsc.wrapping_add(u64::from(cycles));
    }

    fn reset<B: CpuBus>(&mut self, vcpu: &mut Vcpu<B>) {
        if vcpu.exit == Some(CpuExit::TripleFault) {
            warn!(eip = vcpu.state.eip, "triple fault: resetting cpu");
        } else {
            debug!("reset requested");
        }
        vcpu.reset();
        self.jit.flush(vcpu);
        self.recorder.abort();
        self.at_entry = true;
        self.interpret_next = false;
        self.state = ExecState::Interpreting;
        self.resets += 1;
    }
}
