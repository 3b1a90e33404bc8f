//! Guest-to-host register allocation.
//!
//! Guest GPRs are cached in host registers across instructions of a block.
//! A cached register is loaded on first read and marked dirty on write;
//! dirty registers are written back by [`RegAlloc::flush`], which the
//! translator emits before every helper call and block exit so that guest
//! state is complete whenever control can leave translated code.
//!
//! Registers handed out during one instruction are pinned until
//! [`RegAlloc::end_insn`]. When every host register is pinned the request
//! fails and the translator ends the block in front of that instruction.

use crate::emitter::{CodeBuffer, Writable};
use crate::ir::{HReg, HostOp, HOST_REGS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Binding {
    Free,
    Guest { reg: u8, dirty: bool },
    Temp,
}

#[derive(Debug, Clone)]
pub struct RegAlloc {
    slots: [Binding; HOST_REGS],
    last_use: [u32; HOST_REGS],
    pinned: u16,
    clock: u32,
}

impl Default for RegAlloc {
    fn default() -> Self {
        Self::new()
    }
}

impl RegAlloc {
    pub fn new() -> Self {
        Self {
            slots: [Binding::Free; HOST_REGS],
            last_use: [0; HOST_REGS],
            pinned: 0,
            clock: 0,
        }
    }

    fn find(&self, reg: u8) -> Option<usize> {
        self.slots
            .iter()
            .position(|b| matches!(*b, Binding::Guest { reg: r, .. } if r == reg))
    }

    fn touch(&mut self, slot: usize) {
        self.clock = self.clock.wrapping_add(1);
        self.last_use[slot] = self.clock;
        self.pinned |= 1 << slot;
    }

    fn is_pinned(&self, slot: usize) -> bool {
        self.pinned & (1 << slot) != 0
    }

    /// Pick a slot to (re)use: a free one, else the least recently used
    /// unpinned guest binding, preferring clean ones.
    fn victim(&self) -> Option<usize> {
        if let Some(free) = self.slots.iter().position(|b| *b == Binding::Free) {
            return Some(free);
        }
        let lru = |want_dirty: bool| {
            (0..HOST_REGS)
                .filter(|&i| !self.is_pinned(i))
                .filter(|&i| {
                    matches!(self.slots[i], Binding::Guest { dirty, .. } if dirty == want_dirty)
                })
                .min_by_key(|&i| self.last_use[i])
        };
        lru(false).or_else(|| lru(true))
    }

    fn claim(&mut self, buf: &mut CodeBuffer<Writable>) -> Option<usize> {
        let slot = self.victim()?;
        if let Binding::Guest { reg, dirty: true } = self.slots[slot] {
            buf.emit(HostOp::StoreGuest {
                reg,
                src: HReg(slot as u8),
            });
        }
        self.slots[slot] = Binding::Free;
        Some(slot)
    }

    /// Host register holding guest `reg`, loading it if needed.
    pub fn read(&mut self, buf: &mut CodeBuffer<Writable>, reg: u8) -> Option<HReg> {
        if let Some(slot) = self.find(reg) {
            self.touch(slot);
            return Some(HReg(slot as u8));
        }
        let slot = self.claim(buf)?;
        buf.emit(HostOp::LoadGuest {
            dst: HReg(slot as u8),
            reg,
        });
        self.slots[slot] = Binding::Guest { reg, dirty: false };
        self.touch(slot);
        Some(HReg(slot as u8))
    }

    /// Host register that will receive a full 32-bit write of guest `reg`.
    pub fn write(&mut self, buf: &mut CodeBuffer<Writable>, reg: u8) -> Option<HReg> {
        let slot = match self.find(reg) {
            Some(slot) => slot,
            None => self.claim(buf)?,
        };
        self.slots[slot] = Binding::Guest { reg, dirty: true };
        self.touch(slot);
        Some(HReg(slot as u8))
    }

    /// Host register for a partial write of guest `reg`: loaded, then dirty.
    pub fn update(&mut self, buf: &mut CodeBuffer<Writable>, reg: u8) -> Option<HReg> {
        let h = self.read(buf, reg)?;
        self.slots[h.index()] = Binding::Guest { reg, dirty: true };
        Some(h)
    }

    /// Scratch register, released at the end of the instruction.
    pub fn temp(&mut self, buf: &mut CodeBuffer<Writable>) -> Option<HReg> {
        let slot = self.claim(buf)?;
        self.slots[slot] = Binding::Temp;
        self.touch(slot);
        Some(HReg(slot as u8))
    }

    /// Write every dirty guest register back.
    pub fn flush(&mut self, buf: &mut CodeBuffer<Writable>) {
        for slot in 0..HOST_REGS {
            if let Binding::Guest { reg, dirty: true } = self.slots[slot] {
                buf.emit(HostOp::StoreGuest {
                    reg,
                    src: HReg(slot as u8),
                });
                self.slots[slot] = Binding::Guest { reg, dirty: false };
            }
        }
    }

    /// Drop the cached copy of guest `reg` after a helper changed it. Must
    /// follow a flush.
    pub fn forget(&mut self, reg: u8) {
        if let Some(slot) = self.find(reg) {
            debug_assert!(
                !matches!(self.slots[slot], Binding::Guest { dirty: true, .. }),
                "forgetting a dirty register"
            );
            self.slots[slot] = Binding::Free;
        }
    }

    /// Release temporaries and pins.
    pub fn end_insn(&mut self) {
        for b in &mut self.slots {
            if *b == Binding::Temp {
                *b = Binding::Free;
            }
        }
        self.pinned = 0;
    }

    pub fn is_dirty(&self, reg: u8) -> bool {
        self.find(reg)
            .is_some_and(|slot| matches!(self.slots[slot], Binding::Guest { dirty: true, .. }))
    }

    pub fn is_cached(&self, reg: u8) -> bool {
        self.find(reg).is_some()
    }
}

#[cfg(test)]
mod tests {
    use pcx86_cpu::jit::ExitReason;
    use proptest::prelude::*;

    use super::*;
    use crate::ir::{ExitStub, Src};

    fn stores(buf: CodeBuffer<Writable>) -> usize {
        // Seal needs a terminator; count through a fresh exit.
        let mut buf = buf;
        let stub = buf.stub(ExitStub::Rollback {
            reason: ExitReason::Fallback,
        });
        buf.emit(HostOp::Exit(stub));
        let code = buf.seal().unwrap();
        code.ops()
            .iter()
            .filter(|op| matches!(op, HostOp::StoreGuest { .. }))
            .count()
    }

    #[test]
    fn cached_reads_do_not_reload() {
        let mut buf = CodeBuffer::new(256);
        let mut ra = RegAlloc::new();
        let a = ra.read(&mut buf, 0).unwrap();
        let b = ra.read(&mut buf, 0).unwrap();
        assert_eq!(a, b);
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn flush_writes_back_dirty_registers_once() {
        let mut buf = CodeBuffer::new(256);
        let mut ra = RegAlloc::new();
        ra.write(&mut buf, 3).unwrap();
        ra.read(&mut buf, 1).unwrap();
        assert!(ra.is_dirty(3));
        ra.flush(&mut buf);
        ra.flush(&mut buf);
        assert!(!ra.is_dirty(3));
        assert!(ra.is_cached(3));
        assert_eq!(stores(buf), 1);
    }

    #[test]
    fn exhausting_pinned_registers_fails() {
        let mut buf = CodeBuffer::new(256);
        let mut ra = RegAlloc::new();
        for _ in 0..HOST_REGS {
            ra.temp(&mut buf).unwrap();
        }
        assert!(ra.temp(&mut buf).is_none());
        ra.end_insn();
        assert!(ra.temp(&mut buf).is_some());
    }

    #[test]
    fn eviction_spills_dirty_values() {
        let mut buf = CodeBuffer::new(256);
        let mut ra = RegAlloc::new();
        for reg in 0..8u8 {
            ra.write(&mut buf, reg).unwrap();
        }
        ra.end_insn();
        // All eight slots hold dirty guest registers; a temp forces a spill
        // of the least recently used one (EAX).
        ra.temp(&mut buf).unwrap();
        assert!(!ra.is_cached(0));
        assert_eq!(stores(buf), 1);
    }

    #[derive(Debug, Clone, Copy)]
    enum Action {
        Read(u8),
        Write(u8, u32),
        Update(u8, u32),
        Temp,
        EndInsn,
        Flush,
    }

    fn action() -> impl Strategy<Value = Action> {
        prop_oneof![
            (0..8u8).prop_map(Action::Read),
            (0..8u8, any::<u32>()).prop_map(|(r, v)| Action::Write(r, v)),
            (0..8u8, any::<u32>()).prop_map(|(r, v)| Action::Update(r, v)),
            Just(Action::Temp),
            Just(Action::EndInsn),
            Just(Action::Flush),
        ]
    }

    proptest! {
        // Run the emitted loads, spills and moves against a guest register
        // file: every read must see the latest value, and after the final
        // flush the guest file must hold every write.
        #[test]
        fn cached_values_track_guest_state(
            actions in prop::collection::vec(action(), 1..64),
            init in prop::array::uniform8(any::<u32>()),
        ) {
            let mut buf = CodeBuffer::new(4096);
            let mut ra = RegAlloc::new();
            let mut model = init;
            let mut checks = Vec::new();
            for a in actions {
                match a {
                    Action::Read(r) => {
                        if let Some(h) = ra.read(&mut buf, r) {
                            buf.emit(HostOp::Boundary(checks.len() as u16));
                            checks.push((h, model[usize::from(r)]));
                        }
                    }
                    Action::Write(r, v) => {
                        if let Some(h) = ra.write(&mut buf, r) {
                            buf.emit(HostOp::Mov { dst: h, src: Src::Imm(v) });
                            model[usize::from(r)] = v;
                        }
                    }
                    Action::Update(r, v) => {
                        if let Some(h) = ra.update(&mut buf, r) {
                            buf.emit(HostOp::Mov { dst: h, src: Src::Imm(v) });
                            model[usize::from(r)] = v;
                        }
                    }
                    Action::Temp => {
                        if let Some(h) = ra.temp(&mut buf) {
                            buf.emit(HostOp::Mov { dst: h, src: Src::Imm(0xdead_beef) });
                        }
                    }
                    Action::EndInsn => ra.end_insn(),
                    Action::Flush => ra.flush(&mut buf),
                }
            }
            ra.flush(&mut buf);
            let stub = buf.stub(ExitStub::Rollback { reason: ExitReason::Fallback });
            buf.emit(HostOp::Exit(stub));
            let code = buf.seal().unwrap();

            let mut guest = init;
            let mut host = [0u32; HOST_REGS];
            for op in code.ops() {
                match *op {
                    HostOp::LoadGuest { dst, reg } => host[dst.index()] = guest[usize::from(reg)],
                    HostOp::StoreGuest { reg, src } => guest[usize::from(reg)] = host[src.index()],
                    HostOp::Mov { dst, src: Src::Imm(v) } => host[dst.index()] = v,
                    HostOp::Boundary(k) => {
                        let (h, want) = checks[usize::from(k)];
                        prop_assert_eq!(host[h.index()], want);
                    }
                    _ => {}
                }
            }
            prop_assert_eq!(guest, model);
        }
    }
}
