//! Trace recording.
//!
//! When a block entry turns hot, the scheduler keeps interpreting but feeds
//! every step to a [`TraceRecorder`]. The recorder collects the decoded
//! instructions of one straight-line run and stops at the first instruction
//! that ends a block, at a fault, at a non-sequential EIP (REP resumption,
//! interrupt delivery), or at the length cap.

use tracing::trace;

use crate::decode::{decode, DecodeCtx, Insn};
use crate::interp::Step;
use crate::mem::{AccessType, CpuBus};
use crate::model::CpuConfig;
use crate::vcpu::Vcpu;

use super::cache::{BlockKey, PageDep};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TracedInsn {
    pub eip: u32,
    pub insn: Insn,
}

/// A recorded straight-line instruction run, ready for translation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trace {
    pub key: BlockKey,
    pub config: CpuConfig,
    pub insns: Vec<TracedInsn>,
    pub pages: Vec<PageDep>,
}

impl Trace {
    pub fn byte_len(&self) -> u32 {
        self.insns.iter().map(|t| u32::from(t.insn.len)).sum()
    }

    /// Re-decode the recorded instructions from guest memory without side
    /// effects. False if any byte is unmapped or decodes differently now.
    pub fn still_matches<B: CpuBus>(&self, vcpu: &mut Vcpu<B>) -> bool {
        let ctx = DecodeCtx {
            model: self.config.model,
            features: self.config.features,
            code32: self.key.code32,
        };
        let mask = if self.key.code32 { u32::MAX } else { 0xffff };
        let cpl = self.key.cpl;
        for t in &self.insns {
            let r = decode(&ctx, |i| {
                let lin = self.key.cs_base.wrapping_add(t.eip.wrapping_add(i) & mask);
                let paddr = vcpu
                    .bus
                    .probe(lin, AccessType::Execute, cpl)
                    .ok_or_else(crate::exceptions::Fault::gp0)?;
                let mut b = [0u8];
                vcpu.bus.read_phys(paddr, &mut b);
                Ok(b[0])
            });
            if r.ok() != Some(t.insn) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug)]
struct Recording {
    key: BlockKey,
    config: CpuConfig,
    insns: Vec<TracedInsn>,
    pages: Vec<PageDep>,
    next_eip: u32,
}

#[derive(Debug)]
pub struct TraceRecorder {
    active: Option<Recording>,
    max_insns: usize,
}

impl TraceRecorder {
    pub fn new(max_insns: u32) -> Self {
        Self {
            active: None,
            max_insns: max_insns.max(1) as usize,
        }
    }

    #[inline]
    pub fn is_recording(&self) -> bool {
        self.active.is_some()
    }

    /// Start recording at `key`. The next observed step must retire the
    /// instruction at `key.eip`.
    pub fn start(&mut self, key: BlockKey, config: CpuConfig) {
        trace!(eip = key.eip, cs_base = key.cs_base, "recording trace");
        self.active = Some(Recording {
            key,
            config,
            insns: Vec::new(),
            pages: Vec::new(),
            next_eip: key.eip,
        });
    }

    pub fn abort(&mut self) {
        self.active = None;
    }

    /// Feed one interpreter step. Returns the finished trace once the run
    /// ends; traces with no instructions are dropped.
    pub fn observe<B: CpuBus>(&mut self, step: &Step, vcpu: &mut Vcpu<B>) -> Option<Trace> {
        let rec = self.active.as_mut()?;
        let Step::Retired { eip, insn, .. } = *step else {
            return self.finish();
        };
        if eip != rec.next_eip {
            return self.finish();
        }

        rec.insns.push(TracedInsn { eip, insn });
        let fetched = *vcpu.insn_pages();
        for &(linear_page, phys_page) in fetched.as_slice() {
            if !rec.pages.iter().any(|p| p.phys_page == phys_page) {
                let version = vcpu.bus.code_pages().watch(phys_page);
                rec.pages.push(PageDep {
                    linear_page,
                    phys_page,
                    version,
                });
            }
        }

        let mask = if rec.key.code32 { u32::MAX } else { 0xffff };
        let fallthrough = eip.wrapping_add(u32::from(insn.len)) & mask;
        rec.next_eip = fallthrough;
        if insn.op.ends_block()
            || rec.insns.len() >= self.max_insns
            || vcpu.state.eip != fallthrough
        {
            return self.finish();
        }
        None
    }

    fn finish(&mut self) -> Option<Trace> {
        let rec = self.active.take()?;
        if rec.insns.is_empty() {
            return None;
        }
        Some(Trace {
            key: rec.key,
            config: rec.config,
            insns: rec.insns,
            pages: rec.pages,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::cache::BlockMode;
    use crate::mem::FlatTestBus;
    use crate::model::CpuModel;
    use crate::types::SegReg;

    fn setup(code: &[u8]) -> (Vcpu<FlatTestBus>, BlockKey) {
        let mut bus = FlatTestBus::new(0x10000);
        bus.load(0x1000, code);
        let mut v = Vcpu::new(CpuConfig::new(CpuModel::I386), bus);
        v.state.load_seg_real(SegReg::Cs, 0x100);
        v.state.eip = 0;
        let key = BlockKey {
            cs_base: 0x1000,
            eip: 0,
            code32: false,
            cpl: 0,
            mode: BlockMode::Real,
        };
        (v, key)
    }

    #[test]
    fn records_until_block_end() {
        // inc ax; inc bx; jmp $
        let (mut v, key) = setup(&[0x40, 0x43, 0xeb, 0xfe]);
        let mut r = TraceRecorder::new(64);
        r.start(key, v.state.config);
        let mut out = None;
        for _ in 0..3 {
            let step = v.step();
            out = r.observe(&step, &mut v);
        }
        let t = out.unwrap();
        assert_eq!(t.insns.len(), 3);
        assert_eq!(t.byte_len(), 4);
        assert_eq!(t.pages.len(), 1);
        assert_eq!(t.pages[0].phys_page, 1);
        assert!(!r.is_recording());
        assert!(t.still_matches(&mut v));

        v.bus.load(0x1001, &[0x41]);
        assert!(!t.still_matches(&mut v));
    }

    #[test]
    fn length_cap_ends_the_trace() {
        let (mut v, key) = setup(&[0x90; 16]);
        let mut r = TraceRecorder::new(4);
        r.start(key, v.state.config);
        let mut done = None;
        for _ in 0..4 {
            let step = v.step();
            done = r.observe(&step, &mut v);
        }
        assert_eq!(done.map(|t| t.insns.len()), Some(4));
    }

    #[test]
    fn wrong_entry_point_yields_nothing() {
        let (mut v, mut key) = setup(&[0x90, 0x90]);
        key.eip = 1;
        let mut r = TraceRecorder::new(4);
        r.start(key, v.state.config);
        let step = v.step();
        assert!(r.observe(&step, &mut v).is_none());
        assert!(!r.is_recording());
    }
}
