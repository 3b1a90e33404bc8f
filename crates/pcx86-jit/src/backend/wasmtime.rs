//! Native backend that runs blocks as wasm modules under wasmtime.
//!
//! Every compiled block is instantiated into the backend's single store and
//! shares one imported linear memory holding the block frame (see
//! [`crate::wasm`]). Instances live as long as the backend.

use std::fmt;

use pcx86_cpu::decode::{AluOp, ShiftOp};
use pcx86_cpu::jit::{BlockExit, JitBackend, Trace, TranslateError, Translation};
use pcx86_cpu::mem::CpuBus;
use pcx86_cpu::state::flags::Flags;
use pcx86_cpu::types::{Cond, SegReg};
use pcx86_cpu::{CpuModel, Vcpu};
use tracing::{debug, error};
use wasmtime::{Caller, Config, Engine, Linker, Memory, MemoryType, Module, Store, TypedFunc};

use super::{BackendConfig, BackendError};
use crate::emitter::{CodeBuffer, Executable};
use crate::ir::{ACCESS_SLOTS, HOST_REGS};
use crate::ops::{self, HostRegs, Slots, FAULT, FELL_OFF};
use crate::translate;
use crate::wasm::codegen;
use crate::wasm::{
    flag_from_code, unary_from_code, width_from_bits, BlockReturn, CS_LIMIT_OFF, CUR_INSN_OFF,
    EXPORT_BLOCK_FN, GUEST_REGS_OFF, HOST_REGS_OFF, IMPORT_ALU, IMPORT_COND, IMPORT_FLAG,
    IMPORT_MEMORY, IMPORT_MODULE, IMPORT_SHIFT, IMPORT_UNARY, MEMORY_PAGES,
};

/// What the flag imports see of the vCPU during a call.
#[derive(Debug, Clone, Copy)]
struct HostState {
    flags: Flags,
    model: CpuModel,
}

/// A block lowered to wasm and instantiated.
pub struct CompiledBlock {
    code: CodeBuffer<Executable>,
    yields: Vec<u32>,
    wasm_len: usize,
    func: TypedFunc<i32, i32>,
}

impl CompiledBlock {
    /// The host ops the module was generated from.
    pub fn code(&self) -> &CodeBuffer<Executable> {
        &self.code
    }

    /// Guest instructions covered, including a trailing fallback marker.
    pub fn insn_count(&self) -> usize {
        self.code.insn_count()
    }

    pub fn wasm_len(&self) -> usize {
        self.wasm_len
    }
}

impl fmt::Debug for CompiledBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledBlock")
            .field("ops", &self.code.ops().len())
            .field("host_calls", &self.yields.len())
            .field("wasm_len", &self.wasm_len)
            .finish()
    }
}

pub struct WasmtimeBackend {
    config: BackendConfig,
    engine: Engine,
    store: Store<HostState>,
    linker: Linker<HostState>,
    memory: Memory,
    blocks_compiled: u64,
    blocks_run: u64,
}

impl fmt::Debug for WasmtimeBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WasmtimeBackend")
            .field("config", &self.config)
            .field("blocks_compiled", &self.blocks_compiled)
            .field("blocks_run", &self.blocks_run)
            .finish()
    }
}

fn runtime_err(err: impl fmt::Display) -> BackendError {
    BackendError::Runtime(err.to_string())
}

fn backend_err(err: impl fmt::Display) -> TranslateError {
    TranslateError::Backend(err.to_string())
}

impl WasmtimeBackend {
    pub fn new(config: BackendConfig) -> Result<Self, BackendError> {
        config.validate()?;
        let engine = Engine::new(&Config::new()).map_err(runtime_err)?;
        let mut store = Store::new(
            &engine,
            HostState {
                flags: Flags::default(),
                model: CpuModel::I8088,
            },
        );
        let mut linker = Linker::new(&engine);

        let memory =
            Memory::new(&mut store, MemoryType::new(MEMORY_PAGES, None)).map_err(runtime_err)?;
        linker
            .define(&mut store, IMPORT_MODULE, IMPORT_MEMORY, memory)
            .map_err(runtime_err)?;
        define_flag_helpers(&mut linker)?;

        Ok(Self {
            config,
            engine,
            store,
            linker,
            memory,
            blocks_compiled: 0,
            blocks_run: 0,
        })
    }

    pub fn blocks_compiled(&self) -> u64 {
        self.blocks_compiled
    }

    pub fn blocks_run(&self) -> u64 {
        self.blocks_run
    }

    /// Copy host registers, guest registers and EFLAGS into the frame.
    fn sync_to_wasm<B: CpuBus>(&mut self, vcpu: &Vcpu<B>, regs: &HostRegs) {
        let mem = self.memory.data_mut(&mut self.store);
        for (i, r) in regs.iter().enumerate() {
            put(mem, HOST_REGS_OFF + 4 * i as u32, *r);
        }
        for (i, r) in vcpu.state.regs.iter().enumerate() {
            put(mem, GUEST_REGS_OFF + 4 * i as u32, *r);
        }
        put(mem, CS_LIMIT_OFF, vcpu.state.seg(SegReg::Cs).limit);
        self.store.data_mut().flags = vcpu.state.flags;
    }

    /// Copy the frame back. Returns the current instruction index.
    fn sync_from_wasm<B: CpuBus>(&mut self, vcpu: &mut Vcpu<B>, regs: &mut HostRegs) -> usize {
        let mem = self.memory.data(&self.store);
        for (i, r) in regs.iter_mut().enumerate() {
            *r = get(mem, HOST_REGS_OFF + 4 * i as u32);
        }
        for (i, r) in vcpu.state.regs.iter_mut().enumerate() {
            *r = get(mem, GUEST_REGS_OFF + 4 * i as u32);
        }
        let cur = get(mem, CUR_INSN_OFF) as usize;
        vcpu.state.flags = self.store.data().flags;
        cur
    }
}

fn put(mem: &mut [u8], off: u32, value: u32) {
    let at = off as usize;
    mem[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

fn get(mem: &[u8], off: u32) -> u32 {
    let at = off as usize;
    let mut b = [0u8; 4];
    b.copy_from_slice(&mem[at..at + 4]);
    u32::from_le_bytes(b)
}

impl JitBackend for WasmtimeBackend {
    type Code = CompiledBlock;

    fn compile(&mut self, trace: &Trace) -> Result<Translation<CompiledBlock>, TranslateError> {
        let t = translate::translate(trace, self.config.max_ops)?;
        let wasm = codegen::lower(&t.code);
        let module = Module::new(&self.engine, &wasm.bytes).map_err(backend_err)?;
        let instance = self
            .linker
            .instantiate(&mut self.store, &module)
            .map_err(backend_err)?;
        let func = instance
            .get_typed_func::<i32, i32>(&mut self.store, EXPORT_BLOCK_FN)
            .map_err(backend_err)?;
        self.blocks_compiled += 1;
        debug!(
            eip = trace.key.eip,
            covered = t.insn_count,
            recorded = trace.insns.len(),
            ops = t.code.ops().len(),
            host_calls = wasm.yields.len(),
            wasm_len = wasm.bytes.len(),
            "compiled block"
        );
        Ok(Translation {
            code: CompiledBlock {
                code: t.code,
                yields: wasm.yields,
                wasm_len: wasm.bytes.len(),
                func,
            },
            insn_count: t.insn_count,
            byte_len: t.byte_len,
        })
    }

    fn execute<B: CpuBus>(&mut self, vcpu: &mut Vcpu<B>, block: &CompiledBlock) -> BlockExit {
        self.blocks_run += 1;
        vcpu.state.abort = None;
        self.store.data_mut().model = vcpu.state.model();

        let mut regs: HostRegs = [0; HOST_REGS];
        let mut slots: Slots = [None; ACCESS_SLOTS];
        self.sync_to_wasm(vcpu, &regs);
        put(self.memory.data_mut(&mut self.store), CUR_INSN_OFF, 0);

        let mut resume = 0;
        let (cur, exit) = loop {
            let ret = block.func.call(&mut self.store, resume);
            let cur = self.sync_from_wasm(vcpu, &mut regs);
            let ret = match ret {
                Ok(ret) => ret,
                Err(err) => {
                    error!(eip = vcpu.state.eip, %err, "wasm block trapped");
                    break (cur, FELL_OFF);
                }
            };
            match BlockReturn::decode(ret) {
                BlockReturn::Yield(k) => {
                    let Some(op) = block
                        .yields
                        .get(k)
                        .and_then(|&i| block.code.ops().get(i as usize))
                    else {
                        break (cur, FELL_OFF);
                    };
                    if let Some(exit) =
                        ops::host_call(vcpu, &block.code, op, &mut regs, &mut slots)
                    {
                        break (cur, exit);
                    }
                    self.sync_to_wasm(vcpu, &regs);
                    resume = k as i32 + 1;
                }
                BlockReturn::Stub(id) => break (cur, block.code.stub(id)),
                BlockReturn::Fault => break (cur, FAULT),
                BlockReturn::FellOff => break (cur, FELL_OFF),
            }
        };
        ops::finish(vcpu, &block.code, cur, &regs, exit)
    }
}

fn define_flag_helpers(linker: &mut Linker<HostState>) -> Result<(), BackendError> {
    linker
        .func_wrap(
            IMPORT_MODULE,
            IMPORT_ALU,
            |mut caller: Caller<'_, HostState>, op: i32, bits: i32, a: i32, b: i32| -> i32 {
                let op = AluOp::from_index(op as u8);
                let width = width_from_bits(bits);
                ops::alu_op(&mut caller.data_mut().flags, op, width, a as u32, b as u32) as i32
            },
        )
        .map_err(runtime_err)?;
    linker
        .func_wrap(
            IMPORT_MODULE,
            IMPORT_UNARY,
            |mut caller: Caller<'_, HostState>, op: i32, bits: i32, a: i32| -> i32 {
                let op = unary_from_code(op);
                let width = width_from_bits(bits);
                ops::unary_op(&mut caller.data_mut().flags, op, width, a as u32) as i32
            },
        )
        .map_err(runtime_err)?;
    linker
        .func_wrap(
            IMPORT_MODULE,
            IMPORT_SHIFT,
            |mut caller: Caller<'_, HostState>,
             op: i32,
             bits: i32,
             value: i32,
             count: i32|
             -> i64 {
                let op = ShiftOp::from_index(op as u8);
                let width = width_from_bits(bits);
                let value = value as u32;
                let state = caller.data_mut();
                let model = state.model;
                match ops::shift_op(&mut state.flags, model, op, width, value, count as u32) {
                    Some(r) => (1 << 32) | i64::from(r),
                    None => i64::from(value),
                }
            },
        )
        .map_err(runtime_err)?;
    linker
        .func_wrap(
            IMPORT_MODULE,
            IMPORT_COND,
            |mut caller: Caller<'_, HostState>, cc: i32| -> i32 {
                i32::from(caller.data_mut().flags.cond(Cond::from_index(cc as u8)))
            },
        )
        .map_err(runtime_err)?;
    linker
        .func_wrap(
            IMPORT_MODULE,
            IMPORT_FLAG,
            |mut caller: Caller<'_, HostState>, edit: i32| {
                ops::flag_edit(&mut caller.data_mut().flags, flag_from_code(edit));
            },
        )
        .map_err(runtime_err)?;
    Ok(())
}
