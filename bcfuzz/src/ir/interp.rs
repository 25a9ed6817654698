//! A reference interpreter.
//!
//! [`Machine`] executes a module over a flat little-endian byte memory. It is
//! how the rewrites are checked to preserve behaviour: run a function before
//! and after a pass on the same inputs and compare the results (and, once
//! probes are in, the coverage map).

use std::collections::HashMap;

use thiserror::Error;

use super::{
    BlockId, Callee, CastOp, Constant, FuncId, Function, InstId, InstKind, Module,
    Terminator, Type, Value, mask, sign_extend,
};
use crate::constants::{AFL_AREA_PTR, AFL_BB_TRACE};

/// Function values are encoded as addresses above this base.
const FUNC_BASE: u64 = 0xffff_0000_0000_0000;

/// Addresses below this are never handed out, so null stays invalid.
const RESERVED: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Trap {
    #[error("no function named {0}")]
    NoSuchFunction(String),
    #[error("call to {0}, which has no body and no handler")]
    Unresolved(String),
    #[error("out of bounds access of {len} bytes at {addr:#x}")]
    OutOfBounds { addr: u64, len: u64 },
    #[error("step budget exhausted")]
    StepBudget,
    #[error("reached unreachable in {0}")]
    Unreachable(String),
    #[error("unwinding out of {0} is not supported")]
    Unwind(String),
    #[error("malformed IR in {function}: {reason}")]
    Malformed { function: String, reason: String },
}

/// An external function implemented in Rust.
pub type Handler = Box<dyn FnMut(&mut Memory, &[u64]) -> Result<u64, Trap>>;

#[derive(Debug, Default)]
pub struct Memory {
    bytes: Vec<u8>,
}

impl Memory {
    fn new() -> Self {
        Self {
            bytes: vec![0; RESERVED],
        }
    }

    /// Allocates `size` zeroed bytes, 8-aligned.
    pub fn alloc(&mut self, size: u64) -> u64 {
        let start = self.bytes.len().next_multiple_of(8);
        self.bytes.resize(start + size.max(1) as usize, 0);
        start as u64
    }

    pub fn alloc_bytes(&mut self, data: &[u8]) -> u64 {
        let addr = self.alloc(data.len() as u64);
        self.bytes[addr as usize..addr as usize + data.len()].copy_from_slice(data);
        addr
    }

    fn range(&self, addr: u64, len: u64) -> Result<std::ops::Range<usize>, Trap> {
        let end = addr.checked_add(len);
        match end {
            Some(end) if addr as usize >= RESERVED && end as usize <= self.bytes.len() => {
                Ok(addr as usize..end as usize)
            }
            _ => Err(Trap::OutOfBounds { addr, len }),
        }
    }

    pub fn read(&self, addr: u64, len: u64) -> Result<&[u8], Trap> {
        Ok(&self.bytes[self.range(addr, len)?])
    }

    pub fn write(&mut self, addr: u64, data: &[u8]) -> Result<(), Trap> {
        let range = self.range(addr, data.len() as u64)?;
        self.bytes[range].copy_from_slice(data);
        Ok(())
    }

    pub fn read_uint(&self, addr: u64, size: u64) -> Result<u64, Trap> {
        let mut buf = [0u8; 8];
        buf[..size as usize].copy_from_slice(self.read(addr, size)?);
        Ok(u64::from_le_bytes(buf))
    }

    pub fn write_uint(&mut self, addr: u64, size: u64, value: u64) -> Result<(), Trap> {
        self.write(addr, &value.to_le_bytes()[..size as usize])
    }

    pub fn byte(&self, addr: u64) -> Result<u8, Trap> {
        Ok(self.read(addr, 1)?[0])
    }
}

pub struct Machine<'m> {
    module: &'m Module,
    pub memory: Memory,
    globals: Vec<u64>,
    handlers: HashMap<String, Handler>,
    /// Identifiers passed to the trace hook, in execution order.
    pub trace: Vec<u32>,
    coverage: Option<(u64, u64)>,
    steps_left: u64,
}

impl<'m> Machine<'m> {
    pub fn new(module: &'m Module) -> Self {
        let mut memory = Memory::new();
        let mut globals = Vec::with_capacity(module.globals.len());
        for global in &module.globals {
            let addr = match &global.init {
                Some(init) => memory.alloc_bytes(&init.to_bytes()),
                None => memory.alloc(8),
            };
            globals.push(addr);
        }
        Self {
            module,
            memory,
            globals,
            handlers: HashMap::new(),
            trace: Vec::new(),
            coverage: None,
            steps_left: 1_000_000,
        }
    }

    /// Allocates a coverage map and stores its address in the map pointer
    /// global, if the module has one.
    pub fn with_coverage_map(mut self, size: u32) -> Self {
        let base = self.memory.alloc(u64::from(size));
        if let Some(id) = self.module.find_global(AFL_AREA_PTR) {
            let slot = self.globals[id.index()];
            // The slot was allocated above, so the write is in bounds.
            let _ = self.memory.write_uint(slot, 8, base);
        }
        self.coverage = Some((base, u64::from(size)));
        self
    }

    pub fn coverage(&self) -> &[u8] {
        match self.coverage {
            Some((base, size)) => self.memory.read(base, size).unwrap_or(&[]),
            None => &[],
        }
    }

    pub fn reset_coverage(&mut self) {
        if let Some((base, size)) = self.coverage {
            let _ = self.memory.write(base, &vec![0; size as usize]);
        }
    }

    pub fn set_step_budget(&mut self, steps: u64) {
        self.steps_left = steps;
    }

    pub fn register(&mut self, name: &str, handler: Handler) {
        self.handlers.insert(name.to_string(), handler);
    }

    pub fn global_addr(&self, name: &str) -> Option<u64> {
        self.module
            .find_global(name)
            .map(|id| self.globals[id.index()])
    }

    /// Calls the function named `name` with raw argument values.
    pub fn call(&mut self, name: &str, args: &[u64]) -> Result<u64, Trap> {
        let id = self
            .module
            .find_function(name)
            .ok_or_else(|| Trap::NoSuchFunction(name.to_string()))?;
        self.call_id(id, args)
    }

    fn call_id(&mut self, id: FuncId, args: &[u64]) -> Result<u64, Trap> {
        let func = self.module.function(id);
        if !func.is_declaration() {
            return self.execute(func, args);
        }
        let name = func.name.as_str();
        let ret_width = func.ret.int_width().unwrap_or(64);
        let arg = |i: usize| args.get(i).copied().unwrap_or(0);
        let result = match name {
            "strcmp" => c_compare(&self.memory, arg(0), arg(1), None, false)?,
            "strcasecmp" => c_compare(&self.memory, arg(0), arg(1), None, true)?,
            "strncmp" => c_compare(&self.memory, arg(0), arg(1), Some(arg(2)), false)?,
            "strncasecmp" => c_compare(&self.memory, arg(0), arg(1), Some(arg(2)), true)?,
            "memcmp" => mem_compare(&self.memory, arg(0), arg(1), arg(2))?,
            _ if name.starts_with("llvm.memcpy") => {
                let data = self.memory.read(arg(1), arg(2))?.to_vec();
                self.memory.write(arg(0), &data)?;
                0
            }
            _ if name == AFL_BB_TRACE => {
                self.trace.push(arg(0) as u32);
                0
            }
            _ => match self.handlers.get_mut(name) {
                Some(handler) => handler(&mut self.memory, args)? as i64,
                None => return Err(Trap::Unresolved(name.to_string())),
            },
        };
        Ok(mask(ret_width, result as u64))
    }

    fn execute(&mut self, func: &'m Function, args: &[u64]) -> Result<u64, Trap> {
        let malformed = |reason: String| Trap::Malformed {
            function: func.name.clone(),
            reason,
        };
        let mut frame: HashMap<InstId, u64> = HashMap::new();
        let mut block = func
            .entry()
            .ok_or_else(|| malformed("no entry block".into()))?;
        let mut prev: Option<BlockId> = None;

        loop {
            let insts = &func.block(block).insts;
            let phi_count = func.phis(block).len();
            if let Some(pred) = prev {
                // φ-nodes read their inputs simultaneously on edge entry.
                let mut incoming_values = Vec::with_capacity(phi_count);
                for &phi in &insts[..phi_count] {
                    let InstKind::Phi { incoming, .. } = func.kind(phi) else {
                        unreachable!("phis() returns φ-nodes only");
                    };
                    let (value, _) = incoming
                        .iter()
                        .find(|(_, from)| *from == pred)
                        .ok_or_else(|| malformed(format!("φ %{} has no entry for {pred:?}", phi.0)))?;
                    incoming_values.push((phi, self.eval(func, &frame, args, value)?));
                }
                frame.extend(incoming_values);
            }

            for &inst in &insts[phi_count..] {
                self.tick()?;
                let value = self.step(func, &frame, args, inst)?;
                frame.insert(inst, value);
            }

            self.tick()?;
            let next = match &func.block(block).term {
                Terminator::Ret(value) => {
                    return match value {
                        Some(value) => self.eval(func, &frame, args, value),
                        None => Ok(0),
                    };
                }
                Terminator::Br(target) => *target,
                Terminator::CondBr {
                    cond,
                    on_true,
                    on_false,
                } => {
                    if self.eval(func, &frame, args, cond)? & 1 == 1 {
                        *on_true
                    } else {
                        *on_false
                    }
                }
                Terminator::Switch {
                    value,
                    default,
                    cases,
                } => {
                    let width = func.int_width(value).unwrap_or(64);
                    let value = mask(width, self.eval(func, &frame, args, value)?);
                    cases
                        .iter()
                        .find(|(case, _)| mask(width, *case) == value)
                        .map_or(*default, |(_, target)| *target)
                }
                Terminator::Invoke {
                    callee,
                    args: call_args,
                    normal,
                    ..
                } => {
                    self.perform_call(func, &frame, args, callee, call_args)?;
                    *normal
                }
                Terminator::Resume(_) => return Err(Trap::Unwind(func.name.clone())),
                Terminator::Unreachable => return Err(Trap::Unreachable(func.name.clone())),
            };
            prev = Some(block);
            block = next;
        }
    }

    fn tick(&mut self) -> Result<(), Trap> {
        if self.steps_left == 0 {
            return Err(Trap::StepBudget);
        }
        self.steps_left -= 1;
        Ok(())
    }

    fn eval(
        &self,
        func: &Function,
        frame: &HashMap<InstId, u64>,
        args: &[u64],
        value: &Value,
    ) -> Result<u64, Trap> {
        Ok(match value {
            Value::Inst(id) => *frame.get(id).ok_or_else(|| Trap::Malformed {
                function: func.name.clone(),
                reason: format!("%{} read before it was computed", id.0),
            })?,
            Value::Arg(index) => args.get(*index as usize).copied().unwrap_or(0),
            Value::Const(Constant::Int { bits, .. }) => *bits,
            Value::Const(Constant::Null) => 0,
            Value::Global(id) => self.globals[id.index()],
            Value::Func(id) => FUNC_BASE + u64::from(id.0),
        })
    }

    fn step(
        &mut self,
        func: &'m Function,
        frame: &HashMap<InstId, u64>,
        args: &[u64],
        inst: InstId,
    ) -> Result<u64, Trap> {
        let eval = |value: &Value| self.eval(func, frame, args, value);
        Ok(match func.kind(inst) {
            InstKind::Phi { .. } => {
                return Err(Trap::Malformed {
                    function: func.name.clone(),
                    reason: format!("φ %{} after a non-φ instruction", inst.0),
                });
            }
            InstKind::LandingPad => 0,
            InstKind::Icmp { pred, lhs, rhs } => {
                let width = func.int_width(lhs).unwrap_or(64);
                u64::from(pred.evaluate(width, eval(lhs)?, eval(rhs)?))
            }
            InstKind::Binary { op, lhs, rhs } => {
                let width = func.inst_type(inst).int_width().unwrap_or(64);
                op.evaluate(width, eval(lhs)?, eval(rhs)?)
            }
            InstKind::Cast { op, value, to } => {
                let from = func.int_width(value).unwrap_or(64);
                let bits = mask(from, eval(value)?);
                match op {
                    CastOp::Trunc | CastOp::ZExt => mask(*to, bits),
                    CastOp::SExt => mask(*to, sign_extend(from, bits) as u64),
                }
            }
            InstKind::Select {
                cond,
                on_true,
                on_false,
            } => {
                if eval(cond)? & 1 == 1 {
                    eval(on_true)?
                } else {
                    eval(on_false)?
                }
            }
            InstKind::Load { ty, ptr } => {
                let raw = self.memory.read_uint(eval(ptr)?, ty.store_size())?;
                match ty {
                    Type::Int(width) => mask(*width, raw),
                    _ => raw,
                }
            }
            InstKind::Store { value, ptr } => {
                let size = func.value_type(value).store_size();
                let (value, ptr) = (eval(value)?, eval(ptr)?);
                self.memory.write_uint(ptr, size, value)?;
                0
            }
            InstKind::Gep { base, offset } => {
                let width = func.int_width(offset).unwrap_or(64);
                let offset = sign_extend(width, eval(offset)?);
                eval(base)?.wrapping_add(offset as u64)
            }
            InstKind::Alloca { size } => self.memory.alloc(u64::from(*size)),
            InstKind::Call {
                callee,
                args: call_args,
                ..
            } => self.perform_call(func, frame, args, callee, call_args)?,
        })
    }

    fn perform_call(
        &mut self,
        func: &'m Function,
        frame: &HashMap<InstId, u64>,
        args: &[u64],
        callee: &Callee,
        call_args: &[Value],
    ) -> Result<u64, Trap> {
        let values = call_args
            .iter()
            .map(|arg| self.eval(func, frame, args, arg))
            .collect::<Result<Vec<_>, _>>()?;
        let target = match callee {
            Callee::Direct(id) => *id,
            Callee::Indirect(value) => {
                let addr = self.eval(func, frame, args, value)?;
                let index = addr.checked_sub(FUNC_BASE).filter(|i| {
                    (*i as usize) < self.module.functions.len()
                });
                match index {
                    Some(index) => FuncId(index as u32),
                    None => return Err(Trap::OutOfBounds { addr, len: 0 }),
                }
            }
        };
        self.call_id(target, &values)
    }
}

fn fold(byte: u8, ignore_case: bool) -> u8 {
    if ignore_case {
        byte.to_ascii_lowercase()
    } else {
        byte
    }
}

/// `strcmp`-family semantics on unsigned chars.
fn c_compare(
    memory: &Memory,
    lhs: u64,
    rhs: u64,
    limit: Option<u64>,
    ignore_case: bool,
) -> Result<i64, Trap> {
    let mut i = 0u64;
    while limit.is_none_or(|n| i < n) {
        let a = fold(memory.byte(lhs + i)?, ignore_case);
        let b = fold(memory.byte(rhs + i)?, ignore_case);
        if a != b || a == 0 {
            return Ok(i64::from(a) - i64::from(b));
        }
        i += 1;
    }
    Ok(0)
}

fn mem_compare(memory: &Memory, lhs: u64, rhs: u64, len: u64) -> Result<i64, Trap> {
    let (a, b) = (memory.read(lhs, len)?, memory.read(rhs, len)?);
    Ok(a.iter()
        .zip(b)
        .find(|(x, y)| x != y)
        .map_or(0, |(x, y)| i64::from(*x) - i64::from(*y)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::FunctionBuilder;
    use crate::ir::{Global, Init, Predicate};

    #[test]
    fn runs_loops_and_phis() {
        let mut module = Module::new("m");
        let mut b = FunctionBuilder::new("sum", vec![Type::I32], Type::I32);
        let entry = b.create_block("entry");
        let head = b.create_block("head");
        let exit = b.create_block("exit");
        b.switch_to(entry);
        b.br(head);
        b.switch_to(head);
        let i = b.phi(Type::I32, vec![(Value::int(32, 0), entry)]);
        let acc = b.phi(Type::I32, vec![(Value::int(32, 0), entry)]);
        let acc_next = b.add(acc.clone(), i.clone());
        let i_next = b.add(i.clone(), Value::int(32, 1));
        let done = b.icmp(Predicate::Ugt, i_next.clone(), Value::Arg(0));
        b.cond_br(done, exit, head);
        b.switch_to(exit);
        b.ret(Some(acc_next.clone()));
        let mut func = b.finish();
        for (phi, next) in [(i, i_next), (acc, acc_next)] {
            if let InstKind::Phi { incoming, .. } = &mut func.inst_mut(phi.as_inst().unwrap()).kind {
                incoming.push((next, head));
            }
        }
        module.add_function(func);

        let mut machine = Machine::new(&module);
        assert_eq!(machine.call("sum", &[4]), Ok(10));
    }

    #[test]
    fn string_builtins_follow_libc() {
        let mut module = Module::new("m");
        module.add_function(crate::ir::Function::declare(
            "strcmp",
            vec![Type::Ptr, Type::Ptr],
            Type::I32,
        ));
        module.add_function(crate::ir::Function::declare(
            "strncasecmp",
            vec![Type::Ptr, Type::Ptr, Type::I64],
            Type::I32,
        ));
        let mut machine = Machine::new(&module);
        let a = machine.memory.alloc_bytes(b"AB\0");
        let b = machine.memory.alloc_bytes(b"AC\0");
        let c = machine.memory.alloc_bytes(b"ab\xff\0");
        let neg = machine.call("strcmp", &[a, b]).unwrap();
        assert!(sign_extend(32, neg) < 0);
        assert_eq!(machine.call("strncasecmp", &[a, c, 2]), Ok(0));
        let pos = machine.call("strncasecmp", &[c, a, 3]).unwrap();
        assert!(sign_extend(32, pos) > 0);
    }

    #[test]
    fn globals_are_materialized() {
        let mut module = Module::new("m");
        let global = module.add_global(Global {
            name: "word".into(),
            constant: true,
            thread_local: false,
            init: Some(Init::Int {
                width: 32,
                bits: 0xdead_beef,
            }),
        });
        let mut b = FunctionBuilder::new("read", vec![], Type::I32);
        let entry = b.create_block("entry");
        b.switch_to(entry);
        let value = b.load(Type::I32, Value::Global(global));
        b.ret(Some(value));
        module.add_function(b.finish());
        assert_eq!(Machine::new(&module).call("read", &[]), Ok(0xdead_beef));
    }

    #[test]
    fn step_budget_stops_infinite_loops() {
        let mut module = Module::new("m");
        let mut b = FunctionBuilder::new("spin", vec![], Type::Void);
        let entry = b.create_block("entry");
        b.switch_to(entry);
        b.br(entry);
        module.add_function(b.finish());
        let mut machine = Machine::new(&module);
        machine.set_step_budget(100);
        assert_eq!(machine.call("spin", &[]), Err(Trap::StepBudget));
    }
}
