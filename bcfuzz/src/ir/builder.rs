//! Block-by-block construction of functions.

use super::{
    BinOp, BlockId, CallConv, Callee, CastOp, DebugLoc, FuncId, Function, InstKind, Module,
    Predicate, Terminator, Type, Value,
};

/// Builds a [`Function`] by appending instructions to a current block.
///
/// ```
/// use bcfuzz::ir::builder::FunctionBuilder;
/// use bcfuzz::ir::{Module, Type, Value};
///
/// let mut module = Module::new("m");
/// let mut b = FunctionBuilder::new("answer", vec![], Type::I32);
/// let entry = b.create_block("entry");
/// b.switch_to(entry);
/// b.ret(Some(Value::int(32, 42)));
/// let id = b.finish_module(&mut module);
/// assert_eq!(module.function(id).name, "answer");
/// ```
pub struct FunctionBuilder {
    func: Function,
    current: Option<BlockId>,
    loc: Option<DebugLoc>,
}

impl FunctionBuilder {
    pub fn new(name: impl Into<String>, params: Vec<Type>, ret: Type) -> Self {
        Self {
            func: Function::declare(name, params, ret),
            current: None,
            loc: None,
        }
    }

    pub fn conv(mut self, conv: CallConv) -> Self {
        self.func.conv = conv;
        self
    }

    pub fn metadata(&mut self, key: &str, value: &str) -> &mut Self {
        self.func.metadata.insert(key.to_string(), value.to_string());
        self
    }

    pub fn create_block(&mut self, name: &str) -> BlockId {
        self.func.add_block(name, None)
    }

    pub fn switch_to(&mut self, block: BlockId) {
        self.current = Some(block);
    }

    /// Debug location given to every following instruction.
    pub fn set_loc(&mut self, loc: Option<DebugLoc>) {
        self.loc = loc;
    }

    fn current(&self) -> BlockId {
        match self.current {
            Some(block) => block,
            None => panic!("FunctionBuilder used before switch_to"),
        }
    }

    pub fn push(&mut self, kind: InstKind, name: &str) -> Value {
        let block = self.current();
        Value::Inst(self.func.push_inst(block, kind, name, self.loc.clone()))
    }

    pub fn icmp(&mut self, pred: Predicate, lhs: Value, rhs: Value) -> Value {
        self.push(InstKind::Icmp { pred, lhs, rhs }, "")
    }

    pub fn binary(&mut self, op: BinOp, lhs: Value, rhs: Value) -> Value {
        self.push(InstKind::Binary { op, lhs, rhs }, "")
    }

    pub fn add(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(BinOp::Add, lhs, rhs)
    }

    pub fn sub(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(BinOp::Sub, lhs, rhs)
    }

    pub fn cast(&mut self, op: CastOp, value: Value, to: u32) -> Value {
        self.push(InstKind::Cast { op, value, to }, "")
    }

    pub fn select(&mut self, cond: Value, on_true: Value, on_false: Value) -> Value {
        self.push(
            InstKind::Select {
                cond,
                on_true,
                on_false,
            },
            "",
        )
    }

    pub fn load(&mut self, ty: Type, ptr: Value) -> Value {
        self.push(InstKind::Load { ty, ptr }, "")
    }

    pub fn store(&mut self, value: Value, ptr: Value) -> Value {
        self.push(InstKind::Store { value, ptr }, "")
    }

    pub fn gep(&mut self, base: Value, offset: u64) -> Value {
        self.push(
            InstKind::Gep {
                base,
                offset: Value::int(64, offset),
            },
            "",
        )
    }

    pub fn alloca(&mut self, size: u32) -> Value {
        self.push(InstKind::Alloca { size }, "")
    }

    pub fn call(&mut self, callee: FuncId, args: Vec<Value>, ret: Type) -> Value {
        self.push(
            InstKind::Call {
                callee: Callee::Direct(callee),
                args,
                ret,
            },
            "",
        )
    }

    pub fn phi(&mut self, ty: Type, incoming: Vec<(Value, BlockId)>) -> Value {
        self.push(InstKind::Phi { ty, incoming }, "")
    }

    pub fn landing_pad(&mut self) -> Value {
        self.push(InstKind::LandingPad, "")
    }

    fn terminate(&mut self, term: Terminator) {
        let block = self.current();
        self.func.set_terminator(block, term);
    }

    pub fn ret(&mut self, value: Option<Value>) {
        self.terminate(Terminator::Ret(value));
    }

    pub fn br(&mut self, target: BlockId) {
        self.terminate(Terminator::Br(target));
    }

    pub fn cond_br(&mut self, cond: Value, on_true: BlockId, on_false: BlockId) {
        self.terminate(Terminator::CondBr {
            cond,
            on_true,
            on_false,
        });
    }

    pub fn switch(&mut self, value: Value, default: BlockId, cases: Vec<(u64, BlockId)>) {
        self.terminate(Terminator::Switch {
            value,
            default,
            cases,
        });
    }

    pub fn invoke(&mut self, callee: FuncId, args: Vec<Value>, normal: BlockId, unwind: BlockId) {
        self.terminate(Terminator::Invoke {
            callee: Callee::Direct(callee),
            args,
            normal,
            unwind,
        });
    }

    pub fn resume(&mut self, value: Value) {
        self.terminate(Terminator::Resume(value));
    }

    pub fn unreachable(&mut self) {
        self.terminate(Terminator::Unreachable);
    }

    pub fn finish(self) -> Function {
        self.func
    }

    /// Adds the function to `module`, replacing a declaration of the same
    /// name so that existing calls resolve to the new body.
    pub fn finish_module(self, module: &mut Module) -> FuncId {
        match module.find_function(&self.func.name) {
            Some(id) if module.function(id).is_declaration() => {
                *module.function_mut(id) = self.func;
                id
            }
            _ => module.add_function(self.func),
        }
    }
}
