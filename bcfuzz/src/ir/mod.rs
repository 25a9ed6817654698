//! The intermediate representation the instrumentation passes operate on.
//!
//! A [`Module`] owns globals and functions. Each [`Function`] is an arena of
//! blocks and an arena of instructions, both addressed by stable indices
//! ([`BlockId`], [`InstId`]). An instruction keeps its identity for its whole
//! life: rewriting an instruction in place (for example turning a comparison
//! into the φ-join of its decomposed chain) keeps every use pointing at it.
//!
//! Block order is carried separately in [`Function::layout`]; a block that is
//! not in the layout is dead. Control transfers are a closed set of
//! [`Terminator`] kinds and every other operation is an [`InstKind`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::dict::Annotations;

pub mod builder;
pub mod edit;
pub mod interp;
pub mod print;
pub mod verify;

/// Name of the intrinsic prefix. Calls to such functions are never harvested.
pub const INTRINSIC_PREFIX: &str = "llvm.";

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(pub u32);

        impl $name {
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }
    };
}

entity_id!(
    /// Index of a block inside its function's block arena.
    BlockId
);
entity_id!(
    /// Index of an instruction inside its function's instruction arena.
    InstId
);
entity_id!(
    /// Index of a global inside [`Module::globals`].
    GlobalId
);
entity_id!(
    /// Index of a function inside [`Module::functions`].
    FuncId
);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Type {
    #[default]
    Void,
    Int(u32),
    Ptr,
}

impl Type {
    pub const I1: Type = Type::Int(1);
    pub const I8: Type = Type::Int(8);
    pub const I32: Type = Type::Int(32);
    pub const I64: Type = Type::Int(64);

    pub fn int_width(self) -> Option<u32> {
        match self {
            Type::Int(width) => Some(width),
            _ => None,
        }
    }

    /// Size in bytes of a value of this type once stored in memory.
    pub fn store_size(self) -> u64 {
        match self {
            Type::Void => 0,
            Type::Int(width) => u64::from(width.div_ceil(8)),
            Type::Ptr => 8,
        }
    }
}

/// Truncates `bits` to the low `width` bits.
pub fn mask(width: u32, bits: u64) -> u64 {
    if width >= 64 {
        bits
    } else {
        bits & ((1u64 << width) - 1)
    }
}

/// Interprets the low `width` bits of `bits` as a two's complement number.
pub fn sign_extend(width: u32, bits: u64) -> i64 {
    if width == 0 || width >= 64 {
        return bits as i64;
    }
    let shift = 64 - width;
    ((bits << shift) as i64) >> shift
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Constant {
    Int { width: u32, bits: u64 },
    Null,
}

impl Constant {
    pub fn int(width: u32, value: u64) -> Self {
        Constant::Int {
            width,
            bits: mask(width, value),
        }
    }

    pub fn bool(value: bool) -> Self {
        Constant::int(1, u64::from(value))
    }

    pub fn is_zero(&self) -> bool {
        matches!(self, Constant::Int { bits: 0, .. })
    }

    pub fn is_one(&self) -> bool {
        matches!(self, Constant::Int { bits: 1, .. })
    }

    pub fn is_minus_one(&self) -> bool {
        match *self {
            Constant::Int { width, bits } => bits == mask(width, u64::MAX),
            Constant::Null => false,
        }
    }

    /// Little-endian byte pattern of an integer constant, `width / 8` bytes long.
    pub fn le_bytes(&self) -> Option<Vec<u8>> {
        match *self {
            Constant::Int { width, bits } if width % 8 == 0 && width <= 64 => {
                Some(bits.to_le_bytes()[..(width / 8) as usize].to_vec())
            }
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Value {
    Inst(InstId),
    Arg(u32),
    Const(Constant),
    Global(GlobalId),
    Func(FuncId),
}

impl Value {
    pub fn int(width: u32, value: u64) -> Self {
        Value::Const(Constant::int(width, value))
    }

    pub fn bool(value: bool) -> Self {
        Value::Const(Constant::bool(value))
    }

    pub fn as_const(&self) -> Option<&Constant> {
        match self {
            Value::Const(constant) => Some(constant),
            _ => None,
        }
    }

    pub fn as_inst(&self) -> Option<InstId> {
        match *self {
            Value::Inst(id) => Some(id),
            _ => None,
        }
    }

    pub fn is_const_int(&self) -> bool {
        matches!(self, Value::Const(Constant::Int { .. }))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Predicate {
    Eq,
    Ne,
    Ugt,
    Uge,
    Ult,
    Ule,
    Sgt,
    Sge,
    Slt,
    Sle,
}

impl Predicate {
    pub fn is_equality(self) -> bool {
        matches!(self, Predicate::Eq | Predicate::Ne)
    }

    pub fn evaluate(self, width: u32, lhs: u64, rhs: u64) -> bool {
        let (lhs, rhs) = (mask(width, lhs), mask(width, rhs));
        let (slhs, srhs) = (sign_extend(width, lhs), sign_extend(width, rhs));
        match self {
            Predicate::Eq => lhs == rhs,
            Predicate::Ne => lhs != rhs,
            Predicate::Ugt => lhs > rhs,
            Predicate::Uge => lhs >= rhs,
            Predicate::Ult => lhs < rhs,
            Predicate::Ule => lhs <= rhs,
            Predicate::Sgt => slhs > srhs,
            Predicate::Sge => slhs >= srhs,
            Predicate::Slt => slhs < srhs,
            Predicate::Sle => slhs <= srhs,
        }
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            Predicate::Eq => "eq",
            Predicate::Ne => "ne",
            Predicate::Ugt => "ugt",
            Predicate::Uge => "uge",
            Predicate::Ult => "ult",
            Predicate::Ule => "ule",
            Predicate::Sgt => "sgt",
            Predicate::Sge => "sge",
            Predicate::Slt => "slt",
            Predicate::Sle => "sle",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    Shl,
    LShr,
    AShr,
}

impl BinOp {
    pub fn evaluate(self, width: u32, lhs: u64, rhs: u64) -> u64 {
        let shift = rhs as u32;
        let result = match self {
            BinOp::Add => lhs.wrapping_add(rhs),
            BinOp::Sub => lhs.wrapping_sub(rhs),
            BinOp::Mul => lhs.wrapping_mul(rhs),
            BinOp::And => lhs & rhs,
            BinOp::Or => lhs | rhs,
            BinOp::Xor => lhs ^ rhs,
            BinOp::Shl => lhs.checked_shl(shift).unwrap_or(0),
            BinOp::LShr => mask(width, lhs).checked_shr(shift).unwrap_or(0),
            BinOp::AShr => {
                let value = sign_extend(width, lhs);
                (value >> shift.min(63)) as u64
            }
        };
        mask(width, result)
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            BinOp::Add => "add",
            BinOp::Sub => "sub",
            BinOp::Mul => "mul",
            BinOp::And => "and",
            BinOp::Or => "or",
            BinOp::Xor => "xor",
            BinOp::Shl => "shl",
            BinOp::LShr => "lshr",
            BinOp::AShr => "ashr",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CastOp {
    Trunc,
    ZExt,
    SExt,
}

impl CastOp {
    pub fn mnemonic(self) -> &'static str {
        match self {
            CastOp::Trunc => "trunc",
            CastOp::ZExt => "zext",
            CastOp::SExt => "sext",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Callee {
    Direct(FuncId),
    Indirect(Value),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallConv {
    #[default]
    C,
    Fast,
    Cold,
}

/// Every non-terminating operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstKind {
    Phi {
        ty: Type,
        incoming: Vec<(Value, BlockId)>,
    },
    /// Marks its block as the unwind destination of one or more invokes.
    LandingPad,
    Icmp {
        pred: Predicate,
        lhs: Value,
        rhs: Value,
    },
    Binary {
        op: BinOp,
        lhs: Value,
        rhs: Value,
    },
    Cast {
        op: CastOp,
        value: Value,
        to: u32,
    },
    Select {
        cond: Value,
        on_true: Value,
        on_false: Value,
    },
    Load {
        ty: Type,
        ptr: Value,
    },
    Store {
        value: Value,
        ptr: Value,
    },
    /// Pointer arithmetic in bytes.
    Gep {
        base: Value,
        offset: Value,
    },
    Alloca {
        size: u32,
    },
    Call {
        callee: Callee,
        args: Vec<Value>,
        ret: Type,
    },
}

impl InstKind {
    pub fn operands(&self) -> Vec<&Value> {
        match self {
            InstKind::Phi { incoming, .. } => incoming.iter().map(|(value, _)| value).collect(),
            InstKind::LandingPad | InstKind::Alloca { .. } => vec![],
            InstKind::Icmp { lhs, rhs, .. } | InstKind::Binary { lhs, rhs, .. } => vec![lhs, rhs],
            InstKind::Cast { value, .. } => vec![value],
            InstKind::Select {
                cond,
                on_true,
                on_false,
            } => vec![cond, on_true, on_false],
            InstKind::Load { ptr, .. } => vec![ptr],
            InstKind::Store { value, ptr } => vec![value, ptr],
            InstKind::Gep { base, offset } => vec![base, offset],
            InstKind::Call { callee, args, .. } => {
                let mut operands = Vec::with_capacity(args.len() + 1);
                if let Callee::Indirect(target) = callee {
                    operands.push(target);
                }
                operands.extend(args.iter());
                operands
            }
        }
    }

    pub fn is_phi(&self) -> bool {
        matches!(self, InstKind::Phi { .. })
    }
}

/// Block-ending control transfers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Terminator {
    Ret(Option<Value>),
    Br(BlockId),
    CondBr {
        cond: Value,
        on_true: BlockId,
        on_false: BlockId,
    },
    Switch {
        value: Value,
        default: BlockId,
        cases: Vec<(u64, BlockId)>,
    },
    Invoke {
        callee: Callee,
        args: Vec<Value>,
        normal: BlockId,
        unwind: BlockId,
    },
    Resume(Value),
    Unreachable,
}

impl Terminator {
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            Terminator::Ret(_) | Terminator::Resume(_) | Terminator::Unreachable => vec![],
            Terminator::Br(target) => vec![*target],
            Terminator::CondBr {
                on_true, on_false, ..
            } => vec![*on_true, *on_false],
            Terminator::Switch { default, cases, .. } => std::iter::once(*default)
                .chain(cases.iter().map(|(_, target)| *target))
                .collect(),
            Terminator::Invoke { normal, unwind, .. } => vec![*normal, *unwind],
        }
    }

    pub fn successor_mut(&mut self, index: usize) -> Option<&mut BlockId> {
        match self {
            Terminator::Ret(_) | Terminator::Resume(_) | Terminator::Unreachable => None,
            Terminator::Br(target) => (index == 0).then_some(target),
            Terminator::CondBr {
                on_true, on_false, ..
            } => match index {
                0 => Some(on_true),
                1 => Some(on_false),
                _ => None,
            },
            Terminator::Switch { default, cases, .. } => match index {
                0 => Some(default),
                _ => cases.get_mut(index - 1).map(|(_, target)| target),
            },
            Terminator::Invoke { normal, unwind, .. } => match index {
                0 => Some(normal),
                1 => Some(unwind),
                _ => None,
            },
        }
    }

    pub fn operands(&self) -> Vec<&Value> {
        match self {
            Terminator::Ret(value) => value.iter().collect(),
            Terminator::Br(_) | Terminator::Unreachable => vec![],
            Terminator::CondBr { cond, .. } => vec![cond],
            Terminator::Switch { value, .. } => vec![value],
            Terminator::Invoke { callee, args, .. } => {
                let mut operands = Vec::with_capacity(args.len() + 1);
                if let Callee::Indirect(target) = callee {
                    operands.push(target);
                }
                operands.extend(args.iter());
                operands
            }
            Terminator::Resume(value) => vec![value],
        }
    }

    pub fn mnemonic(&self) -> &'static str {
        match self {
            Terminator::Ret(_) => "ret",
            Terminator::Br(_) | Terminator::CondBr { .. } => "br",
            Terminator::Switch { .. } => "switch",
            Terminator::Invoke { .. } => "invoke",
            Terminator::Resume(_) => "resume",
            Terminator::Unreachable => "unreachable",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DebugLoc {
    pub file: String,
    pub line: u32,
}

impl DebugLoc {
    pub fn new(file: impl Into<String>, line: u32) -> Self {
        Self {
            file: file.into(),
            line,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inst {
    pub kind: InstKind,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub loc: Option<DebugLoc>,
    /// Owning block, `None` once erased.
    pub block: Option<BlockId>,
    /// Set on comparisons produced by width splitting; those are never
    /// recorded into the dictionary again.
    #[serde(default)]
    pub split: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub name: String,
    pub insts: Vec<InstId>,
    pub term: Terminator,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub params: Vec<Type>,
    pub ret: Type,
    #[serde(default)]
    pub conv: CallConv,
    #[serde(default)]
    pub blocks: Vec<Block>,
    #[serde(default)]
    pub layout: Vec<BlockId>,
    #[serde(default)]
    pub insts: Vec<Inst>,
    #[serde(default)]
    pub annotations: Annotations,
    /// String metadata, e.g. the pointer-analysis target list on `main`.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Function {
    pub fn declare(name: impl Into<String>, params: Vec<Type>, ret: Type) -> Self {
        Self {
            name: name.into(),
            params,
            ret,
            ..Default::default()
        }
    }

    pub fn is_declaration(&self) -> bool {
        self.layout.is_empty()
    }

    pub fn is_intrinsic(&self) -> bool {
        self.name.starts_with(INTRINSIC_PREFIX)
    }

    pub fn entry(&self) -> Option<BlockId> {
        self.layout.first().copied()
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.index()]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id.index()]
    }

    pub fn inst(&self, id: InstId) -> &Inst {
        &self.insts[id.index()]
    }

    pub fn inst_mut(&mut self, id: InstId) -> &mut Inst {
        &mut self.insts[id.index()]
    }

    pub fn kind(&self, id: InstId) -> &InstKind {
        &self.insts[id.index()].kind
    }

    pub fn value_type(&self, value: &Value) -> Type {
        match value {
            Value::Inst(id) => self.inst_type(*id),
            Value::Arg(index) => self
                .params
                .get(*index as usize)
                .copied()
                .unwrap_or(Type::Void),
            Value::Const(Constant::Int { width, .. }) => Type::Int(*width),
            Value::Const(Constant::Null) | Value::Global(_) | Value::Func(_) => Type::Ptr,
        }
    }

    pub fn inst_type(&self, id: InstId) -> Type {
        match self.kind(id) {
            InstKind::Phi { ty, .. } | InstKind::Load { ty, .. } => *ty,
            InstKind::LandingPad | InstKind::Gep { .. } | InstKind::Alloca { .. } => Type::Ptr,
            InstKind::Icmp { .. } => Type::I1,
            InstKind::Binary { lhs, .. } => self.value_type(lhs),
            InstKind::Cast { to, .. } => Type::Int(*to),
            InstKind::Select { on_true, .. } => self.value_type(on_true),
            InstKind::Store { .. } => Type::Void,
            InstKind::Call { ret, .. } => *ret,
        }
    }

    /// Integer width of `value`, `None` for pointers and void.
    pub fn int_width(&self, value: &Value) -> Option<u32> {
        self.value_type(value).int_width()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Init {
    Int { width: u32, bits: u64 },
    Bytes(Vec<u8>),
    Struct(Vec<Init>),
    Zero(u64),
}

impl Init {
    fn align(&self) -> u64 {
        match self {
            Init::Int { width, .. } => u64::from(width.div_ceil(8)).next_power_of_two().max(1),
            Init::Bytes(_) | Init::Zero(_) => 1,
            Init::Struct(fields) => fields.iter().map(Init::align).max().unwrap_or(1),
        }
    }

    /// Memory image of the initializer using natural alignment for fields.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Init::Int { width, bits } => {
                let size = width.div_ceil(8) as usize;
                bits.to_le_bytes()[..size.min(8)].to_vec()
            }
            Init::Bytes(bytes) => bytes.clone(),
            Init::Zero(size) => vec![0; *size as usize],
            Init::Struct(fields) => {
                let mut image = Vec::new();
                for field in fields {
                    let align = field.align() as usize;
                    image.resize(image.len().next_multiple_of(align), 0);
                    image.extend(field.to_bytes());
                }
                let align = self.align() as usize;
                image.resize(image.len().next_multiple_of(align), 0);
                image
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Global {
    pub name: String,
    #[serde(default)]
    pub constant: bool,
    #[serde(default)]
    pub thread_local: bool,
    /// `None` for globals defined elsewhere.
    #[serde(default)]
    pub init: Option<Init>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    #[serde(default)]
    pub globals: Vec<Global>,
    #[serde(default)]
    pub functions: Vec<Function>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn function(&self, id: FuncId) -> &Function {
        &self.functions[id.index()]
    }

    pub fn function_mut(&mut self, id: FuncId) -> &mut Function {
        &mut self.functions[id.index()]
    }

    pub fn global(&self, id: GlobalId) -> &Global {
        &self.globals[id.index()]
    }

    pub fn function_ids(&self) -> impl Iterator<Item = FuncId> + use<> {
        (0..self.functions.len() as u32).map(FuncId)
    }

    pub fn find_function(&self, name: &str) -> Option<FuncId> {
        self.functions
            .iter()
            .position(|function| function.name == name)
            .map(|index| FuncId(index as u32))
    }

    pub fn find_global(&self, name: &str) -> Option<GlobalId> {
        self.globals
            .iter()
            .position(|global| global.name == name)
            .map(|index| GlobalId(index as u32))
    }

    pub fn add_global(&mut self, global: Global) -> GlobalId {
        self.globals.push(global);
        GlobalId(self.globals.len() as u32 - 1)
    }

    pub fn add_function(&mut self, function: Function) -> FuncId {
        self.functions.push(function);
        FuncId(self.functions.len() as u32 - 1)
    }

    /// Returns the global named `name`, declaring an external one if missing.
    pub fn get_or_insert_global(&mut self, name: &str, thread_local: bool) -> GlobalId {
        match self.find_global(name) {
            Some(id) => id,
            None => self.add_global(Global {
                name: name.to_string(),
                constant: false,
                thread_local,
                init: None,
            }),
        }
    }

    /// Returns the function named `name`, declaring it if missing.
    pub fn get_or_insert_function(&mut self, name: &str, params: Vec<Type>, ret: Type) -> FuncId {
        match self.find_function(name) {
            Some(id) => id,
            None => self.add_function(Function::declare(name, params, ret)),
        }
    }

    /// Constant bytes a pointer value designates: a constant global with byte
    /// data, optionally offset by a constant GEP.
    pub fn constant_bytes(&self, func: &Function, value: &Value) -> Option<&[u8]> {
        match value {
            Value::Global(id) => {
                let global = self.global(*id);
                match (&global.init, global.constant) {
                    (Some(Init::Bytes(bytes)), true) => Some(bytes.as_slice()),
                    _ => None,
                }
            }
            Value::Inst(id) => match func.kind(*id) {
                InstKind::Gep {
                    base,
                    offset: Value::Const(Constant::Int { bits, .. }),
                } => self
                    .constant_bytes(func, base)
                    .and_then(|bytes| bytes.get(*bits as usize..)),
                _ => None,
            },
            _ => None,
        }
    }
}

/// Truncates a C-string view at its first NUL byte.
pub fn trim_at_nul(bytes: &[u8]) -> &[u8] {
    match bytes.iter().position(|&byte| byte == 0) {
        Some(end) => &bytes[..end],
        None => bytes,
    }
}
