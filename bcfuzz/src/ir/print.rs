//! LLVM-flavoured text form, for logs and test failure messages.

use std::fmt::{self, Display, Formatter};

use super::{Callee, Constant, FuncId, Function, Init, InstKind, Module, Terminator, Type, Value};

impl Display for Type {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Type::Void => write!(f, "void"),
            Type::Int(width) => write!(f, "i{width}"),
            Type::Ptr => write!(f, "ptr"),
        }
    }
}

struct Operand<'a>(&'a Module, &'a Function, &'a Value);

impl Display for Operand<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let Operand(module, func, value) = *self;
        match value {
            Value::Inst(id) => {
                let name = &func.inst(*id).name;
                if name.is_empty() {
                    write!(f, "%{}", id.0)
                } else {
                    write!(f, "%{}.{name}", id.0)
                }
            }
            Value::Arg(index) => write!(f, "%arg{index}"),
            Value::Const(Constant::Int { width, bits }) => write!(f, "i{width} {bits}"),
            Value::Const(Constant::Null) => write!(f, "null"),
            Value::Global(id) => write!(f, "@{}", module.global(*id).name),
            Value::Func(id) => write!(f, "@{}", module.function(*id).name),
        }
    }
}

fn callee_name<'a>(module: &'a Module, func: &'a Function, callee: &'a Callee) -> String {
    match callee {
        Callee::Direct(id) => format!("@{}", module.function(*id).name),
        Callee::Indirect(value) => Operand(module, func, value).to_string(),
    }
}

fn args(module: &Module, func: &Function, args: &[Value]) -> String {
    args.iter()
        .map(|arg| Operand(module, func, arg).to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Display adapter for one function of a module.
pub struct FunctionDisplay<'a> {
    module: &'a Module,
    id: FuncId,
}

impl Module {
    pub fn display_function(&self, id: FuncId) -> FunctionDisplay<'_> {
        FunctionDisplay { module: self, id }
    }
}

impl Display for FunctionDisplay<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let module = self.module;
        let func = module.function(self.id);
        let params = func
            .params
            .iter()
            .enumerate()
            .map(|(i, ty)| format!("{ty} %arg{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        if func.is_declaration() {
            return writeln!(f, "declare {} @{}({params})", func.ret, func.name);
        }
        writeln!(f, "define {} @{}({params}) {{", func.ret, func.name)?;
        for &block in &func.layout {
            let data = func.block(block);
            writeln!(f, "{}:    ; b{}", data.name, block.0)?;
            for &inst in &data.insts {
                let op = |value| Operand(module, func, value);
                let lhs = Operand(module, func, &Value::Inst(inst));
                let text = match func.kind(inst) {
                    InstKind::Phi { ty, incoming } => {
                        let incoming = incoming
                            .iter()
                            .map(|(value, pred)| format!("[ {}, %{} ]", op(value), func.block(*pred).name))
                            .collect::<Vec<_>>()
                            .join(", ");
                        format!("{lhs} = phi {ty} {incoming}")
                    }
                    InstKind::LandingPad => format!("{lhs} = landingpad"),
                    InstKind::Icmp { pred, lhs: a, rhs: b } => {
                        format!("{lhs} = icmp {} {}, {}", pred.mnemonic(), op(a), op(b))
                    }
                    InstKind::Binary { op: bin, lhs: a, rhs: b } => {
                        format!("{lhs} = {} {}, {}", bin.mnemonic(), op(a), op(b))
                    }
                    InstKind::Cast { op: cast, value, to } => {
                        format!("{lhs} = {} {} to i{to}", cast.mnemonic(), op(value))
                    }
                    InstKind::Select { cond, on_true, on_false } => format!(
                        "{lhs} = select {}, {}, {}",
                        op(cond),
                        op(on_true),
                        op(on_false)
                    ),
                    InstKind::Load { ty, ptr } => format!("{lhs} = load {ty}, {}", op(ptr)),
                    InstKind::Store { value, ptr } => format!("store {}, {}", op(value), op(ptr)),
                    InstKind::Gep { base, offset } => {
                        format!("{lhs} = getelementptr i8, {}, {}", op(base), op(offset))
                    }
                    InstKind::Alloca { size } => format!("{lhs} = alloca [{size} x i8]"),
                    InstKind::Call { callee, args: a, ret } => {
                        let call = format!("call {ret} {}({})", callee_name(module, func, callee), args(module, func, a));
                        if *ret == Type::Void {
                            call
                        } else {
                            format!("{lhs} = {call}")
                        }
                    }
                };
                let split = if func.inst(inst).split { " ; split" } else { "" };
                writeln!(f, "  {text}{split}")?;
            }
            let name = |b: &super::BlockId| format!("%{}", func.block(*b).name);
            let term = match &data.term {
                Terminator::Ret(None) => "ret void".to_string(),
                Terminator::Ret(Some(value)) => format!("ret {}", Operand(module, func, value)),
                Terminator::Br(target) => format!("br label {}", name(target)),
                Terminator::CondBr { cond, on_true, on_false } => format!(
                    "br {}, label {}, label {}",
                    Operand(module, func, cond),
                    name(on_true),
                    name(on_false)
                ),
                Terminator::Switch { value, default, cases } => {
                    let cases = cases
                        .iter()
                        .map(|(v, b)| format!("{v} -> {}", name(b)))
                        .collect::<Vec<_>>()
                        .join(", ");
                    format!("switch {}, label {} [{cases}]", Operand(module, func, value), name(default))
                }
                Terminator::Invoke { callee, args: a, normal, unwind } => format!(
                    "invoke {}({}) to label {} unwind label {}",
                    callee_name(module, func, callee),
                    args(module, func, a),
                    name(normal),
                    name(unwind)
                ),
                Terminator::Resume(value) => format!("resume {}", Operand(module, func, value)),
                Terminator::Unreachable => "unreachable".to_string(),
            };
            writeln!(f, "  {term}")?;
        }
        writeln!(f, "}}")
    }
}

impl Display for Module {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(f, "; module {}", self.name)?;
        for global in &self.globals {
            let kind = if global.constant { "constant" } else { "global" };
            let tls = if global.thread_local { "thread_local " } else { "" };
            match &global.init {
                None => writeln!(f, "@{} = external {tls}{kind}", global.name)?,
                Some(Init::Bytes(bytes)) => writeln!(
                    f,
                    "@{} = {tls}{kind} c\"{}\"",
                    global.name,
                    bytes.escape_ascii()
                )?,
                Some(init) => writeln!(f, "@{} = {tls}{kind} {init:?}", global.name)?,
            }
        }
        for id in self.function_ids() {
            write!(f, "{}", self.display_function(id))?;
        }
        Ok(())
    }
}
