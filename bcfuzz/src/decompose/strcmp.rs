//! String and memory comparison unrolling.
//!
//! A call to `strcmp`, `strncmp`, `memcmp`, `strcasecmp` or `strncasecmp`
//! whose compared length is known at compile time becomes a chain of blocks,
//! one per byte. Each block subtracts the two bytes and leaves the chain as
//! soon as they differ; a φ-node at the end takes the place of the call.

use slog::{Logger, debug, info, warn};

use super::Emitter;
use crate::config::{Config, ConvertMode, Limits};
use crate::dict::{DictEntry, Origin, provenance};
use crate::error::Fatal;
use crate::harvest::attach_to_result_users;
use crate::ir::{
    BinOp, BlockId, CallConv, Callee, CastOp, Constant, Function, InstId, InstKind, Module, Predicate,
    Terminator, Type, Value, trim_at_nul,
};

const PREFIX: &str = "S2U.";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Family {
    Strcmp,
    Strncmp,
    Memcmp,
}

impl Family {
    fn classify(name: &str) -> Option<(Family, bool)> {
        match name {
            "strcmp" => Some((Family::Strcmp, false)),
            "strcasecmp" => Some((Family::Strcmp, true)),
            "strncmp" => Some((Family::Strncmp, false)),
            "strncasecmp" => Some((Family::Strncmp, true)),
            "memcmp" => Some((Family::Memcmp, false)),
            _ => None,
        }
    }

    /// Whether the comparison stops at the first NUL.
    fn is_string(self) -> bool {
        self != Family::Memcmp
    }

    fn arity(self) -> usize {
        match self {
            Family::Strcmp => 2,
            Family::Strncmp | Family::Memcmp => 3,
        }
    }
}

/// One side of a comparison.
#[derive(Clone, Debug)]
enum Operand {
    Bytes(Vec<u8>),
    Pointer(Value),
}

#[derive(Clone, Debug)]
struct Site {
    call: InstId,
    family: Family,
    fold_case: bool,
    len: u64,
    operands: [Operand; 2],
    /// The constant bytes recorded into the dictionary, when one side is
    /// constant.
    keyword: Option<Vec<u8>>,
}

impl Site {
    fn both_variable(&self) -> bool {
        self.keyword.is_none()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StrcmpStats {
    pub strcmp: usize,
    pub strncmp: usize,
    pub memcmp: usize,
    pub both_variable: usize,
    pub recorded: usize,
}

/// Unrolls every eligible comparison call of the module, recording the
/// constant side into the dictionary.
pub fn decompose_string_compares(
    module: &mut Module,
    config: &Config,
    log: &Logger,
) -> Result<StrcmpStats, Fatal> {
    let mut stats = StrcmpStats::default();
    for id in module.function_ids() {
        let sites = collect_sites(module, module.function(id), &config.limits, log);
        let func = module.function_mut(id);
        for site in sites {
            rewrite(func, &site, config, log, &mut stats)?;
        }
    }

    for (count, what) in [
        (stats.strcmp, "STRCMP"),
        (stats.strncmp, "STRNCMP"),
        (stats.memcmp, "MEMCMP"),
    ] {
        if count == 0 {
            warn!(log, "No instrumentation {} found.", what);
        } else {
            info!(log, "Instrumented {} {}.", count, what);
        }
    }
    if stats.both_variable > 0 {
        info!(log, "Instrumented {} variable-only compare(s).", stats.both_variable);
    }
    if stats.recorded == 0 {
        warn!(log, "No entries added to DICT.");
    } else {
        info!(log, "Added {} entries to DICT.", stats.recorded);
    }
    Ok(stats)
}

fn collect_sites(module: &Module, func: &Function, limits: &Limits, log: &Logger) -> Vec<Site> {
    let mut sites = Vec::new();
    for call in func.live_insts() {
        let InstKind::Call {
            callee: Callee::Direct(target),
            args,
            ..
        } = func.kind(call)
        else {
            continue;
        };
        let target = module.function(*target);
        if target.conv != CallConv::C {
            continue;
        }
        let Some((family, fold_case)) = Family::classify(&target.name) else {
            continue;
        };
        let prototype_ok = target.ret == Type::I32
            && target.params.len() == family.arity()
            && target.params[..2].iter().all(|ty| *ty == Type::Ptr)
            && args.len() == family.arity();
        if !prototype_ok {
            continue;
        }

        let constants = [
            module.constant_bytes(func, &args[0]),
            module.constant_bytes(func, &args[1]),
        ];
        let limit = match family {
            Family::Strcmp => None,
            _ => match &args[2] {
                Value::Const(Constant::Int { bits, .. }) => Some(*bits),
                _ => continue,
            },
        };

        let (len, keyword) = match constants {
            [None, None] => {
                // Two variable strings without a bound cannot be unrolled.
                let Some(n) = limit else {
                    continue;
                };
                (n, None)
            }
            [Some(_), Some(_)] => {
                warn!(
                    log,
                    "Found comparison between two constant strings ({})!?",
                    provenance(func, call)
                );
                continue;
            }
            [Some(bytes), None] | [None, Some(bytes)] => {
                let len = if family.is_string() {
                    // The terminating NUL takes part in the comparison.
                    let with_nul = (trim_at_nul(bytes).len() + 1).min(bytes.len()) as u64;
                    limit.map_or(with_nul, |n| n.min(with_nul))
                } else {
                    let n = limit.unwrap_or(0);
                    if n > bytes.len() as u64 {
                        warn!(log, "Found a memcmp() bug ({})", provenance(func, call);
                            "length" => n, "literal" => bytes.len());
                        continue;
                    }
                    n
                };
                (len, Some(bytes[..len as usize].to_vec()))
            }
        };
        if len == 0 {
            continue;
        }
        if len > limits.max_unroll_len {
            debug!(log, "Not unrolling {} over {} bytes ({})", target.name, len, provenance(func, call);
                "limit" => limits.max_unroll_len);
            continue;
        }

        let operand = |i: usize| match constants[i] {
            Some(bytes) => Operand::Bytes(bytes.to_vec()),
            None => Operand::Pointer(args[i].clone()),
        };
        sites.push(Site {
            call,
            family,
            fold_case,
            len,
            operands: [operand(0), operand(1)],
            keyword,
        });
    }
    sites
}

/// Whether a token from the literal harvesters already sits on a user of
/// the call result.
fn has_result_entry(func: &Function, call: InstId) -> bool {
    func.inst_users(call).into_iter().any(|user| {
        func.annotations
            .get(user)
            .iter()
            .any(|e| e.origin.class() == "S2U" && e.slot.is_none())
    })
}

/// Removes the string token from the users of the call result and returns
/// the first one found.
fn take_result_entry(func: &mut Function, call: InstId) -> Option<DictEntry> {
    let mut found = None;
    for user in func.inst_users(call) {
        if !matches!(func.kind(user), InstKind::Icmp { .. } | InstKind::Phi { .. }) {
            continue;
        }
        let mut taken = func
            .annotations
            .take_matching(user, |e| e.origin.class() == "S2U" && e.slot.is_none());
        if found.is_none() && !taken.is_empty() {
            found = Some(taken.remove(0));
        }
    }
    found
}

fn rewrite(
    func: &mut Function,
    site: &Site,
    config: &Config,
    log: &Logger,
    stats: &mut StrcmpStats,
) -> Result<(), Fatal> {
    if let Some(keyword) = &site.keyword {
        let entry = DictEntry::new(
            keyword,
            true,
            provenance(func, site.call),
            Origin::ComparedString,
            &config.limits,
            log,
        );
        if let Some(entry) = entry {
            stats.recorded += attach_to_result_users(func, site.call, &entry, &config.limits)?;
        }
        if config.convert != ConvertMode::All {
            return Ok(());
        }
    }
    match config.convert {
        ConvertMode::None => return Ok(()),
        ConvertMode::NotDict if has_result_entry(func, site.call) => return Ok(()),
        _ => {}
    }

    match site.family {
        Family::Strcmp => stats.strcmp += 1,
        Family::Strncmp => stats.strncmp += 1,
        Family::Memcmp => stats.memcmp += 1,
    }
    if site.both_variable() {
        stats.both_variable += 1;
    }

    let entry = take_result_entry(func, site.call);
    let mut e = Emitter::new(func, PREFIX, site.call);
    let Some((head, end)) = e.split_at(site.call, "End") else {
        return Ok(());
    };
    let mut next = e.block_before("New.Cmp", end);
    e.func.set_terminator(head, Terminator::Br(next));

    let mut incoming = Vec::with_capacity(site.len as usize);
    for i in 0..site.len {
        let current = next;
        let lhs = byte_at(&mut e, current, &site.operands[0], i, site.fold_case);
        let rhs = byte_at(&mut e, current, &site.operands[1], i, site.fold_case);
        let diff = e.emit(
            current,
            InstKind::Binary {
                op: BinOp::Sub,
                lhs: lhs.clone(),
                rhs,
            },
            "Diff",
        );
        if i == 0 {
            if let (Some(entry), Some(diff)) = (entry.clone(), diff.as_inst()) {
                let name = e.func.name.clone();
                e.func
                    .annotations
                    .attach(diff, entry, &config.limits, &name)?;
            }
        }
        incoming.push((diff.clone(), current));

        if i + 1 < site.len {
            next = e.block_before("New.Cmp", end);
            let mut keep_going = e.emit(
                current,
                InstKind::Icmp {
                    pred: Predicate::Eq,
                    lhs: diff,
                    rhs: Value::int(32, 0),
                },
                "Same",
            );
            if site.family.is_string() && site.both_variable() {
                let not_end = e.emit(
                    current,
                    InstKind::Icmp {
                        pred: Predicate::Ne,
                        lhs,
                        rhs: Value::int(32, 0),
                    },
                    "NotNul",
                );
                keep_going = e.emit(
                    current,
                    InstKind::Binary {
                        op: BinOp::And,
                        lhs: keep_going,
                        rhs: not_end,
                    },
                    "Continue",
                );
            }
            e.func.set_terminator(
                current,
                Terminator::CondBr {
                    cond: keep_going,
                    on_true: next,
                    on_false: end,
                },
            );
        } else {
            e.func.set_terminator(current, Terminator::Br(end));
        }
    }

    e.func.replace_kind(
        site.call,
        InstKind::Phi {
            ty: Type::I32,
            incoming,
        },
    );
    Ok(())
}

/// Byte `i` of `operand`, zero-extended to `i32` and lowered to lower case
/// when `fold_case` is set.
fn byte_at(e: &mut Emitter<'_>, block: BlockId, operand: &Operand, i: u64, fold_case: bool) -> Value {
    match operand {
        Operand::Bytes(bytes) => {
            let byte = bytes.get(i as usize).copied().unwrap_or(0);
            let byte = if fold_case {
                byte.to_ascii_lowercase()
            } else {
                byte
            };
            Value::int(32, u64::from(byte))
        }
        Operand::Pointer(ptr) => {
            let addr = e.emit(
                block,
                InstKind::Gep {
                    base: ptr.clone(),
                    offset: Value::int(64, i),
                },
                "GEP",
            );
            let byte = e.emit(block, InstKind::Load { ty: Type::I8, ptr: addr }, "Load");
            let wide = e.emit(
                block,
                InstKind::Cast {
                    op: CastOp::ZExt,
                    value: byte,
                    to: 32,
                },
                "ZExt",
            );
            if fold_case {
                fold_to_lower(e, block, wide)
            } else {
                wide
            }
        }
    }
}

/// `c - 'A' < 26 ? c + 32 : c`
fn fold_to_lower(e: &mut Emitter<'_>, block: BlockId, c: Value) -> Value {
    let offset = e.emit(
        block,
        InstKind::Binary {
            op: BinOp::Sub,
            lhs: c.clone(),
            rhs: Value::int(32, u64::from(b'A')),
        },
        "Upper.Offset",
    );
    let is_upper = e.emit(
        block,
        InstKind::Icmp {
            pred: Predicate::Ult,
            lhs: offset,
            rhs: Value::int(32, 26),
        },
        "Upper.Is",
    );
    let lowered = e.emit(
        block,
        InstKind::Binary {
            op: BinOp::Add,
            lhs: c.clone(),
            rhs: Value::int(32, 32),
        },
        "Upper.Lowered",
    );
    e.emit(
        block,
        InstKind::Select {
            cond: is_upper,
            on_true: lowered,
            on_false: c,
        },
        "Lower",
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DictType;
    use crate::ir::builder::FunctionBuilder;
    use crate::ir::interp::Machine;
    use crate::ir::verify::verify;
    use crate::ir::{FuncId, Global, Init, sign_extend};
    use crate::log::discard;

    fn config(convert: ConvertMode) -> Config {
        Config::fuzzing(DictType::Normal, convert)
    }

    /// `int check(char *input) { return strcmp(input, "AB") == 0 ? ... }`
    /// returning the raw comparison result.
    fn against_literal(callee: &str, literal: &[u8], n: Option<u64>) -> Module {
        let mut module = Module::new("m");
        let mut params = vec![Type::Ptr, Type::Ptr];
        if n.is_some() {
            params.push(Type::I64);
        }
        let cmp = module.get_or_insert_function(callee, params, Type::I32);
        let literal = Value::Global(module.add_global(Global {
            name: "literal".into(),
            constant: true,
            thread_local: false,
            init: Some(Init::Bytes(literal.to_vec())),
        }));
        let mut b = FunctionBuilder::new("check", vec![Type::Ptr], Type::I32);
        let entry = b.create_block("entry");
        b.switch_to(entry);
        let mut args = vec![Value::Arg(0), literal];
        args.extend(n.map(|n| Value::int(64, n)));
        let result = b.call(cmp, args, Type::I32);
        let eq = b.icmp(Predicate::Eq, result.clone(), Value::int(32, 0));
        let taken = b.create_block("taken");
        let done = b.create_block("done");
        b.cond_br(eq, taken, done);
        b.switch_to(taken);
        b.br(done);
        b.switch_to(done);
        b.ret(Some(result));
        module.add_function(b.finish());
        module
    }

    fn between_variables(callee: &str, n: u64) -> Module {
        let mut module = Module::new("m");
        let cmp = module.get_or_insert_function(callee, vec![Type::Ptr, Type::Ptr, Type::I64], Type::I32);
        let mut b = FunctionBuilder::new("check", vec![Type::Ptr, Type::Ptr], Type::I32);
        let entry = b.create_block("entry");
        b.switch_to(entry);
        let result = b.call(cmp, vec![Value::Arg(0), Value::Arg(1), Value::int(64, n)], Type::I32);
        b.ret(Some(result));
        module.add_function(b.finish());
        module
    }

    fn run(module: &Module, inputs: &[&[u8]]) -> i64 {
        let mut machine = Machine::new(module);
        let args: Vec<u64> = inputs
            .iter()
            .map(|input| machine.memory.alloc_bytes(input))
            .collect();
        let raw = machine.call("check", &args).unwrap();
        sign_extend(32, raw)
    }

    fn check_id(module: &Module) -> FuncId {
        module.find_function("check").unwrap()
    }

    #[test]
    fn strcmp_against_literal_unrolls_per_byte() {
        let original = against_literal("strcmp", b"AB\0", None);
        let mut split = original.clone();
        let stats =
            decompose_string_compares(&mut split, &config(ConvertMode::All), &discard()).unwrap();
        verify(&split).unwrap();
        assert_eq!(stats.strcmp, 1);
        assert_eq!(stats.recorded, 1);

        assert_eq!(run(&split, &[b"AB\0"]), 0);
        assert!(run(&split, &[b"AC\0"]) > 0);
        assert_eq!(run(&split, &[b"XY\0"]), i64::from(b'X' - b'A'));
        assert!(run(&split, &[b"ABC\0"]) > 0);
        assert!(run(&split, &[b"A\0"]) < 0);
        for input in [&b"AB\0"[..], b"AC\0", b"XY\0", b"ABC\0", b"A\0", b"\0"] {
            assert_eq!(
                run(&original, &[input]).signum(),
                run(&split, &[input]).signum(),
                "{input:?}"
            );
        }

        let func = split.function(check_id(&split));
        assert!(
            func.live_insts()
                .iter()
                .all(|inst| !matches!(func.kind(*inst), InstKind::Call { .. }))
        );
        // The token moved from the `== 0` test to the first byte step.
        let annotated: Vec<_> = func.annotations.iter().collect();
        assert_eq!(annotated.len(), 1);
        assert_eq!(annotated[0].1.value, "AB");
        assert_eq!(func.inst(annotated[0].0).name, "S2U.Diff");
    }

    #[test]
    fn case_insensitive_compares_fold_both_sides() {
        let original = against_literal("strncasecmp", b"Hello\0", Some(5));
        let mut split = original.clone();
        decompose_string_compares(&mut split, &config(ConvertMode::All), &discard()).unwrap();
        verify(&split).unwrap();
        for input in [&b"hello\0"[..], b"HELLO\0", b"HeLp!\0", b"Hellz\0", b"H\0"] {
            assert_eq!(
                run(&original, &[input]).signum(),
                run(&split, &[input]).signum(),
                "{input:?}"
            );
        }
    }

    #[test]
    fn variable_compares_need_a_length() {
        for callee in ["strncmp", "memcmp"] {
            let original = between_variables(callee, 4);
            let mut split = original.clone();
            let stats =
                decompose_string_compares(&mut split, &config(ConvertMode::All), &discard())
                    .unwrap();
            verify(&split).unwrap();
            assert_eq!(stats.both_variable, 1);
            assert_eq!(stats.recorded, 0);
            for (a, b) in [
                (&b"abcd"[..], &b"abcd"[..]),
                (b"abce", b"abcd"),
                (b"ab\0x", b"ab\0y"),
                (b"a\0\0\0", b"b\0\0\0"),
            ] {
                assert_eq!(
                    run(&original, &[a, b]).signum(),
                    run(&split, &[a, b]).signum(),
                    "{callee} {a:?} {b:?}"
                );
            }
        }
    }

    #[test]
    fn unsound_or_useless_calls_are_kept() {
        // memcmp reading past the end of its literal.
        let mut module = against_literal("memcmp", b"ABC", Some(8));
        let stats =
            decompose_string_compares(&mut module, &config(ConvertMode::All), &discard()).unwrap();
        assert_eq!(stats, StrcmpStats::default());

        // Empty literal.
        let mut module = against_literal("strncmp", b"ABC\0", Some(0));
        let stats =
            decompose_string_compares(&mut module, &config(ConvertMode::All), &discard()).unwrap();
        assert_eq!(stats.strncmp, 0);
    }

    #[test]
    fn not_dict_records_without_splitting() {
        let mut module = against_literal("strcmp", b"MAGIC\0", None);
        let stats =
            decompose_string_compares(&mut module, &config(ConvertMode::NotDict), &discard())
                .unwrap();
        assert_eq!(stats.strcmp, 0);
        assert_eq!(stats.recorded, 1);
        let func = module.function(check_id(&module));
        let (inst, entry) = func.annotations.iter().next().unwrap();
        assert!(matches!(func.kind(inst), InstKind::Icmp { .. }));
        assert_eq!(entry.tag(), "S2U_NDEBUG");
        assert_eq!(entry.value, "MAGIC");
    }

    #[test]
    fn lengths_above_the_unroll_limit_stay_calls() {
        let mut module = between_variables("memcmp", u64::MAX);
        let before = module.to_string();
        let stats =
            decompose_string_compares(&mut module, &config(ConvertMode::All), &discard()).unwrap();
        assert_eq!(stats.memcmp, 0);
        assert_eq!(module.to_string(), before);

        let small = Config {
            limits: Limits {
                max_unroll_len: 4,
                ..Limits::default()
            },
            ..config(ConvertMode::All)
        };
        let mut module = between_variables("memcmp", 5);
        let stats = decompose_string_compares(&mut module, &small, &discard()).unwrap();
        assert_eq!(stats.memcmp, 0);
        let mut module = between_variables("memcmp", 4);
        let stats = decompose_string_compares(&mut module, &small, &discard()).unwrap();
        assert_eq!(stats.memcmp, 1);
        verify(&module).unwrap();
    }
}
