//! Integer comparison splitting.
//!
//! Runs in three steps over the whole module:
//!
//! - `>=` and `<=` become a strict comparison followed, when it fails, by
//!   an equality;
//! - signed `>` and `<` compare the sign bits first and fall back to an
//!   unsigned comparison when they agree;
//! - `==`, `!=`, `>` and `<` are halved from 64 bits down to 8, the high
//!   halves deciding first.
//!
//! Equalities against a constant record the constant into the dictionary
//! before they are split. Comparisons against the values a fuzzer finds on
//! its own (0, 1, -1) are left alone.

use slog::{Logger, debug, info, warn};

use super::Emitter;
use crate::config::{Config, ConvertMode};
use crate::dict::{DictEntry, Origin, provenance};
use crate::error::Fatal;
use crate::ir::{
    BinOp, BlockId, CastOp, Function, InstId, InstKind, Module, Predicate, Terminator, Type, Value,
};

const PREFIX: &str = "C2U.";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CompareStats {
    /// `>=`/`<=` rewritten into a strict comparison and an equality.
    pub simplified: usize,
    /// Signed comparisons rewritten into unsigned ones.
    pub sign_normalized: usize,
    /// Original comparisons halved at least once.
    pub halved: usize,
    /// Constants recorded into the dictionary.
    pub recorded: usize,
}

impl CompareStats {
    pub fn updates(&self) -> usize {
        self.simplified + self.sign_normalized + self.halved
    }
}

/// Splits every integer comparison of the module according to
/// `config.convert`, recording compared constants on the way.
pub fn decompose_compares(
    module: &mut Module,
    config: &Config,
    log: &Logger,
) -> Result<CompareStats, Fatal> {
    let mut stats = CompareStats::default();
    for id in module.function_ids() {
        check_widths(module.function(id))?;
    }
    for id in module.function_ids() {
        let func = module.function_mut(id);
        if config.convert != ConvertMode::None {
            stats.simplified += simplify_predicates(func);
            stats.sign_normalized += simplify_signedness(func);
        }
    }
    for width in [64, 32, 16, 8] {
        for id in module.function_ids() {
            let func = module.function_mut(id);
            half_compares(func, width, config, log, &mut stats)?;
        }
    }

    if stats.updates() == 0 {
        warn!(log, "No instrumentation ICMP found.");
    } else {
        info!(log, "Instrumented {} ICMP.", stats.updates();
            "simplified" => stats.simplified,
            "sign_normalized" => stats.sign_normalized,
            "halved" => stats.halved);
    }
    if stats.recorded == 0 {
        warn!(log, "No entries added to DICT.");
    } else {
        info!(log, "Added {} entries to DICT.", stats.recorded);
    }
    Ok(stats)
}

fn check_widths(func: &Function) -> Result<(), Fatal> {
    for inst in func.live_insts() {
        if let InstKind::Icmp { lhs, .. } = func.kind(inst) {
            if let Some(width) = func.int_width(lhs).filter(|width| *width > 64) {
                return Err(Fatal::UnsupportedWidth {
                    function: func.name.clone(),
                    width,
                });
            }
        }
    }
    Ok(())
}

/// Whether a comparison involves a constant not worth splitting or
/// recording: equality against 0 or 1, anything against 0, 1 or -1 when the
/// other side is a call result or the predicate is an ordering.
pub fn is_magic(func: &Function, pred: Predicate, lhs: &Value, rhs: &Value) -> bool {
    let (constant, other) = match (lhs.as_const(), rhs.as_const()) {
        (Some(constant), _) if lhs.is_const_int() => (constant, rhs),
        (_, Some(constant)) if rhs.is_const_int() => (constant, lhs),
        _ => return false,
    };
    let small = constant.is_zero() || constant.is_one();
    if pred.is_equality() && small {
        return true;
    }
    let is_call = other
        .as_inst()
        .is_some_and(|inst| matches!(func.kind(inst), InstKind::Call { .. }));
    (is_call || !pred.is_equality()) && (small || constant.is_minus_one())
}

/// Integer comparisons of `func` with one of `preds` that are worth
/// splitting, with their operand width.
fn candidates(func: &Function, preds: &[Predicate]) -> Vec<(InstId, u32)> {
    func.live_insts()
        .into_iter()
        .filter_map(|inst| match func.kind(inst) {
            InstKind::Icmp { pred, lhs, rhs } if preds.contains(pred) => {
                let width = func.int_width(lhs)?;
                (func.int_width(rhs) == Some(width) && !is_magic(func, *pred, lhs, rhs))
                    .then_some((inst, width))
            }
            _ => None,
        })
        .collect()
}

fn icmp_parts(func: &Function, inst: InstId) -> Option<(Predicate, Value, Value)> {
    match func.kind(inst) {
        InstKind::Icmp { pred, lhs, rhs } => Some((*pred, lhs.clone(), rhs.clone())),
        _ => None,
    }
}

fn phi(incoming: Vec<(Value, BlockId)>) -> InstKind {
    InstKind::Phi {
        ty: Type::I1,
        incoming,
    }
}

fn icmp(pred: Predicate, lhs: Value, rhs: Value) -> InstKind {
    InstKind::Icmp { pred, lhs, rhs }
}

/// `x >= y` becomes `x > y || x == y`, the equality only evaluated when the
/// strict comparison fails. Same for `<=`.
fn simplify_predicates(func: &mut Function) -> usize {
    let sites = candidates(
        func,
        &[Predicate::Uge, Predicate::Sge, Predicate::Ule, Predicate::Sle],
    );
    for (inst, _) in &sites {
        let Some((pred, lhs, rhs)) = icmp_parts(func, *inst) else {
            continue;
        };
        let strict = match pred {
            Predicate::Uge => Predicate::Ugt,
            Predicate::Sge => Predicate::Sgt,
            Predicate::Ule => Predicate::Ult,
            _ => Predicate::Slt,
        };
        let mut e = Emitter::new(func, PREFIX, *inst);
        let Some((head, end)) = e.split_at(*inst, "NewBB.ICmp") else {
            continue;
        };
        let strict_cmp = e.emit(head, icmp(strict, lhs.clone(), rhs.clone()), "ICmp.NewPred");
        let middle = e.block_before("InjectedMBB", end);
        let eq = e.emit(middle, icmp(Predicate::Eq, lhs, rhs), "ICmp.ICMP_EQ");
        e.func.set_terminator(middle, Terminator::Br(end));
        e.func.set_terminator(
            head,
            Terminator::CondBr {
                cond: strict_cmp,
                on_true: end,
                on_false: middle,
            },
        );
        e.func
            .replace_kind(*inst, phi(vec![(eq, middle), (Value::bool(true), head)]));
    }
    sites.len()
}

/// Signed `>`/`<` compare the sign bits first. When they differ the signs
/// decide, otherwise an unsigned comparison of the full values does.
fn simplify_signedness(func: &mut Function) -> usize {
    let sites = candidates(func, &[Predicate::Sgt, Predicate::Slt]);
    for (inst, width) in &sites {
        let Some((pred, lhs, rhs)) = icmp_parts(func, *inst) else {
            continue;
        };
        let (unsigned, sign_decides) = match pred {
            Predicate::Sgt => (Predicate::Ugt, Predicate::Ult),
            _ => (Predicate::Ult, Predicate::Ugt),
        };
        let mut e = Emitter::new(func, format!("{PREFIX}SimplifySign."), *inst);
        let Some((head, end)) = e.split_at(*inst, "NewBB") else {
            continue;
        };
        let shift = Value::int(*width, u64::from(width - 1));
        let s0 = e.emit(
            head,
            InstKind::Binary {
                op: BinOp::LShr,
                lhs: lhs.clone(),
                rhs: shift.clone(),
            },
            "LShr0",
        );
        let sign0 = e.emit(head, InstKind::Cast { op: CastOp::Trunc, value: s0, to: 1 }, "Lower0");
        let s1 = e.emit(
            head,
            InstKind::Binary {
                op: BinOp::LShr,
                lhs: rhs.clone(),
                rhs: shift,
            },
            "LShr1",
        );
        let sign1 = e.emit(head, InstKind::Cast { op: CastOp::Trunc, value: s1, to: 1 }, "Lower1");
        let same_sign = e.emit(head, icmp(Predicate::Eq, sign0.clone(), sign1.clone()), "EQ01");

        let sign_bb = e.block_before("NewBB.SignNEq", end);
        let by_sign = e.emit(sign_bb, icmp(sign_decides, sign0, sign1), "ICmp.Sign");
        e.func.set_terminator(sign_bb, Terminator::Br(end));

        let middle = e.block_before("NewBB.SignEq", end);
        let by_value = e.emit(middle, icmp(unsigned, lhs, rhs), "ICmp.NewPred");
        e.func.set_terminator(middle, Terminator::Br(end));

        e.func.set_terminator(
            head,
            Terminator::CondBr {
                cond: same_sign,
                on_true: middle,
                on_false: sign_bb,
            },
        );
        e.func
            .replace_kind(*inst, phi(vec![(by_value, middle), (by_sign, sign_bb)]));
    }
    sites.len()
}

/// Records the constant operand of an equality. Returns whether the
/// comparison now has a dictionary counterpart, even when the token itself
/// was rejected for its length.
fn record(
    func: &mut Function,
    inst: InstId,
    lhs: &Value,
    rhs: &Value,
    config: &Config,
    log: &Logger,
) -> Result<bool, Fatal> {
    let Some(constant) = [lhs, rhs]
        .into_iter()
        .find(|value| value.is_const_int())
        .and_then(Value::as_const)
    else {
        return Ok(false);
    };
    let Some(bytes) = constant.le_bytes() else {
        return Ok(false);
    };
    let entry = DictEntry::new(
        &bytes,
        false,
        provenance(func, inst),
        Origin::ComparedInteger,
        &config.limits,
        log,
    );
    if let Some(entry) = entry {
        let name = func.name.clone();
        func.annotations.attach(inst, entry, &config.limits, &name)?;
    }
    Ok(true)
}

/// `trunc(value >> width/2)`, appended to `block`.
fn high_half(e: &mut Emitter<'_>, block: BlockId, value: Value, width: u32, n: u32) -> Value {
    let half = width / 2;
    let shifted = e.emit(
        block,
        InstKind::Binary {
            op: BinOp::LShr,
            lhs: value,
            rhs: Value::int(width, u64::from(half)),
        },
        &format!("Upper{n}"),
    );
    e.emit(
        block,
        InstKind::Cast {
            op: CastOp::Trunc,
            value: shifted,
            to: half,
        },
        &format!("TruncUpper{n}"),
    )
}

fn low_half(e: &mut Emitter<'_>, block: BlockId, value: Value, half: u32, n: u32) -> Value {
    e.emit(
        block,
        InstKind::Cast {
            op: CastOp::Trunc,
            value,
            to: half,
        },
        &format!("Lower{n}"),
    )
}

/// Splits the `width`-bit `==`, `!=`, `>` and `<` comparisons of `func`
/// into two comparisons of half the width.
fn half_compares(
    func: &mut Function,
    width: u32,
    config: &Config,
    log: &Logger,
    stats: &mut CompareStats,
) -> Result<(), Fatal> {
    let half = width / 2;
    let sites: Vec<InstId> = candidates(
        func,
        &[Predicate::Eq, Predicate::Ne, Predicate::Ugt, Predicate::Ult],
    )
    .into_iter()
    .filter(|(_, w)| *w == width)
    .map(|(inst, _)| inst)
    .collect();

    for inst in sites {
        let Some((pred, lhs, rhs)) = icmp_parts(func, inst) else {
            continue;
        };
        let already_split = func.inst(inst).split;
        if !already_split && pred.is_equality() {
            let recorded = record(func, inst, &lhs, &rhs, config, log)?;
            if recorded {
                stats.recorded += 1;
                if config.convert != ConvertMode::All {
                    continue;
                }
            }
        }
        if config.convert == ConvertMode::None || width <= 8 {
            continue;
        }
        if !already_split {
            stats.halved += 1;
        }
        debug!(log, "splitting {}-bit {} in {}", width, pred.mnemonic(), func.name);

        let mut e = Emitter::new(func, format!("{PREFIX}HalfCompare.{half}."), inst);
        let Some((head, end)) = e.split_at(inst, "NewBB.ICmp.High.False") else {
            continue;
        };
        let high0 = high_half(&mut e, head, lhs.clone(), width, 0);
        let high1 = high_half(&mut e, head, rhs.clone(), width, 1);
        let high = e.emit(head, icmp(pred, high0.clone(), high1.clone()), "ICmp.High");

        if pred.is_equality() {
            let low_bb = e.block_before("NewBB.ICmp.Low", end);
            let low0 = low_half(&mut e, low_bb, lhs, half, 0);
            let low1 = low_half(&mut e, low_bb, rhs, half, 1);
            let low = e.emit(low_bb, icmp(pred, low0, low1), "ICmp.Low");
            e.func.set_terminator(low_bb, Terminator::Br(end));

            let (on_true, on_false) = match pred {
                Predicate::Eq => (low_bb, end),
                _ => (end, low_bb),
            };
            e.func.set_terminator(
                head,
                Terminator::CondBr {
                    cond: high.clone(),
                    on_true,
                    on_false,
                },
            );
            // The high half decides first, so it carries the token.
            let high_id = high.as_inst();
            let low_id = low.as_inst();
            e.func.replace_kind(
                inst,
                phi(vec![(low, low_bb), (Value::bool(pred == Predicate::Ne), head)]),
            );
            if let Some(high_id) = high_id {
                e.func
                    .annotations
                    .move_origin(inst, high_id, Origin::ComparedInteger);
                e.func.inst_mut(high_id).split = true;
            }
            if let Some(low_id) = low_id {
                e.func.inst_mut(low_id).split = true;
            }
        } else {
            let inverse = match pred {
                Predicate::Ugt => Predicate::Ult,
                _ => Predicate::Ugt,
            };
            let inv_bb = e.block_before("NewBB.Inv_cmp", end);
            let inv = e.emit(inv_bb, icmp(inverse, high0, high1), "ICmp.Inv");
            e.func.set_terminator(
                head,
                Terminator::CondBr {
                    cond: high,
                    on_true: end,
                    on_false: inv_bb,
                },
            );

            let low_bb = e.block_before("LowerBB.Low", end);
            let low0 = low_half(&mut e, low_bb, lhs, half, 0);
            let low1 = low_half(&mut e, low_bb, rhs, half, 1);
            let low = e.emit(low_bb, icmp(pred, low0, low1), "ICmp.Low");
            e.func.set_terminator(low_bb, Terminator::Br(end));
            e.func.set_terminator(
                inv_bb,
                Terminator::CondBr {
                    cond: inv,
                    on_true: end,
                    on_false: low_bb,
                },
            );
            e.func.replace_kind(
                inst,
                phi(vec![
                    (low, low_bb),
                    (Value::bool(true), head),
                    (Value::bool(false), inv_bb),
                ]),
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DictType;
    use crate::ir::builder::FunctionBuilder;
    use crate::ir::interp::Machine;
    use crate::ir::verify::verify;
    use crate::log::discard;

    fn compare_module(pred: Predicate, width: u32, rhs: Option<u64>) -> Module {
        let ty = Type::Int(width);
        let params = if rhs.is_some() { vec![ty] } else { vec![ty, ty] };
        let mut module = Module::new("m");
        let mut b = FunctionBuilder::new("cmp", params, Type::I1);
        let entry = b.create_block("entry");
        b.switch_to(entry);
        let rhs = rhs.map_or(Value::Arg(1), |c| Value::int(width, c));
        let result = b.icmp(pred, Value::Arg(0), rhs);
        b.ret(Some(result));
        module.add_function(b.finish());
        module
    }

    fn config(convert: ConvertMode) -> Config {
        Config::fuzzing(DictType::Normal, convert)
    }

    fn icmp_widths(module: &Module) -> Vec<u32> {
        let func = module.function(module.find_function("cmp").unwrap());
        func.live_insts()
            .into_iter()
            .filter_map(|inst| match func.kind(inst) {
                InstKind::Icmp { lhs, .. } => func.int_width(lhs),
                _ => None,
            })
            .collect()
    }

    const SAMPLES: [u64; 10] = [
        0,
        1,
        0x7f,
        0x80,
        0x1234_5678,
        0x1234_5679,
        0x8000_0000,
        0xffff_ffff,
        0x7fff_ffff_ffff_ffff,
        u64::MAX,
    ];

    #[test]
    fn every_predicate_survives_splitting() {
        let preds = [
            Predicate::Eq,
            Predicate::Ne,
            Predicate::Ugt,
            Predicate::Uge,
            Predicate::Ult,
            Predicate::Ule,
            Predicate::Sgt,
            Predicate::Sge,
            Predicate::Slt,
            Predicate::Sle,
        ];
        for width in [16, 32, 64] {
            for pred in preds {
                let original = compare_module(pred, width, None);
                let mut split = original.clone();
                decompose_compares(&mut split, &config(ConvertMode::All), &discard()).unwrap();
                verify(&split).unwrap();
                assert!(icmp_widths(&split).iter().all(|w| *w <= 8), "{pred:?} i{width}");

                for a in SAMPLES {
                    for b in SAMPLES {
                        let expected = Machine::new(&original).call("cmp", &[a, b]).unwrap();
                        let actual = Machine::new(&split).call("cmp", &[a, b]).unwrap();
                        assert_eq!(expected, actual, "{pred:?} i{width} {a:#x} {b:#x}");
                    }
                }
            }
        }
    }

    #[test]
    fn equality_constant_is_recorded_on_the_high_half() {
        let mut module = compare_module(Predicate::Eq, 32, Some(0x1234_5678));
        let stats = decompose_compares(&mut module, &config(ConvertMode::All), &discard()).unwrap();
        assert_eq!(stats.recorded, 1);
        assert_eq!(stats.halved, 1);

        let func = module.function(module.find_function("cmp").unwrap());
        let annotated: Vec<_> = func.annotations.iter().collect();
        assert_eq!(annotated.len(), 1);
        let (inst, entry) = annotated[0];
        assert_eq!(entry.value, "\\x78\\x56\\x34\\x12");
        assert_eq!(entry.tag(), "C2U_NDEBUG");
        assert!(func.inst(inst).split);
        assert!(func.inst(inst).name.ends_with("ICmp.High"));
    }

    #[test]
    fn not_dict_keeps_recorded_comparisons_whole() {
        let mut module = compare_module(Predicate::Eq, 32, Some(0x1234_5678));
        let stats =
            decompose_compares(&mut module, &config(ConvertMode::NotDict), &discard()).unwrap();
        assert_eq!(stats.recorded, 1);
        assert_eq!(stats.halved, 0);
        assert_eq!(icmp_widths(&module), vec![32]);

        let mut variable = compare_module(Predicate::Eq, 32, None);
        decompose_compares(&mut variable, &config(ConvertMode::NotDict), &discard()).unwrap();
        assert!(icmp_widths(&variable).iter().all(|w| *w <= 8));
    }

    #[test]
    fn none_only_records() {
        let mut module = compare_module(Predicate::Uge, 32, None);
        let stats = decompose_compares(&mut module, &config(ConvertMode::None), &discard()).unwrap();
        assert_eq!(stats.updates(), 0);
        assert_eq!(icmp_widths(&module), vec![32]);

        let mut module = compare_module(Predicate::Ne, 64, Some(0xdead_beef_cafe));
        let stats = decompose_compares(&mut module, &config(ConvertMode::None), &discard()).unwrap();
        assert_eq!(stats.recorded, 1);
        assert_eq!(icmp_widths(&module), vec![64]);
    }

    #[test]
    fn magic_values_are_left_alone() {
        for (pred, constant) in [
            (Predicate::Eq, 0),
            (Predicate::Ne, 1),
            (Predicate::Ugt, 0),
            (Predicate::Slt, u64::MAX),
        ] {
            let mut module = compare_module(pred, 32, Some(constant));
            let stats =
                decompose_compares(&mut module, &config(ConvertMode::All), &discard()).unwrap();
            assert_eq!(stats, CompareStats::default(), "{pred:?} {constant}");
            assert_eq!(icmp_widths(&module), vec![32]);
        }
        // -1 is only magic for orderings and call results.
        let mut module = compare_module(Predicate::Eq, 32, Some(u64::MAX));
        let stats = decompose_compares(&mut module, &config(ConvertMode::All), &discard()).unwrap();
        assert_eq!(stats.recorded, 1);
    }

    #[test]
    fn splitting_twice_changes_nothing() {
        let mut module = compare_module(Predicate::Sle, 64, None);
        decompose_compares(&mut module, &config(ConvertMode::All), &discard()).unwrap();
        let once = module.clone();
        let stats = decompose_compares(&mut module, &config(ConvertMode::All), &discard()).unwrap();
        assert_eq!(stats.updates(), 0);
        assert_eq!(module.to_string(), once.to_string());
    }

    #[test]
    fn wide_integers_are_fatal() {
        let mut module = compare_module(Predicate::Eq, 128, None);
        assert_eq!(
            decompose_compares(&mut module, &config(ConvertMode::All), &discard()),
            Err(Fatal::UnsupportedWidth {
                function: "cmp".into(),
                width: 128
            })
        );
    }
}
