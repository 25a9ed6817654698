//! Select-to-branch lowering.

use slog::{Logger, info, warn};

use super::Emitter;
use crate::ir::{InstId, InstKind, Module, Terminator, Type};

/// Rewrites every `select` on an `i1` condition into a conditional branch
/// to two fresh blocks joined by a φ-node carrying the chosen value.
/// Returns the number of rewritten selects.
pub fn lower_selects(module: &mut Module, log: &Logger) -> usize {
    let mut count = 0;
    for id in module.function_ids() {
        let func = module.function_mut(id);
        let selects: Vec<InstId> = func
            .live_insts()
            .into_iter()
            .filter(|inst| match func.kind(*inst) {
                InstKind::Select { cond, .. } => func.value_type(cond) == Type::I1,
                _ => false,
            })
            .collect();

        for select in selects {
            let InstKind::Select {
                cond,
                on_true,
                on_false,
            } = func.kind(select).clone()
            else {
                continue;
            };
            let ty = func.inst_type(select);
            let Some((parent, _)) = func.position(select) else {
                continue;
            };
            let parent_name = match func.block(parent).name.as_str() {
                "" => "NoName".to_string(),
                name => name.to_string(),
            };

            let mut e = Emitter::new(func, format!("{parent_name}.S2B.{count}"), select);
            let Some((_, true_bb)) = e.split_at(select, ".True") else {
                continue;
            };
            let Some((_, false_bb)) = e.split_at(select, ".False") else {
                continue;
            };
            let Some((_, end_bb)) = e.split_at(select, ".End") else {
                continue;
            };
            e.func.set_terminator(
                parent,
                Terminator::CondBr {
                    cond,
                    on_true: true_bb,
                    on_false: false_bb,
                },
            );
            e.func.set_terminator(true_bb, Terminator::Br(end_bb));
            e.func.replace_kind(
                select,
                InstKind::Phi {
                    ty,
                    incoming: vec![(on_true, true_bb), (on_false, false_bb)],
                },
            );
            count += 1;
        }
    }

    if count == 0 {
        warn!(log, "No instrumentation SELECT found.");
    } else {
        info!(log, "Instrumented {} SELECT.", count);
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::FunctionBuilder;
    use crate::ir::interp::Machine;
    use crate::ir::verify::verify;
    use crate::ir::{Predicate, Value};
    use crate::log::discard;

    fn max_module() -> Module {
        let mut module = Module::new("m");
        let mut b = FunctionBuilder::new("max", vec![Type::I32, Type::I32], Type::I32);
        let entry = b.create_block("entry");
        b.switch_to(entry);
        let gt = b.icmp(Predicate::Sgt, Value::Arg(0), Value::Arg(1));
        let max = b.select(gt, Value::Arg(0), Value::Arg(1));
        let sum = b.add(max, Value::int(32, 1));
        b.ret(Some(sum));
        module.add_function(b.finish());
        module
    }

    #[test]
    fn selects_become_branches() {
        let mut module = max_module();
        assert_eq!(lower_selects(&mut module, &discard()), 1);
        verify(&module).unwrap();

        let func = module.function(module.find_function("max").unwrap());
        assert_eq!(func.layout.len(), 4);
        assert!(
            func.live_insts()
                .iter()
                .all(|inst| !matches!(func.kind(*inst), InstKind::Select { .. }))
        );
        let names: Vec<_> = func.layout.iter().map(|b| func.block(*b).name.clone()).collect();
        assert_eq!(names, ["entry", "entry.S2B.0.True", "entry.S2B.0.False", "entry.S2B.0.End"]);
    }

    #[test]
    fn lowering_preserves_results() {
        let original = max_module();
        let mut lowered = max_module();
        lower_selects(&mut lowered, &discard());

        for (a, b) in [(1u64, 2u64), (7, 3), (0xffff_fff0, 4), (5, 5)] {
            let expected = Machine::new(&original).call("max", &[a, b]).unwrap();
            let actual = Machine::new(&lowered).call("max", &[a, b]).unwrap();
            assert_eq!(expected, actual, "max({a}, {b})");
        }
    }
}
