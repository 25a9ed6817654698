//! Structural checks run after every pass.

use std::collections::{HashMap, HashSet};

use super::{BlockId, Callee, Function, InstId, InstKind, Module, Terminator, Value};
use crate::error::Fatal;

pub fn verify(module: &Module) -> Result<(), Fatal> {
    for func in module.functions.iter().filter(|f| !f.is_declaration()) {
        verify_function(module, func).map_err(|reason| Fatal::Verification {
            function: func.name.clone(),
            reason,
        })?;
    }
    Ok(())
}

fn verify_function(module: &Module, func: &Function) -> Result<(), String> {
    check_ids(module, func)?;
    let live: HashSet<BlockId> = func.layout.iter().copied().collect();
    if live.len() != func.layout.len() {
        return Err("block listed twice in layout".into());
    }

    for &block in &func.layout {
        let name = &func.block(block).name;
        for succ in func.successors(block) {
            if !live.contains(&succ) {
                return Err(format!("{name} branches to a dead block {succ:?}"));
            }
        }
        if let Terminator::Invoke { unwind, .. } = &func.block(block).term {
            if !func.is_landing_pad(*unwind) {
                return Err(format!("unwind target of {name} is not a landing pad"));
            }
        }
    }

    let preds = func.predecessor_map();
    for &block in &func.layout {
        let incoming = preds.get(&block).map(Vec::as_slice).unwrap_or(&[]);
        check_block_shape(module, func, block, incoming)?;
    }

    let doms = Dominators::with_predecessors(func, &preds);
    let mut position: HashMap<InstId, (BlockId, usize)> = HashMap::new();
    for &block in &func.layout {
        for (pos, inst) in func.block(block).insts.iter().enumerate() {
            if func.inst(*inst).block != Some(block) {
                return Err(format!("instruction %{} has a stale parent", inst.0));
            }
            position.insert(*inst, (block, pos));
        }
    }

    let dominates_use = |def: InstId, block: BlockId, pos: usize| -> Result<(), String> {
        let Some(&(def_block, def_pos)) = position.get(&def) else {
            return Err(format!("use of erased instruction %{}", def.0));
        };
        if !doms.is_reachable(block) {
            return Ok(());
        }
        let ok = if def_block == block {
            def_pos < pos
        } else {
            doms.dominates(def_block, block)
        };
        if ok {
            Ok(())
        } else {
            Err(format!(
                "%{} does not dominate its use in {}",
                def.0,
                func.block(block).name
            ))
        }
    };

    for &block in &func.layout {
        let insts = &func.block(block).insts;
        for (pos, inst) in insts.iter().enumerate() {
            match func.kind(*inst) {
                InstKind::Phi { incoming, .. } => {
                    for (value, pred) in incoming {
                        if let Value::Inst(def) = value {
                            // Evaluated at the end of the incoming block.
                            dominates_use(*def, *pred, usize::MAX)?;
                        }
                    }
                }
                kind => {
                    for value in kind.operands() {
                        if let Value::Inst(def) = value {
                            dominates_use(*def, block, pos)?;
                        }
                    }
                }
            }
        }
        for value in func.block(block).term.operands() {
            if let Value::Inst(def) = value {
                dominates_use(*def, block, usize::MAX)?;
            }
        }
    }
    Ok(())
}

/// Every id must point into the arenas of `func` or `module`, so that the
/// rest of the checks can index freely.
fn check_ids(module: &Module, func: &Function) -> Result<(), String> {
    let block_ok = |id: &BlockId| id.index() < func.blocks.len();
    let value_ok = |value: &Value| match value {
        Value::Inst(id) => id.index() < func.insts.len(),
        Value::Arg(index) => (*index as usize) < func.params.len(),
        Value::Global(id) => id.index() < module.globals.len(),
        Value::Func(id) => id.index() < module.functions.len(),
        Value::Const(_) => true,
    };
    let callee_ok = |callee: &Callee| match callee {
        Callee::Direct(id) => id.index() < module.functions.len(),
        Callee::Indirect(_) => true,
    };

    if let Some(block) = func.layout.iter().find(|b| !block_ok(*b)) {
        return Err(format!("layout lists unknown block {block:?}"));
    }
    for (n, data) in func.blocks.iter().enumerate() {
        let name = &data.name;
        if let Some(inst) = data.insts.iter().find(|i| i.index() >= func.insts.len()) {
            return Err(format!("block {n} ({name}) holds unknown instruction %{}", inst.0));
        }
        if let Some(succ) = data.term.successors().into_iter().find(|b| !block_ok(b)) {
            return Err(format!("block {n} ({name}) branches to unknown block {succ:?}"));
        }
        let callee = match &data.term {
            Terminator::Invoke { callee, .. } => Some(callee),
            _ => None,
        };
        if !data.term.operands().into_iter().all(value_ok) || !callee.is_none_or(callee_ok) {
            return Err(format!("terminator of block {n} ({name}) has an unknown operand"));
        }
    }
    for (n, inst) in func.insts.iter().enumerate() {
        let bad = match &inst.kind {
            InstKind::Phi { incoming, .. } => incoming.iter().any(|(_, b)| !block_ok(b)),
            InstKind::Call { callee, .. } => !callee_ok(callee),
            _ => false,
        };
        if bad || !inst.kind.operands().into_iter().all(value_ok) {
            return Err(format!("instruction %{n} has an unknown operand"));
        }
    }
    if let Some((inst, _)) = func.annotations.iter().find(|(i, _)| i.index() >= func.insts.len()) {
        return Err(format!("dictionary entry on unknown instruction %{}", inst.0));
    }
    Ok(())
}

fn check_block_shape(
    module: &Module,
    func: &Function,
    block: BlockId,
    preds: &[BlockId],
) -> Result<(), String> {
    let data = func.block(block);
    let name = &data.name;
    let phis = func.phis(block);
    let mut distinct: Vec<BlockId> = preds.to_vec();
    distinct.sort();
    distinct.dedup();

    for (pos, inst) in data.insts.iter().enumerate() {
        match func.kind(*inst) {
            InstKind::Phi { incoming, .. } => {
                if pos >= phis.len() {
                    return Err(format!("φ %{} in {name} does not lead its block", inst.0));
                }
                let mut sources: Vec<BlockId> = incoming.iter().map(|(_, b)| *b).collect();
                sources.sort();
                if sources != distinct {
                    return Err(format!(
                        "φ %{} in {name} has incoming {sources:?}, predecessors are {distinct:?}",
                        inst.0
                    ));
                }
            }
            InstKind::LandingPad => {
                if pos != phis.len() {
                    return Err(format!("landing pad in {name} is not first"));
                }
                let only_unwind = preds.iter().all(|pred| {
                    matches!(
                        &func.block(*pred).term,
                        Terminator::Invoke { normal, unwind, .. } if *unwind == block && *normal != block
                    )
                });
                if preds.is_empty() || !only_unwind {
                    return Err(format!("landing pad {name} not entered through unwind edges"));
                }
            }
            InstKind::Icmp { lhs, rhs, .. } => {
                let (l, r) = (func.value_type(lhs), func.value_type(rhs));
                if l != r {
                    return Err(format!("icmp %{} compares {l:?} with {r:?}", inst.0));
                }
            }
            InstKind::Binary { lhs, rhs, .. } => {
                let (l, r) = (func.value_type(lhs), func.value_type(rhs));
                if l != r {
                    return Err(format!("binary %{} mixes {l:?} and {r:?}", inst.0));
                }
            }
            InstKind::Call { callee, args, .. } => {
                if let super::Callee::Direct(id) = callee {
                    let target = module.function(*id);
                    if target.params.len() != args.len() {
                        return Err(format!(
                            "call to {} with {} arguments, expected {}",
                            target.name,
                            args.len(),
                            target.params.len()
                        ));
                    }
                }
            }
            _ => {}
        }
    }
    if let Terminator::CondBr { cond, .. } = &data.term {
        if func.value_type(cond) != super::Type::I1 {
            return Err(format!("branch condition of {name} is not an i1"));
        }
    }
    Ok(())
}

/// Immediate dominators of the blocks reachable from the entry.
pub struct Dominators {
    idom: HashMap<BlockId, BlockId>,
    order: HashMap<BlockId, usize>,
}

impl Dominators {
    pub fn compute(func: &Function) -> Self {
        Self::with_predecessors(func, &func.predecessor_map())
    }

    /// Same as [`Dominators::compute`], reusing a [`Function::predecessor_map`].
    pub fn with_predecessors(func: &Function, preds: &HashMap<BlockId, Vec<BlockId>>) -> Self {
        let rpo = reverse_postorder(func);
        let order: HashMap<BlockId, usize> =
            rpo.iter().enumerate().map(|(i, b)| (*b, i)).collect();
        let mut idom: HashMap<BlockId, BlockId> = HashMap::new();
        let Some(&entry) = rpo.first() else {
            return Self { idom, order };
        };
        idom.insert(entry, entry);

        let mut changed = true;
        while changed {
            changed = false;
            for &block in rpo.iter().skip(1) {
                let mut new_idom: Option<BlockId> = None;
                for pred in preds.get(&block).into_iter().flatten() {
                    if !idom.contains_key(pred) {
                        continue;
                    }
                    new_idom = Some(match new_idom {
                        None => *pred,
                        Some(current) => intersect(&idom, &order, *pred, current),
                    });
                }
                if let Some(new_idom) = new_idom {
                    if idom.get(&block) != Some(&new_idom) {
                        idom.insert(block, new_idom);
                        changed = true;
                    }
                }
            }
        }
        Self { idom, order }
    }

    pub fn is_reachable(&self, block: BlockId) -> bool {
        self.order.contains_key(&block)
    }

    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        if !self.is_reachable(a) || !self.is_reachable(b) {
            return false;
        }
        let mut current = b;
        loop {
            if current == a {
                return true;
            }
            match self.idom.get(&current) {
                Some(&parent) if parent != current => current = parent,
                _ => return false,
            }
        }
    }
}

fn intersect(
    idom: &HashMap<BlockId, BlockId>,
    order: &HashMap<BlockId, usize>,
    mut a: BlockId,
    mut b: BlockId,
) -> BlockId {
    while a != b {
        while order[&a] > order[&b] {
            a = idom[&a];
        }
        while order[&b] > order[&a] {
            b = idom[&b];
        }
    }
    a
}

fn reverse_postorder(func: &Function) -> Vec<BlockId> {
    let Some(entry) = func.entry() else {
        return Vec::new();
    };
    let mut visited = HashSet::from([entry]);
    let mut postorder = Vec::new();
    let mut stack = vec![(entry, func.successors(entry), 0usize)];
    while let Some((block, succs, next)) = stack.last_mut() {
        let block = *block;
        let succ = succs.get(*next).copied();
        *next += 1;
        match succ {
            Some(succ) => {
                if visited.insert(succ) {
                    let succs = func.successors(succ);
                    stack.push((succ, succs, 0));
                }
            }
            None => {
                postorder.push(block);
                stack.pop();
            }
        }
    }
    postorder.reverse();
    postorder
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::ir::builder::FunctionBuilder;
    use crate::ir::{FuncId, Predicate, Type};

    #[test]
    fn accepts_a_loop() {
        let mut module = Module::new("m");
        let mut b = FunctionBuilder::new("count", vec![Type::I32], Type::I32);
        let entry = b.create_block("entry");
        let head = b.create_block("head");
        let exit = b.create_block("exit");
        b.switch_to(entry);
        b.br(head);
        b.switch_to(head);
        let i = b.phi(Type::I32, vec![(Value::int(32, 0), entry)]);
        let next = b.add(i.clone(), Value::int(32, 1));
        let done = b.icmp(Predicate::Uge, next.clone(), Value::Arg(0));
        b.cond_br(done, exit, head);
        b.switch_to(exit);
        b.ret(Some(next.clone()));
        let mut func = b.finish();
        if let InstKind::Phi { incoming, .. } = &mut func.inst_mut(i.as_inst().unwrap()).kind {
            incoming.push((next, head));
        }
        module.add_function(func);
        verify(&module).unwrap();
    }

    #[test]
    fn rejects_uses_that_are_not_dominated() {
        let mut module = Module::new("m");
        let mut b = FunctionBuilder::new("bad", vec![Type::I32], Type::I32);
        let entry = b.create_block("entry");
        let left = b.create_block("left");
        let join = b.create_block("join");
        b.switch_to(entry);
        let cond = b.icmp(Predicate::Eq, Value::Arg(0), Value::int(32, 0));
        b.cond_br(cond, left, join);
        b.switch_to(left);
        let sum = b.add(Value::Arg(0), Value::int(32, 1));
        b.br(join);
        b.switch_to(join);
        b.ret(Some(sum));
        module.add_function(b.finish());
        assert_matches!(verify(&module), Err(Fatal::Verification { function, .. }) if function == "bad");
    }

    #[test]
    fn rejects_phis_missing_a_predecessor() {
        let mut module = Module::new("m");
        let mut b = FunctionBuilder::new("phi", vec![Type::I1], Type::I32);
        let entry = b.create_block("entry");
        let left = b.create_block("left");
        let join = b.create_block("join");
        b.switch_to(entry);
        b.cond_br(Value::Arg(0), left, join);
        b.switch_to(left);
        b.br(join);
        b.switch_to(join);
        let phi = b.phi(Type::I32, vec![(Value::int(32, 1), left)]);
        b.ret(Some(phi));
        module.add_function(b.finish());
        assert_matches!(verify(&module), Err(Fatal::Verification { .. }));
    }

    fn single_block(ret: Value) -> Function {
        let mut b = FunctionBuilder::new("f", vec![Type::I32], Type::I32);
        let entry = b.create_block("entry");
        b.switch_to(entry);
        b.ret(Some(ret));
        b.finish()
    }

    #[test]
    fn rejects_ids_outside_the_arenas() {
        let mut dangling_branch = single_block(Value::Arg(0));
        dangling_branch.blocks[0].term = Terminator::Br(BlockId(7));
        let dangling_inst = single_block(Value::Inst(InstId(3)));
        let dangling_arg = single_block(Value::Arg(5));
        let mut dangling_layout = single_block(Value::Arg(0));
        dangling_layout.layout.push(BlockId(1));

        for func in [dangling_branch, dangling_inst, dangling_arg, dangling_layout] {
            let mut module = Module::new("m");
            module.add_function(func);
            assert_matches!(verify(&module), Err(Fatal::Verification { function, .. }) if function == "f");
        }
    }

    #[test]
    fn rejects_calls_to_unknown_functions() {
        let mut module = Module::new("m");
        let mut b = FunctionBuilder::new("f", vec![], Type::Void);
        let entry = b.create_block("entry");
        b.switch_to(entry);
        b.call(FuncId(12), vec![], Type::Void);
        b.ret(None);
        module.add_function(b.finish());
        assert_matches!(verify(&module), Err(Fatal::Verification { .. }));
    }

    #[test]
    fn long_chains_verify() {
        let mut module = Module::new("m");
        let mut b = FunctionBuilder::new("chain", vec![Type::I32], Type::I32);
        let blocks: Vec<BlockId> = (0..20_000).map(|n| b.create_block(&format!("b{n}"))).collect();
        b.switch_to(blocks[0]);
        let one = b.add(Value::Arg(0), Value::int(32, 1));
        for pair in blocks.windows(2) {
            b.switch_to(pair[0]);
            b.br(pair[1]);
        }
        b.switch_to(blocks[blocks.len() - 1]);
        b.ret(Some(one));
        module.add_function(b.finish());
        verify(&module).unwrap();
    }
}
