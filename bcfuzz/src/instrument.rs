//! Edge coverage probes.
//!
//! Every conditional branch and invoke edge of the module gets a probe that
//! bumps one byte of the coverage map. A probe lands in the target block when
//! the edge is the only way into it, otherwise a new block carrying the probe
//! is spliced onto the edge.
//!
//! Each probe has two numbers:
//!
//! - an identifier, dense from 1, used by the trace hook, the dictionary tags
//!   and the source mapping;
//! - a map slot. In [`CounterMode::Classic`] the slot is drawn at random and
//!   mixed with the slot of the previous probe (`map[prev ^ slot]++`, then
//!   `prev = slot >> 1`). With dense identifiers the slot is the identifier.
//!
//! [`CounterMode::Classic`]: crate::config::CounterMode::Classic

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt::Write as _;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use slog::{Logger, debug, info, warn};

use crate::config::Config;
use crate::constants::{
    AFL_AREA_PTR, AFL_BB_TRACE, AFL_BLOCK_PREFIX, AFL_GET_AREA_SIZE, AFL_GET_BBAREA_SIZE,
    AFL_PREV_LOC, AFL_SYMBOL_PREFIX, FUNC_POINTED_TO_LIST,
};
use crate::dict::{Dictionary, block_has_entries};
use crate::error::Fatal;
use crate::ir::builder::FunctionBuilder;
use crate::ir::{
    BinOp, BlockId, Callee, CastOp, FuncId, Function, GlobalId, InstKind, Module, Terminator,
    Type, Value,
};

/// A place that receives a probe.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Site {
    /// Entry of a function that may be reached through a pointer.
    Entry(FuncId),
    /// Successor `index` of the terminator of `block`.
    Edge {
        func: FuncId,
        block: BlockId,
        index: usize,
    },
}

impl Site {
    pub fn func(self) -> FuncId {
        match self {
            Site::Entry(func) | Site::Edge { func, .. } => func,
        }
    }

    /// Blocks whose tokens and source lines the probe stands for.
    fn blocks(self, func: &Function) -> Vec<BlockId> {
        match self {
            Site::Entry(_) => func.entry().into_iter().collect(),
            Site::Edge { block, index, .. } => {
                let mut blocks = vec![block];
                match func.successors(block).get(index) {
                    Some(&target) if target != block => blocks.push(target),
                    _ => {}
                }
                blocks
            }
        }
    }
}

/// Probe identifier to `file:line` list, for coverage builds.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SourceMap {
    lines: BTreeMap<u32, String>,
}

impl SourceMap {
    pub fn get(&self, id: u32) -> Option<&str> {
        self.lines.get(&id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// One `id=file:line[,file:line...]` line per probe.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (id, lines) in &self.lines {
            let _ = writeln!(out, "{id}={lines}");
        }
        out
    }
}

#[derive(Debug)]
pub struct InstrumentReport {
    pub probes: u32,
    /// Value returned by `__afl_get_area_size`.
    pub area_size: u32,
    /// Value returned by `__afl_get_bbarea_size`: one past the last identifier.
    pub bb_count: u32,
    pub seed: u64,
    /// Drawn from the identifier generator once every probe has its slot.
    pub build_id: u64,
    pub dictionary: Dictionary,
    /// Only for coverage builds.
    pub source_map: Option<SourceMap>,
}

/// Symbols the probes reference.
struct Runtime {
    area_ptr: GlobalId,
    prev_loc: Option<GlobalId>,
    trace: Option<FuncId>,
}

impl Runtime {
    fn declare(module: &mut Module, config: &Config) -> Self {
        let area_ptr = module.get_or_insert_global(AFL_AREA_PTR, false);
        let prev_loc = (!config.dense_ids()).then(|| module.get_or_insert_global(AFL_PREV_LOC, true));
        let trace = config.traces_ids().then(|| {
            module.get_or_insert_function(AFL_BB_TRACE, vec![Type::I32], Type::Void)
        });
        Self {
            area_ptr,
            prev_loc,
            trace,
        }
    }

    fn emit_probe(&self, func: &mut Function, block: BlockId, at: usize, id: u32, slot: u32) {
        let mut probe = Probe { func, block, at };
        if let Some(trace) = self.trace {
            probe.push(InstKind::Call {
                callee: Callee::Direct(trace),
                args: vec![Value::int(32, u64::from(id))],
                ret: Type::Void,
            });
        }
        let base = probe.push(InstKind::Load {
            ty: Type::Ptr,
            ptr: Value::Global(self.area_ptr),
        });
        let offset = match self.prev_loc {
            Some(prev_loc) => {
                let prev = probe.push(InstKind::Load {
                    ty: Type::I32,
                    ptr: Value::Global(prev_loc),
                });
                let mixed = probe.push(InstKind::Binary {
                    op: BinOp::Xor,
                    lhs: prev,
                    rhs: Value::int(32, u64::from(slot)),
                });
                probe.push(InstKind::Cast {
                    op: CastOp::ZExt,
                    value: mixed,
                    to: 64,
                })
            }
            None => Value::int(64, u64::from(slot)),
        };
        let counter = probe.push(InstKind::Gep { base, offset });
        let count = probe.push(InstKind::Load {
            ty: Type::I8,
            ptr: counter.clone(),
        });
        let count = probe.push(InstKind::Binary {
            op: BinOp::Add,
            lhs: count,
            rhs: Value::int(8, 1),
        });
        probe.push(InstKind::Store {
            value: count,
            ptr: counter,
        });
        if let Some(prev_loc) = self.prev_loc {
            probe.push(InstKind::Store {
                value: Value::int(32, u64::from(slot >> 1)),
                ptr: Value::Global(prev_loc),
            });
        }
    }
}

/// Insertion cursor inside one block.
struct Probe<'f> {
    func: &'f mut Function,
    block: BlockId,
    at: usize,
}

impl Probe<'_> {
    fn push(&mut self, kind: InstKind) -> Value {
        let id = self.func.insert_inst(self.block, self.at, kind, "", None);
        self.at += 1;
        Value::Inst(id)
    }
}

/// Instruments every selected edge of `module` and defines the size
/// accessors.
pub fn instrument_edges(
    module: &mut Module,
    config: &Config,
    log: &Logger,
) -> Result<InstrumentReport, Fatal> {
    let map_size = config.map_size()?;

    for id in module.function_ids() {
        let func = module.function_mut(id);
        if func.is_declaration() {
            continue;
        }
        let split = split_shared_landing_pads(func)?;
        if split > 0 {
            debug!(log, "Split {} shared landing pad(s) in {}", split, func.name);
        }
    }

    let pointed_to = pointed_to_functions(module, log);
    let sites = select_sites(module, config, pointed_to.as_ref())?;

    let seed = config.seed.unwrap_or_else(|| rand::rng().random());
    info!(log, "The seed used for instrumentation is {}", seed);
    let mut rng = StdRng::seed_from_u64(seed);

    // Keeps `prev ^ slot` inside maps whose size is not a power of two.
    let slot_span: u32 = map_size.checked_ilog2().map_or(1, |log| 1 << log);
    let mut dictionary = Dictionary::default();
    let mut source_map = config.is_coverage().then(SourceMap::default);
    let mut reached = HashSet::new();
    let mut plan = Vec::with_capacity(sites.len());
    for (n, site) in sites.into_iter().enumerate() {
        let id = n as u32 + 1;
        let slot = if config.dense_ids() {
            id
        } else {
            rng.random_range(0..slot_span)
        };
        let func = module.function(site.func());
        let blocks = site.blocks(func);
        for &block in &blocks {
            dictionary.record_block(func, block, id);
            reached.insert((site.func(), block));
        }
        if let Some(map) = &mut source_map {
            map.lines.insert(id, source_lines(module, func, &blocks));
        }
        plan.push((site, id, slot));
    }

    let build_id = rng.random();

    // Tokens of blocks no probe stands for stay in the dictionary under 0.
    for id in module.function_ids() {
        let func = module.function(id);
        for &block in &func.layout {
            if !reached.contains(&(id, block)) && block_has_entries(func, block) {
                dictionary.record_block(func, block, 0);
            }
        }
    }

    let runtime = Runtime::declare(module, config);
    let probes = plan.len() as u32;
    for (site, id, slot) in plan {
        materialize(module.function_mut(site.func()), &runtime, site, id, slot)?;
    }

    let bb_count = probes + 1;
    let area_size = if config.dense_ids() { bb_count } else { map_size };
    define_accessor(module, AFL_GET_AREA_SIZE, area_size);
    define_accessor(module, AFL_GET_BBAREA_SIZE, bb_count);

    if probes == 0 {
        warn!(log, "No instrumentation targets found.");
    } else {
        info!(log, "Instrumented {} locations ({} mode).", probes, config.hardening.describe();
            "counter" => config.counter.as_str(),
            "area_size" => area_size,
        );
    }

    Ok(InstrumentReport {
        probes,
        area_size,
        bb_count,
        seed,
        build_id,
        dictionary,
        source_map,
    })
}

/// Gives every predecessor of a shared landing pad its own copy of the pad.
/// The original block keeps the rest of the code and joins the copies'
/// values in a φ.
pub fn split_shared_landing_pads(func: &mut Function) -> Result<usize, Fatal> {
    let preds = func.predecessor_map();
    let shared: Vec<BlockId> = func
        .layout
        .iter()
        .copied()
        .filter(|block| {
            func.is_landing_pad(*block) && preds.get(block).is_some_and(|p| p.len() > 1)
        })
        .collect();

    for &pad in &shared {
        let preds = func.predecessors(pad);
        let all_unwind = preds.iter().all(|pred| {
            matches!(&func.block(*pred).term, Terminator::Invoke { unwind, .. } if *unwind == pad)
        });
        let Some(landing) = func.landing_pad_inst(pad).filter(|_| all_unwind) else {
            return Err(Fatal::SharedLandingPad {
                function: func.name.clone(),
                block: pad,
                predecessors: preds.len(),
            });
        };
        let name = func.block(pad).name.clone();
        let value_name = func.inst(landing).name.clone();
        let loc = func.inst(landing).loc.clone();

        let mut incoming = Vec::with_capacity(preds.len());
        for (n, pred) in preds.into_iter().enumerate() {
            let copy = func.add_block_before(format!("{name}.{}", n + 1), pad);
            let value = func.push_inst(copy, InstKind::LandingPad, value_name.clone(), loc.clone());
            func.set_terminator(copy, Terminator::Br(pad));
            if let Terminator::Invoke { unwind, .. } = &mut func.block_mut(pred).term {
                *unwind = copy;
            }
            func.replace_phi_incoming_block(pad, pred, copy);
            incoming.push((Value::Inst(value), copy));
        }
        func.replace_kind(
            landing,
            InstKind::Phi {
                ty: Type::Ptr,
                incoming,
            },
        );
    }
    Ok(shared.len())
}

/// Names listed in the pointer-analysis metadata of `main`. `None` when the
/// analysis did not run.
fn pointed_to_functions(module: &Module, log: &Logger) -> Option<BTreeSet<String>> {
    let main = module.find_function("main")?;
    let list = module.function(main).metadata.get(FUNC_POINTED_TO_LIST)?;
    info!(log, "Using pointer analysis for function pointers");
    Some(list.split_whitespace().map(String::from).collect())
}

/// Enumerates the probe sites in function and layout order.
pub fn select_sites(
    module: &Module,
    config: &Config,
    pointed_to: Option<&BTreeSet<String>>,
) -> Result<Vec<Site>, Fatal> {
    let mut sites = Vec::new();
    for id in module.function_ids() {
        let func = module.function(id);
        if func.is_declaration() {
            continue;
        }
        if pointed_to.is_some_and(|names| names.contains(&func.name)) {
            sites.push(Site::Entry(id));
        }
        let preds = func.predecessor_map();
        for &block in &func.layout {
            // Tokens need an identifier of their own, whatever the terminator.
            let annotated = !config.is_coverage() && block_has_entries(func, block);
            let wanted = match &func.block(block).term {
                Terminator::Switch { .. } => {
                    return Err(Fatal::SwitchPresent {
                        function: func.name.clone(),
                        block,
                    });
                }
                Terminator::Ret(_)
                | Terminator::Br(_)
                | Terminator::Resume(_)
                | Terminator::Unreachable => annotated,
                Terminator::CondBr { .. } => true,
                Terminator::Invoke { unwind, .. } => {
                    let predecessors = preds.get(unwind).map_or(0, Vec::len);
                    if predecessors != 1 {
                        return Err(Fatal::SharedLandingPad {
                            function: func.name.clone(),
                            block: *unwind,
                            predecessors,
                        });
                    }
                    true
                }
            };
            if wanted {
                let count = func.successors(block).len();
                sites.extend((0..count).map(|index| Site::Edge {
                    func: id,
                    block,
                    index,
                }));
            }
        }
    }
    Ok(sites)
}

fn materialize(
    func: &mut Function,
    runtime: &Runtime,
    site: Site,
    id: u32,
    slot: u32,
) -> Result<(), Fatal> {
    let (block, index) = match site {
        Site::Entry(_) => {
            if let Some(entry) = func.entry() {
                let at = func.first_insertion_point(entry);
                runtime.emit_probe(func, entry, at, id, slot);
            }
            return Ok(());
        }
        Site::Edge { block, index, .. } => (block, index),
    };
    let Some(&target) = func.successors(block).get(index) else {
        return Ok(());
    };

    if func.single_predecessor(target) == Some(block) {
        let name = &func.block(target).name;
        if name.contains(AFL_BLOCK_PREFIX) {
            return Err(Fatal::AlreadyInstrumented {
                function: func.name.clone(),
                name: name.clone(),
            });
        }
        let base = if name.is_empty() { "NoName" } else { name.as_str() };
        let renamed = format!("{AFL_BLOCK_PREFIX}{base}.{id}");
        func.block_mut(target).name = renamed;
        let at = func.first_insertion_point(target);
        runtime.emit_probe(func, target, at, id, slot);
        return Ok(());
    }

    let probe = func.add_block_before(format!("{AFL_BLOCK_PREFIX}New.{id}"), target);
    func.set_terminator(probe, Terminator::Br(target));
    func.redirect_successor(block, index, probe);
    if func.successors(block).contains(&target) {
        // The source still reaches the target through another successor.
        for phi in func.phis(target) {
            if let InstKind::Phi { incoming, .. } = &mut func.inst_mut(phi).kind {
                let from_block = incoming.iter().find(|(_, pred)| *pred == block).cloned();
                if let Some((value, _)) = from_block {
                    incoming.push((value, probe));
                }
            }
        }
    } else {
        func.replace_phi_incoming_block(target, block, probe);
    }
    runtime.emit_probe(func, probe, 0, id, slot);
    Ok(())
}

/// Sorted `file:line` list of each block, skipping runtime and intrinsic
/// calls.
fn source_lines(module: &Module, func: &Function, blocks: &[BlockId]) -> String {
    let is_program = |kind: &InstKind| match kind {
        InstKind::Call {
            callee: Callee::Direct(id),
            ..
        } => {
            let callee = module.function(*id);
            !callee.is_intrinsic() && !callee.name.starts_with(AFL_SYMBOL_PREFIX)
        }
        _ => true,
    };
    let mut parts = Vec::new();
    for &block in blocks {
        let lines: BTreeSet<String> = func
            .block(block)
            .insts
            .iter()
            .map(|inst| func.inst(*inst))
            .filter(|inst| is_program(&inst.kind))
            .filter_map(|inst| inst.loc.as_ref())
            .map(|loc| format!("{}:{}", loc.file, loc.line))
            .collect();
        parts.extend(lines);
    }
    parts.join(",")
}

/// Defines `name` as a function returning `value`, replacing any previous
/// body or declaration.
fn define_accessor(module: &mut Module, name: &str, value: u32) {
    let mut b = FunctionBuilder::new(name, vec![], Type::I32);
    let entry = b.create_block("entry");
    b.switch_to(entry);
    b.ret(Some(Value::int(32, u64::from(value))));
    match module.find_function(name) {
        Some(id) => *module.function_mut(id) = b.finish(),
        None => {
            module.add_function(b.finish());
        }
    }
}
