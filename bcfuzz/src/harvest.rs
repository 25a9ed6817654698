//! Literal harvesting.
//!
//! Scans every function for constant data that ends up compared against
//! program input and attaches it, as dictionary annotations, to the
//! instruction that consumes it:
//!
//! - arrays copied out of constant globals with `llvm.memcpy` and later
//!   handed to a comparison call,
//! - integer constants stored to memory that is later compared,
//! - integer fields of constant structs passed to calls,
//! - string literals passed to any call not on the [`DENYLIST`].

use slog::{Logger, info, warn};

use crate::config::{Config, Limits};
use crate::constants::STRCMP_FAMILY;
use crate::dict::{DictEntry, Origin, provenance};
use crate::error::Fatal;
use crate::ir::{
    CallConv, Callee, Constant, FuncId, Function, Init, InstId, InstKind, Module, Value,
    trim_at_nul,
};

/// Callees whose string arguments are noise: logging, error reporting and
/// string building. Matched as case-insensitive substrings.
pub const DENYLIST: &[&str] = &[
    "assert", "abort", "err", "warn", "debug", "fatal", "strcat", "strncat", "strcpy", "strncpy",
    "append", "prepend", "strdup", "write", "print", "memcpy",
];

/// Callees skipped on an exact name match.
pub const DENYLIST_EXACT: &[&str] = &["puts", "fputs"];

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HarvestStats {
    pub arrays: usize,
    pub stores: usize,
    pub struct_fields: usize,
    pub call_strings: usize,
}

impl HarvestStats {
    pub fn total(&self) -> usize {
        self.arrays + self.stores + self.struct_fields + self.call_strings
    }
}

/// Runs every harvester over the module.
pub fn harvest(module: &mut Module, config: &Config, log: &Logger) -> Result<HarvestStats, Fatal> {
    let stats = HarvestStats {
        arrays: harvest_arrays(module, &config.limits, log)?,
        stores: harvest_stores(module, &config.limits, log)?,
        struct_fields: harvest_structs(module, &config.limits, log)?,
        call_strings: harvest_call_strings(module, config, log)?,
    };
    if stats.total() == 0 {
        warn!(log, "No entries added to DICT.");
    } else {
        info!(log, "Added {} entries to DICT.", stats.total();
            "arrays" => stats.arrays,
            "stores" => stats.stores,
            "struct_fields" => stats.struct_fields,
            "call_strings" => stats.call_strings);
    }
    Ok(stats)
}

/// Name of the direct callee of a C call, if `inst` is one.
fn c_callee<'m>(module: &'m Module, func: &Function, inst: InstId) -> Option<&'m str> {
    match func.kind(inst) {
        InstKind::Call {
            callee: Callee::Direct(id),
            ..
        } => {
            let target = module.function(*id);
            (target.conv == CallConv::C).then_some(target.name.as_str())
        }
        _ => None,
    }
}

pub fn is_compare_call(module: &Module, func: &Function, inst: InstId) -> bool {
    c_callee(module, func, inst).is_some_and(|name| STRCMP_FAMILY.contains(&name))
}

fn call_args(func: &Function, inst: InstId) -> &[Value] {
    match func.kind(inst) {
        InstKind::Call { args, .. } => args,
        _ => &[],
    }
}

/// Comparison calls reading `value` directly or through one more instruction.
fn compare_consumers(module: &Module, func: &Function, value: InstId, skip: InstId) -> Vec<InstId> {
    let mut consumers = Vec::new();
    for user in func.inst_users(value).into_iter().filter(|user| *user != skip) {
        if is_compare_call(module, func, user) {
            consumers.push(user);
            continue;
        }
        for second in func.inst_users(user) {
            if is_compare_call(module, func, second) && !consumers.contains(&second) {
                consumers.push(second);
            }
        }
    }
    consumers
}

/// Attaches `entry` to every comparison or φ reading the result of `call`.
/// Returns how many instructions received it.
pub fn attach_to_result_users(
    func: &mut Function,
    call: InstId,
    entry: &DictEntry,
    limits: &Limits,
) -> Result<usize, Fatal> {
    let targets: Vec<InstId> = func
        .inst_users(call)
        .into_iter()
        .filter(|user| matches!(func.kind(*user), InstKind::Icmp { .. } | InstKind::Phi { .. }))
        .collect();
    for target in &targets {
        func.annotations
            .attach(*target, entry.clone(), limits, &func.name)?;
    }
    Ok(targets.len())
}

fn apply(
    module: &mut Module,
    pending: Vec<(FuncId, InstId, DictEntry, bool)>,
    limits: &Limits,
) -> Result<usize, Fatal> {
    let mut added = 0;
    for (id, inst, entry, on_result_users) in pending {
        let func = module.function_mut(id);
        if on_result_users {
            added += attach_to_result_users(func, inst, &entry, limits)?;
        } else {
            let name = func.name.clone();
            func.annotations.attach(inst, entry, limits, &name)?;
            added += 1;
        }
    }
    Ok(added)
}

/// Arrays copied from a constant global into memory that a comparison
/// call reads afterwards.
pub fn harvest_arrays(module: &mut Module, limits: &Limits, log: &Logger) -> Result<usize, Fatal> {
    let mut pending = Vec::new();
    for id in module.function_ids() {
        let func = module.function(id);
        for inst in func.live_insts() {
            if !c_callee(module, func, inst).is_some_and(|name| name.starts_with("llvm.memcpy")) {
                continue;
            }
            let args = call_args(func, inst);
            let (Some(Value::Inst(dst)), Some(src)) = (args.first(), args.get(1)) else {
                continue;
            };
            let Some(data) = module.constant_bytes(func, src) else {
                continue;
            };
            for consumer in compare_consumers(module, func, *dst, inst) {
                let is_memcmp = c_callee(module, func, consumer) == Some("memcmp");
                let bytes = if is_memcmp { data } else { trim_at_nul(data) };
                if let Some(entry) =
                    DictEntry::new(bytes, true, provenance(func, inst), Origin::ArrayLiteral, limits, log)
                {
                    pending.push((id, consumer, entry, true));
                }
            }
        }
    }
    apply(module, pending, limits)
}

/// Integer constants stored to memory that a comparison call reads.
pub fn harvest_stores(module: &mut Module, limits: &Limits, log: &Logger) -> Result<usize, Fatal> {
    let mut pending = Vec::new();
    for id in module.function_ids() {
        let func = module.function(id);
        for inst in func.live_insts() {
            let InstKind::Store {
                value: Value::Const(constant @ Constant::Int { .. }),
                ptr: Value::Inst(ptr),
            } = func.kind(inst)
            else {
                continue;
            };
            let Some(bytes) = constant.le_bytes() else {
                continue;
            };
            for consumer in compare_consumers(module, func, *ptr, inst) {
                if let Some(entry) = DictEntry::new(
                    &bytes,
                    true,
                    provenance(func, consumer),
                    Origin::StoredConstant,
                    limits,
                    log,
                ) {
                    pending.push((id, consumer, entry, true));
                }
            }
        }
    }
    apply(module, pending, limits)
}

fn struct_fields(init: &Init, out: &mut Vec<Vec<u8>>) {
    if let Init::Struct(fields) = init {
        for field in fields {
            match field {
                Init::Struct(_) => struct_fields(field, out),
                Init::Int { width, bits } if width % 8 == 0 && *width <= 64 => {
                    if let Some(bytes) = Constant::int(*width, *bits).le_bytes() {
                        out.push(bytes);
                    }
                }
                _ => {}
            }
        }
    }
}

/// Integer fields of constant structs passed to C calls.
pub fn harvest_structs(module: &mut Module, limits: &Limits, log: &Logger) -> Result<usize, Fatal> {
    let mut pending = Vec::new();
    for id in module.function_ids() {
        let func = module.function(id);
        for inst in func.live_insts() {
            if c_callee(module, func, inst).is_none() {
                continue;
            }
            for arg in call_args(func, inst) {
                let Value::Global(global) = arg else {
                    continue;
                };
                let global = module.global(*global);
                let Some(init @ Init::Struct(_)) = global.init.as_ref().filter(|_| global.constant)
                else {
                    continue;
                };
                let mut fields = Vec::new();
                struct_fields(init, &mut fields);
                for bytes in fields {
                    if let Some(entry) = DictEntry::new(
                        &bytes,
                        false,
                        provenance(func, inst),
                        Origin::StructField,
                        limits,
                        log,
                    ) {
                        pending.push((id, inst, entry, false));
                    }
                }
            }
        }
    }
    apply(module, pending, limits)
}

/// Whether string arguments passed to `name` are left alone.
pub fn is_denied(name: &str, ignore: &[String]) -> bool {
    let lower = name.to_ascii_lowercase();
    DENYLIST.iter().any(|word| lower.contains(word))
        || DENYLIST_EXACT.contains(&name)
        || ignore.iter().any(|ignored| ignored == name)
}

/// String literals passed as arguments to calls.
pub fn harvest_call_strings(
    module: &mut Module,
    config: &Config,
    log: &Logger,
) -> Result<usize, Fatal> {
    let mut pending = Vec::new();
    for id in module.function_ids() {
        let func = module.function(id);
        for inst in func.live_insts() {
            let InstKind::Call {
                callee: Callee::Direct(target),
                args,
                ..
            } = func.kind(inst)
            else {
                continue;
            };
            let target = module.function(*target);
            if target.is_intrinsic() || is_denied(&target.name, &config.ignore_strings_to) {
                continue;
            }
            if target.name == "getenv" {
                match args.first().and_then(|arg| module.constant_bytes(func, arg)) {
                    Some(name) => warn!(
                        log,
                        "Environment variable '{}' used",
                        String::from_utf8_lossy(trim_at_nul(name))
                    ),
                    None => warn!(log, "(Non-constant?) Environment variable used"),
                }
                continue;
            }
            if target.conv == CallConv::C && STRCMP_FAMILY.contains(&target.name.as_str()) {
                continue;
            }
            for arg in args {
                let Some(bytes) = module.constant_bytes(func, arg).filter(|b| !b.is_empty()) else {
                    continue;
                };
                if let Some(entry) = DictEntry::new(
                    bytes,
                    true,
                    provenance(func, inst),
                    Origin::CallArgument,
                    &config.limits,
                    log,
                ) {
                    pending.push((id, inst, entry, false));
                }
            }
        }
    }
    apply(module, pending, &config.limits)
}
