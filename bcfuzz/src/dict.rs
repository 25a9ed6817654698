//! Dictionary tokens.
//!
//! Harvested literals travel in two stages. While the passes run they are
//! [`Annotations`] on the instruction that consumes them, so they follow the
//! instruction through decomposition. Once identifiers are assigned, the
//! edge pass copies the annotations of every instrumented block into the
//! module-wide [`Dictionary`], which is what gets written to disk.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::path::Path;

use serde::{Deserialize, Serialize};
use slog::{Logger, warn};

use crate::config::{CounterMode, DictType, Limits};
use crate::error::Fatal;
use crate::ir::{BlockId, Function, InstId};

/// Where a token was found.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Origin {
    /// Constant operand of an integer equality.
    ComparedInteger,
    /// Constant operand of a string or memory comparison call.
    ComparedString,
    /// Constant array copied with `llvm.memcpy` and later compared.
    ArrayLiteral,
    /// Integer constant stored to memory that is later compared.
    StoredConstant,
    /// Integer field of a constant struct passed to a call.
    StructField,
    /// String literal passed to any other call.
    CallArgument,
}

impl Origin {
    /// The tag class written to the dictionary.
    pub fn class(self) -> &'static str {
        match self {
            Origin::ComparedInteger => "C2U",
            Origin::ComparedString
            | Origin::ArrayLiteral
            | Origin::StoredConstant
            | Origin::StructField => "S2U",
            Origin::CallArgument => "SIC",
        }
    }

    /// Whether one instruction may carry several tokens of this origin.
    pub fn is_multiple(self) -> bool {
        matches!(self, Origin::StructField | Origin::CallArgument)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DictEntry {
    /// Escaped token, without the surrounding quotes.
    pub value: String,
    pub provenance: String,
    pub origin: Origin,
    /// Position among the tokens of the same class on one instruction.
    /// `None` for single-slot origins.
    #[serde(default)]
    pub slot: Option<usize>,
}

impl DictEntry {
    /// Escapes `bytes` into a token. Returns `None`, with a warning, when the
    /// length is out of bounds.
    pub fn new(
        bytes: &[u8],
        text: bool,
        provenance: String,
        origin: Origin,
        limits: &Limits,
        log: &Logger,
    ) -> Option<Self> {
        match stringify(bytes, text, limits) {
            Some(value) => Some(Self {
                value,
                provenance,
                origin,
                slot: None,
            }),
            None => {
                warn!(log, "Ignoring token of invalid length '{}'", String::from_utf8_lossy(bytes));
                None
            }
        }
    }

    /// `ORIGIN[_n]_PROVENANCE`.
    pub fn tag(&self) -> String {
        match self.slot {
            Some(n) => format!("{}_{n}_{}", self.origin.class(), self.provenance),
            None => format!("{}_{}", self.origin.class(), self.provenance),
        }
    }
}

/// Escapes a token so it can sit between double quotes in a dictionary line.
///
/// Control bytes, bytes above `0x7e`, `=`, `"` and `\` are written as `\xHH`.
/// Binary tokens escape every byte. Text tokens lose one trailing NUL.
pub fn stringify(bytes: &[u8], text: bool, limits: &Limits) -> Option<String> {
    if bytes.len() < limits.min_token_len || bytes.len() > limits.max_token_len {
        return None;
    }
    let bytes = match bytes.split_last() {
        Some((0, rest)) if text => rest,
        _ => bytes,
    };
    let mut token = String::with_capacity(bytes.len() * 4);
    for &byte in bytes {
        match byte {
            0..=31 | 127..=255 | b'=' | b'"' | b'\\' => {
                let _ = write!(token, "\\x{byte:02x}");
            }
            _ if text => token.push(char::from(byte)),
            _ => {
                let _ = write!(token, "\\x{byte:02x}");
            }
        }
    }
    Some(token)
}

/// Source location of an instruction as a tag fragment, e.g. `parse_c_42`.
///
/// Falls back to the first located instruction of the same block, then to
/// `NDEBUG`.
pub fn provenance(func: &Function, inst: InstId) -> String {
    let own = func.inst(inst);
    let loc = own.loc.as_ref().or_else(|| {
        own.block.and_then(|block| {
            func.block(block)
                .insts
                .iter()
                .find_map(|id| func.inst(*id).loc.as_ref())
        })
    });
    match loc {
        Some(loc) => {
            let file = Path::new(&loc.file)
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| loc.file.clone());
            format!("{}_{}", file.replace('-', "__").replace('.', "_"), loc.line)
        }
        None => "NDEBUG".to_string(),
    }
}

/// Per-function multi-map from instructions to the tokens they consume.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotations {
    entries: BTreeMap<InstId, Vec<DictEntry>>,
}

impl Annotations {
    /// Attaches `entry` to `inst`.
    ///
    /// A single-slot entry replaces the previous one of the same class.
    /// Multi-slot entries get the next free slot, up to `max_fan_out`.
    pub fn attach(
        &mut self,
        inst: InstId,
        mut entry: DictEntry,
        limits: &Limits,
        function: &str,
    ) -> Result<(), Fatal> {
        let list = self.entries.entry(inst).or_default();
        let class = entry.origin.class();
        if entry.origin.is_multiple() {
            let used = list
                .iter()
                .filter(|e| e.origin.class() == class && e.slot.is_some())
                .count();
            if used >= limits.max_fan_out {
                return Err(Fatal::FanOutExceeded {
                    function: function.to_string(),
                    limit: limits.max_fan_out,
                });
            }
            entry.slot = Some(used);
        } else {
            entry.slot = None;
            list.retain(|e| !(e.origin.class() == class && e.slot.is_none()));
        }
        list.push(entry);
        Ok(())
    }

    pub fn get(&self, inst: InstId) -> &[DictEntry] {
        self.entries.get(&inst).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Removes and returns the entries of `inst` matching `filter`.
    pub fn take_matching(
        &mut self,
        inst: InstId,
        filter: impl Fn(&DictEntry) -> bool,
    ) -> Vec<DictEntry> {
        let Some(list) = self.entries.get_mut(&inst) else {
            return Vec::new();
        };
        let (taken, kept): (Vec<_>, Vec<_>) = list.drain(..).partition(|e| filter(e));
        *list = kept;
        taken
    }

    /// Moves the entries of `origin` from one instruction to another.
    pub fn move_origin(&mut self, from: InstId, to: InstId, origin: Origin) {
        let Some(list) = self.entries.get_mut(&from) else {
            return;
        };
        let (moved, kept): (Vec<_>, Vec<_>) = list.drain(..).partition(|e| e.origin == origin);
        *list = kept;
        if !moved.is_empty() {
            self.entries.entry(to).or_default().extend(moved);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.values().all(Vec::is_empty)
    }

    pub fn iter(&self) -> impl Iterator<Item = (InstId, &DictEntry)> {
        self.entries
            .iter()
            .flat_map(|(inst, list)| list.iter().map(move |e| (*inst, e)))
    }
}

/// Whether any live instruction of `block` carries a token.
pub fn block_has_entries(func: &Function, block: BlockId) -> bool {
    func.block(block)
        .insts
        .iter()
        .any(|inst| !func.annotations.get(*inst).is_empty())
}

/// Module-wide set of `(token, tag)` records, ordered by token.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Dictionary {
    records: BTreeSet<(String, String)>,
}

impl Dictionary {
    /// Records `entry` as seen through the probe with identifier `id`.
    pub fn record(&mut self, entry: &DictEntry, id: u32) {
        self.records
            .insert((entry.value.clone(), format!("{}_{id:08x}", entry.tag())));
    }

    /// Records every token of `block`.
    pub fn record_block(&mut self, func: &Function, block: BlockId, id: u32) {
        for inst in &func.block(block).insts {
            for entry in func.annotations.get(*inst) {
                self.record(entry, id);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records kept by the given policy: NORMAL keeps the first tag of every
    /// distinct token, OPTIMIZED keeps everything.
    pub fn entries(&self, dict_type: DictType) -> Vec<(&str, &str)> {
        let mut seen = BTreeSet::new();
        self.records
            .iter()
            .filter(|(value, _)| dict_type == DictType::Optimized || seen.insert(value.as_str()))
            .map(|(value, tag)| (value.as_str(), tag.as_str()))
            .collect()
    }

    /// The dictionary file contents.
    pub fn render(
        &self,
        dict_type: DictType,
        counter: CounterMode,
        build_id: u64,
    ) -> String {
        let mut out = format!(
            "# AFL_DICT_TYPE={}; AFL_COVERAGE_TYPE={}; AFL_BUILD_ID={build_id:016x}\n",
            dict_type.as_str(),
            counter.as_str(),
        );
        for (value, tag) in self.entries(dict_type) {
            let _ = writeln!(out, "AFL_{tag}=\"{value}\"");
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::ir::DebugLoc;
    use crate::ir::builder::FunctionBuilder;
    use crate::ir::{Type, Value};

    fn entry(value: &str, origin: Origin) -> DictEntry {
        DictEntry {
            value: value.to_string(),
            provenance: "main_c_3".to_string(),
            origin,
            slot: None,
        }
    }

    #[test]
    fn stringify_escapes_special_bytes() {
        let limits = Limits::default();
        assert_eq!(stringify(b"a=\"b\\", true, &limits).unwrap(), "a\\x3d\\x22b\\x5c");
        assert_eq!(stringify(b"GET\0", true, &limits).unwrap(), "GET");
        assert_eq!(
            stringify(&[0x78, 0x56, 0x34, 0x12], false, &limits).unwrap(),
            "\\x78\\x56\\x34\\x12"
        );
        assert_eq!(stringify(b"ab", true, &limits), None);
        assert_eq!(stringify(&[b'x'; 33], true, &limits), None);
    }

    #[test]
    fn provenance_uses_the_file_basename() {
        let mut b = FunctionBuilder::new("f", vec![Type::I32], Type::I1);
        let entry_block = b.create_block("entry");
        b.switch_to(entry_block);
        b.set_loc(Some(DebugLoc::new("/src/my-lib/parse.c", 42)));
        let cmp = b.icmp(crate::ir::Predicate::Eq, Value::Arg(0), Value::int(32, 7));
        b.set_loc(None);
        let other = b.icmp(crate::ir::Predicate::Ne, Value::Arg(0), Value::int(32, 9));
        b.ret(Some(cmp.clone()));
        let func = b.finish();

        assert_eq!(provenance(&func, cmp.as_inst().unwrap()), "parse_c_42");
        assert_eq!(provenance(&func, other.as_inst().unwrap()), "parse_c_42");

        let mut b = FunctionBuilder::new("g", vec![], Type::Void);
        let block = b.create_block("entry");
        b.switch_to(block);
        let add = b.add(Value::int(8, 1), Value::int(8, 2));
        b.ret(None);
        let func = b.finish();
        assert_eq!(provenance(&func, add.as_inst().unwrap()), "NDEBUG");
    }

    #[test]
    fn multiple_slots_are_bounded() {
        let limits = Limits {
            max_fan_out: 2,
            ..Limits::default()
        };
        let mut annotations = Annotations::default();
        let inst = InstId(4);
        annotations
            .attach(inst, entry("one", Origin::CallArgument), &limits, "f")
            .unwrap();
        annotations
            .attach(inst, entry("two", Origin::CallArgument), &limits, "f")
            .unwrap();
        assert_matches!(
            annotations.attach(inst, entry("three", Origin::CallArgument), &limits, "f"),
            Err(Fatal::FanOutExceeded { limit: 2, .. })
        );
        let tags: Vec<_> = annotations.get(inst).iter().map(DictEntry::tag).collect();
        assert_eq!(tags, vec!["SIC_0_main_c_3", "SIC_1_main_c_3"]);
    }

    #[test]
    fn single_slots_are_replaced() {
        let limits = Limits::default();
        let mut annotations = Annotations::default();
        annotations
            .attach(InstId(1), entry("first", Origin::ComparedString), &limits, "f")
            .unwrap();
        annotations
            .attach(InstId(1), entry("second", Origin::ArrayLiteral), &limits, "f")
            .unwrap();
        annotations
            .attach(InstId(1), entry("field", Origin::StructField), &limits, "f")
            .unwrap();
        let values: Vec<_> = annotations.get(InstId(1)).iter().map(|e| e.value.as_str()).collect();
        assert_eq!(values, vec!["second", "field"]);
    }

    #[test]
    fn normal_dictionaries_keep_one_line_per_value() {
        let mut dict = Dictionary::default();
        dict.record(&entry("abcd", Origin::ComparedInteger), 1);
        dict.record(&entry("abcd", Origin::ComparedInteger), 2);
        dict.record(&entry("zzzz", Origin::ComparedString), 2);

        let normal = dict.render(DictType::Normal, CounterMode::NoCollision, 0xab);
        assert_eq!(
            normal,
            "# AFL_DICT_TYPE=NORMAL; AFL_COVERAGE_TYPE=NO_COLLISION; AFL_BUILD_ID=00000000000000ab\n\
             AFL_C2U_main_c_3_00000001=\"abcd\"\n\
             AFL_S2U_main_c_3_00000002=\"zzzz\"\n"
        );
        assert_eq!(dict.entries(DictType::Optimized).len(), 3);
    }
}
