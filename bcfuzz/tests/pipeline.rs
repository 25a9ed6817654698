use std::collections::BTreeSet;
use std::fs;

use assert_matches::assert_matches;
use bcfuzz::config::{BuildType, Config, ConvertMode, CounterMode, DictType};
use bcfuzz::coordinator::{OutputPaths, Pipeline};
use bcfuzz::error::Fatal;
use bcfuzz::ir::builder::FunctionBuilder;
use bcfuzz::ir::interp::Machine;
use bcfuzz::ir::{DebugLoc, Global, Init, InstKind, Module, Predicate, Type, Value, sign_extend};
use bcfuzz::log::discard;

fn fuzzing(dict_type: DictType) -> Config {
    Config {
        seed: Some(42),
        ..Config::fuzzing(dict_type, ConvertMode::All)
    }
}

/// `bool is_magic(u32 x) { return x == 0x12345678; }`
fn magic_module() -> Module {
    let mut module = Module::new("magic");
    let mut b = FunctionBuilder::new("is_magic", vec![Type::I32], Type::I1);
    let entry = b.create_block("entry");
    b.switch_to(entry);
    let cmp = b.icmp(Predicate::Eq, Value::Arg(0), Value::int(32, 0x1234_5678));
    b.ret(Some(cmp));
    b.finish_module(&mut module);
    module
}

/// `int check(char *input) { int r = strcmp(input, "AB"); if (r == 0) {...} return r; }`
fn strcmp_module() -> Module {
    let mut module = Module::new("strcmp");
    let strcmp = module.get_or_insert_function("strcmp", vec![Type::Ptr, Type::Ptr], Type::I32);
    let literal = module.add_global(Global {
        name: ".str".into(),
        constant: true,
        thread_local: false,
        init: Some(Init::Bytes(b"AB\0".to_vec())),
    });
    let mut b = FunctionBuilder::new("check", vec![Type::Ptr], Type::I32);
    let entry = b.create_block("entry");
    let matched = b.create_block("matched");
    let done = b.create_block("done");
    b.switch_to(entry);
    let result = b.call(strcmp, vec![Value::Arg(0), Value::Global(literal)], Type::I32);
    let same = b.icmp(Predicate::Eq, result.clone(), Value::int(32, 0));
    b.cond_br(same, matched, done);
    b.switch_to(matched);
    b.br(done);
    b.switch_to(done);
    b.ret(Some(result));
    b.finish_module(&mut module);
    module
}

/// ```c
/// int classify(int x) {      // a.c
///   if (x < -5) return 1;    // 2, 3
///   return x >= 1000 ? 3 : 2; // 5
/// }
/// ```
fn classify_module() -> Module {
    let mut module = Module::new("classify");
    let mut b = FunctionBuilder::new("classify", vec![Type::I32], Type::I32);
    let entry = b.create_block("entry");
    let low = b.create_block("low");
    let rest = b.create_block("rest");
    let exit = b.create_block("exit");
    b.switch_to(entry);
    b.set_loc(Some(DebugLoc::new("src/a.c", 2)));
    let below = b.icmp(Predicate::Slt, Value::Arg(0), Value::int(32, (-5i64) as u64));
    b.cond_br(below, low, rest);
    b.switch_to(low);
    b.set_loc(Some(DebugLoc::new("src/a.c", 3)));
    b.add(Value::int(32, 0), Value::int(32, 0));
    b.br(exit);
    b.switch_to(rest);
    b.set_loc(Some(DebugLoc::new("src/a.c", 5)));
    let big = b.icmp(Predicate::Sge, Value::Arg(0), Value::int(32, 1000));
    let picked = b.select(big, Value::int(32, 3), Value::int(32, 2));
    b.br(exit);
    b.switch_to(exit);
    let result = b.phi(Type::I32, vec![(Value::int(32, 1), low), (picked, rest)]);
    b.ret(Some(result));
    b.finish_module(&mut module);
    module
}

fn classify(x: i32) -> i32 {
    if x < -5 {
        1
    } else if x >= 1000 {
        3
    } else {
        2
    }
}

const SAMPLES: [i32; 10] = [-100, -6, -5, 0, 7, 999, 1000, 1_000_000, i32::MIN, i32::MAX];

fn run_check(module: &Module, map_size: u32, input: &[u8]) -> (i64, Vec<u32>) {
    let mut machine = Machine::new(module).with_coverage_map(map_size);
    let input = machine.memory.alloc_bytes(input);
    let raw = machine.call("check", &[input]).unwrap();
    (sign_extend(32, raw), machine.trace.clone())
}

#[test]
fn magic_integer_is_split_and_recorded_once() {
    let original = magic_module();
    let mut module = original.clone();
    let artifacts = Pipeline::new(&fuzzing(DictType::Normal), discard())
        .run(&mut module)
        .unwrap();

    let entries = artifacts.dictionary.entries(DictType::Normal);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].0, "\\x78\\x56\\x34\\x12");
    assert!(entries[0].1.starts_with("C2U_NDEBUG_"), "{}", entries[0].1);

    let func = module.function(module.find_function("is_magic").unwrap());
    for inst in func.live_insts() {
        if let InstKind::Icmp { lhs, .. } = func.kind(inst) {
            assert!(func.int_width(lhs).unwrap() <= 8);
        }
    }

    let mut before = Machine::new(&original);
    let mut after = Machine::new(&module).with_coverage_map(artifacts.map_size);
    for x in [0x1234_5678u64, 0x1234_5679, 0x0034_5678, 0x1200_5678, 0x1234_0078, 0, 0xffff_ffff] {
        assert_eq!(before.call("is_magic", &[x]), after.call("is_magic", &[x]), "{x:#x}");
    }
    assert!(after.coverage().iter().any(|&count| count != 0));
}

#[test]
fn strcmp_against_a_literal_keeps_its_sign() {
    let mut module = strcmp_module();
    let artifacts = Pipeline::new(&fuzzing(DictType::Optimized), discard())
        .run(&mut module)
        .unwrap();
    assert_eq!(artifacts.stats.strings.strcmp, 1);
    assert!(
        artifacts
            .dictionary
            .entries(DictType::Optimized)
            .iter()
            .any(|(value, tag)| *value == "AB" && tag.starts_with("S2U_NDEBUG_"))
    );

    let (same, full) = run_check(&module, artifacts.map_size, b"AB\0");
    assert_eq!(same, 0);
    let (after, _) = run_check(&module, artifacts.map_size, b"AC\0");
    assert!(after > 0);
    assert_eq!(after.signum(), i64::from(b'C' - b'B').signum());
    let (early, short) = run_check(&module, artifacts.map_size, b"XY\0");
    assert_eq!(early, i64::from(b'X' - b'A'));
    assert!(short.len() < full.len(), "{short:?} vs {full:?}");
}

#[test]
fn map_size_overflow_is_fatal_and_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        map_size_kib: Some(4096),
        ..fuzzing(DictType::Normal)
    };
    let mut module = magic_module();
    let before = module.to_string();

    let err = Pipeline::new(&config, discard()).run(&mut module).unwrap_err();
    assert_matches!(
        err.downcast_ref::<Fatal>(),
        Some(Fatal::MapSizeOverflow {
            requested: 4096,
            max: 4095
        })
    );
    assert_eq!(module.to_string(), before);
    assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
fn dictionary_path_is_written_once() {
    let dir = tempfile::tempdir().unwrap();
    let config = fuzzing(DictType::Normal);

    let mut module = magic_module();
    let artifacts = Pipeline::new(&config, discard()).run(&mut module).unwrap();
    let first = OutputPaths::in_dir(dir.path(), BuildType::Fuzzing);
    artifacts.write(&first, &discard()).unwrap();

    let dict = fs::read_to_string(&first.dictionary).unwrap();
    let mut lines = dict.lines();
    let header = lines.next().unwrap();
    assert_eq!(
        header,
        format!(
            "# AFL_DICT_TYPE=NORMAL; AFL_COVERAGE_TYPE=ORIGINAL; AFL_BUILD_ID={:016x}",
            artifacts.build_id
        )
    );
    let entry = lines.next().unwrap();
    assert!(entry.starts_with("AFL_C2U_NDEBUG_"), "{entry}");
    assert!(entry.ends_with("=\"\\x78\\x56\\x34\\x12\""), "{entry}");
    assert_eq!(lines.next(), None);

    let mut again = magic_module();
    let artifacts = Pipeline::new(&config, discard()).run(&mut again).unwrap();
    let second = OutputPaths {
        map_size: dir.path().join("second.mapsize"),
        bb_count: dir.path().join("second.bbsize"),
        build_id: dir.path().join("second.buildid"),
        ..first.clone()
    };
    let err = artifacts.write(&second, &discard()).unwrap_err();
    assert_matches!(err.downcast_ref::<Fatal>(), Some(Fatal::OutputExists(path)) if *path == first.dictionary);
    assert!(!second.map_size.exists());
}

#[test]
fn instrumented_code_behaves_like_the_original() {
    let original = classify_module();
    for counter in [CounterMode::Classic, CounterMode::NoCollision] {
        let mut module = original.clone();
        let config = Config {
            counter,
            ..fuzzing(DictType::Normal)
        };
        let artifacts = Pipeline::new(&config, discard()).run(&mut module).unwrap();
        assert_eq!(artifacts.stats.selects, 1);
        let expected_map = match counter {
            CounterMode::Classic => 65536,
            CounterMode::NoCollision => artifacts.bb_count,
        };
        assert_eq!(artifacts.map_size, expected_map);
        assert!(artifacts.stats.compares.sign_normalized >= 1);

        let mut machine = Machine::new(&module).with_coverage_map(artifacts.map_size);
        for x in SAMPLES {
            let got = machine.call("classify", &[u64::from(x as u32)]).unwrap();
            assert_eq!(sign_extend(32, got), i64::from(classify(x)), "{counter:?} {x}");
        }
        assert!(machine.coverage().iter().filter(|&&count| count != 0).count() > 2);
    }
}

#[test]
fn coverage_builds_map_every_identifier_to_source() {
    let mut module = classify_module();
    let artifacts = Pipeline::new(&Config::coverage(ConvertMode::All), discard())
        .run(&mut module)
        .unwrap();
    let probes = artifacts.stats.probes;
    assert!(probes > 0);
    assert_eq!(artifacts.bb_count, probes + 1);
    assert_eq!(artifacts.map_size, artifacts.bb_count);

    let source_map = artifacts.source_map.as_ref().unwrap();
    assert_eq!(source_map.len(), probes as usize);
    for id in 1..artifacts.bb_count {
        let lines = source_map.get(id).unwrap();
        assert!(
            lines
                .split(',')
                .filter(|line| !line.is_empty())
                .all(|line| line.starts_with("src/a.c:")),
            "{id}={lines}"
        );
    }

    let mut seen = BTreeSet::new();
    let mut machine = Machine::new(&module).with_coverage_map(artifacts.map_size);
    for x in SAMPLES {
        machine.trace.clear();
        machine.reset_coverage();
        let got = machine.call("classify", &[u64::from(x as u32)]).unwrap();
        assert_eq!(sign_extend(32, got), i64::from(classify(x)));
        for (id, &count) in machine.coverage().iter().enumerate() {
            let traced = machine.trace.iter().filter(|t| **t as usize == id).count();
            assert_eq!(usize::from(count), traced, "x={x} id={id}");
        }
        seen.extend(machine.trace.iter().copied());
    }
    assert!(seen.iter().all(|id| (1..artifacts.bb_count).contains(id)));

    let dir = tempfile::tempdir().unwrap();
    let paths = OutputPaths::in_dir(dir.path(), BuildType::Coverage);
    artifacts.write(&paths, &discard()).unwrap();
    let written = fs::read_to_string(paths.source_map.as_ref().unwrap()).unwrap();
    assert_eq!(written, source_map.render());
    assert_eq!(written.lines().count(), probes as usize);
    assert!(!paths.dictionary.exists());
    assert_eq!(
        fs::read(&paths.map_size).unwrap(),
        artifacts.map_size.to_le_bytes().to_vec()
    );
}

#[test]
fn convert_none_only_records() {
    let mut module = magic_module();
    let config = Config {
        convert: ConvertMode::None,
        ..fuzzing(DictType::Normal)
    };
    let artifacts = Pipeline::new(&config, discard()).run(&mut module).unwrap();
    assert_eq!(artifacts.stats.compares.halved, 0);
    assert_eq!(artifacts.dictionary.entries(DictType::Normal).len(), 1);
    let func = module.function(module.find_function("is_magic").unwrap());
    assert_eq!(func.layout.len(), 1);
}
