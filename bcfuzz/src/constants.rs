//! This module defines constants shared by the instrumentation passes and the
//! artifacts they produce. Most of them are names the runtime side of the
//! fuzzer links against, so they must not change.

/// Coverage map size in bytes when `AFL_MAP_SIZE` is unset. Classic
/// builds draw block locations below it.
pub const AFL_COVERAGE_MAP_SIZE: u32 = 65536;

/// Upper bound of the map size, in bytes. Coverage builds always request it.
pub const AFL_MAX_MAP_SIZE: u32 = (u32::MAX - 8) / 1024;

/// Largest accepted `AFL_MAP_SIZE` override, in KiB.
pub const AFL_MAX_MAP_SIZE_KIB: u32 = AFL_MAX_MAP_SIZE / 1024;

/// External global holding the base address of the coverage map.
pub const AFL_AREA_PTR: &str = "__afl_area_ptr";

/// Thread-local global holding the shifted identifier of the last probe.
pub const AFL_PREV_LOC: &str = "__afl_prev_loc";

/// Runtime hook recording the identifier of every executed probe. Only
/// emitted when identifiers must be mapped back to tokens or source lines.
pub const AFL_BB_TRACE: &str = "__afl_bb_trace";

/// Accessor returning the coverage map size of the module.
pub const AFL_GET_AREA_SIZE: &str = "__afl_get_area_size";

/// Accessor returning the number of instrumented locations of the module.
pub const AFL_GET_BBAREA_SIZE: &str = "__afl_get_bbarea_size";

/// Prefix of every runtime symbol. Calls to such functions never count as
/// program source.
pub const AFL_SYMBOL_PREFIX: &str = "__afl_";

/// Prefix given to blocks that carry an edge probe.
pub const AFL_BLOCK_PREFIX: &str = "AFL.";

/// Metadata key on `main` listing the functions reachable through pointers.
pub const FUNC_POINTED_TO_LIST: &str = "FuncPointedToList";

/// Seed used by coverage builds, so identifiers are stable across rebuilds.
pub const COVERAGE_SEED: u64 = u32::from_le_bytes(*b"cove") as u64;

/// Dictionary tokens shorter than this are dropped.
pub const MIN_AUTO_EXTRA: usize = 3;

/// Dictionary tokens longer than this are dropped.
pub const MAX_AUTO_EXTRA: usize = 32;

/// Maximum number of dictionary entries one instruction may carry.
pub const MAX_DICT_FAN_OUT: usize = 20;

/// Longest comparison call unrolled into a per-byte chain. Longer ones are
/// left as calls.
pub const MAX_UNROLL_LEN: u64 = 4096;

/// Functions whose results are decomposed into per-byte comparison chains.
pub const STRCMP_FAMILY: &[&str] = &["strcmp", "strcasecmp", "strncmp", "strncasecmp", "memcmp"];
