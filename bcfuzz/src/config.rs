//! Run configuration.
//!
//! The passes never read the environment. A [`Config`] is built once, either
//! from the `AFL_*` variables with [`Config::from_env`] or programmatically,
//! and handed to every pass by reference.

use std::env;

use crate::constants::{
    AFL_COVERAGE_MAP_SIZE, AFL_MAX_MAP_SIZE, AFL_MAX_MAP_SIZE_KIB, COVERAGE_SEED,
    MAX_AUTO_EXTRA, MAX_DICT_FAN_OUT, MAX_UNROLL_LEN, MIN_AUTO_EXTRA,
};
use crate::error::Fatal;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuildType {
    Fuzzing,
    Coverage,
}

impl BuildType {
    pub fn as_str(self) -> &'static str {
        match self {
            BuildType::Fuzzing => "FUZZING",
            BuildType::Coverage => "COVERAGE",
        }
    }
}

/// How dictionary entries are serialized.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DictType {
    /// One entry per distinct value.
    Normal,
    /// One entry per instrumented site, tagged with its identifier.
    Optimized,
}

impl DictType {
    pub fn as_str(self) -> &'static str {
        match self {
            DictType::Normal => "NORMAL",
            DictType::Optimized => "OPTIMIZED",
        }
    }
}

/// Which comparisons are decomposed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConvertMode {
    All,
    None,
    /// Everything except comparisons whose constant went to the dictionary.
    NotDict,
}

/// How an edge identifier is turned into a coverage map index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CounterMode {
    /// Random identifiers, `map[prev ^ id]++` then `prev = id >> 1`.
    /// Collisions are possible and tolerated.
    Classic,
    /// Dense identifiers from 1, `map[id]++`. No collisions.
    NoCollision,
}

impl CounterMode {
    pub fn as_str(self) -> &'static str {
        match self {
            CounterMode::Classic => "ORIGINAL",
            CounterMode::NoCollision => "NO_COLLISION",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Hardening {
    pub harden: bool,
    pub asan: bool,
    pub msan: bool,
}

impl Hardening {
    pub fn describe(&self) -> &'static str {
        if self.harden {
            "hardened"
        } else if self.asan || self.msan {
            "ASAN/MSAN"
        } else {
            "non-hardened"
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Limits {
    pub max_fan_out: usize,
    pub min_token_len: usize,
    pub max_token_len: usize,
    /// Bytes a string or memory comparison may be unrolled to.
    pub max_unroll_len: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_fan_out: MAX_DICT_FAN_OUT,
            min_token_len: MIN_AUTO_EXTRA,
            max_token_len: MAX_AUTO_EXTRA,
            max_unroll_len: MAX_UNROLL_LEN,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub build_type: BuildType,
    pub dict_type: DictType,
    pub convert: ConvertMode,
    pub counter: CounterMode,
    /// `AFL_MAP_SIZE` override in KiB.
    pub map_size_kib: Option<u64>,
    pub quiet: bool,
    /// Callees skipped when harvesting string arguments.
    pub ignore_strings_to: Vec<String>,
    pub hardening: Hardening,
    pub limits: Limits,
    /// Seed of the identifier draws. Drawn at random (and logged) when unset.
    pub seed: Option<u64>,
}

impl Config {
    pub fn fuzzing(dict_type: DictType, convert: ConvertMode) -> Self {
        Self {
            build_type: BuildType::Fuzzing,
            dict_type,
            convert,
            counter: CounterMode::Classic,
            map_size_kib: None,
            quiet: false,
            ignore_strings_to: Vec::new(),
            hardening: Hardening::default(),
            limits: Limits::default(),
            seed: None,
        }
    }

    /// Coverage builds always use a NORMAL dictionary and a fixed seed.
    pub fn coverage(convert: ConvertMode) -> Self {
        Self {
            build_type: BuildType::Coverage,
            seed: Some(COVERAGE_SEED),
            ..Self::fuzzing(DictType::Normal, convert)
        }
    }

    pub fn from_env() -> Result<Self, Fatal> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds the configuration from any variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Fatal> {
        let build_type = select(
            &lookup,
            "AFL_BUILD_TYPE",
            "COVERAGE,FUZZING",
            &[("COVERAGE", BuildType::Coverage), ("FUZZING", BuildType::Fuzzing)],
        )?;
        let convert = select(
            &lookup,
            "AFL_CONVERT_COMPARISON_TYPE",
            "NONE,ALL,NOT_DICT",
            &[
                ("NONE", ConvertMode::None),
                ("ALL", ConvertMode::All),
                ("NOT_DICT", ConvertMode::NotDict),
            ],
        )?;

        let mut config = match build_type {
            BuildType::Coverage => Self::coverage(convert),
            BuildType::Fuzzing => {
                let dict_type = select(
                    &lookup,
                    "AFL_DICT_TYPE",
                    "NORMAL,OPTIMIZED",
                    &[("NORMAL", DictType::Normal), ("OPTIMIZED", DictType::Optimized)],
                )?;
                Self::fuzzing(dict_type, convert)
            }
        };

        if let Some(value) = lookup("AFL_MAP_SIZE") {
            let kib = value
                .trim()
                .parse::<u64>()
                .map_err(|_| Fatal::InvalidMapSize(value.clone()))?;
            config.map_size_kib = Some(kib);
        }
        if lookup("AFL_NO_COLLISION").is_some() {
            config.counter = CounterMode::NoCollision;
        }
        config.quiet = lookup("AFL_QUIET").is_some();
        config.ignore_strings_to = lookup("AFL_IGNORE_STRINGS_TO")
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        config.hardening = Hardening {
            harden: lookup("AFL_HARDEN").is_some(),
            asan: lookup("AFL_USE_ASAN").is_some(),
            msan: lookup("AFL_USE_MSAN").is_some(),
        };
        Ok(config)
    }

    pub fn is_coverage(&self) -> bool {
        self.build_type == BuildType::Coverage
    }

    /// Coverage builds need a bijection between identifiers and edges to map
    /// them back to source lines, so they never use random identifiers.
    pub fn dense_ids(&self) -> bool {
        self.is_coverage() || self.counter == CounterMode::NoCollision
    }

    /// Whether every probe also calls the identifier trace hook.
    pub fn traces_ids(&self) -> bool {
        self.is_coverage() || self.dict_type == DictType::Optimized
    }

    /// Size of the coverage map in bytes.
    ///
    /// The override is checked even for coverage builds, which then always
    /// get the maximum.
    pub fn map_size(&self) -> Result<u32, Fatal> {
        let requested = self.map_size_kib.unwrap_or(0);
        if requested > u64::from(AFL_MAX_MAP_SIZE_KIB) {
            return Err(Fatal::MapSizeOverflow {
                requested,
                max: AFL_MAX_MAP_SIZE_KIB,
            });
        }
        if self.is_coverage() {
            return Ok(AFL_MAX_MAP_SIZE);
        }
        Ok(match requested {
            0 => AFL_COVERAGE_MAP_SIZE,
            kib => kib as u32 * 1024,
        })
    }
}

fn select<T: Copy>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    expected: &'static str,
    choices: &[(&str, T)],
) -> Result<T, Fatal> {
    let value = lookup(var).ok_or(Fatal::MissingSelection { var, expected })?;
    choices
        .iter()
        .find(|(name, _)| *name == value)
        .map(|(_, choice)| *choice)
        .ok_or(Fatal::InvalidSelection {
            var,
            value,
            expected,
        })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn reads_a_fuzzing_configuration() {
        let config = Config::from_lookup(lookup(&[
            ("AFL_BUILD_TYPE", "FUZZING"),
            ("AFL_DICT_TYPE", "OPTIMIZED"),
            ("AFL_CONVERT_COMPARISON_TYPE", "NOT_DICT"),
            ("AFL_MAP_SIZE", "128"),
            ("AFL_NO_COLLISION", "1"),
            ("AFL_IGNORE_STRINGS_TO", "log_line, trace"),
            ("AFL_USE_ASAN", "1"),
        ]))
        .unwrap();
        assert_eq!(config.dict_type, DictType::Optimized);
        assert_eq!(config.convert, ConvertMode::NotDict);
        assert_eq!(config.counter, CounterMode::NoCollision);
        assert_eq!(config.map_size(), Ok(128 * 1024));
        assert_eq!(config.ignore_strings_to, vec!["log_line", "trace"]);
        assert_eq!(config.hardening.describe(), "ASAN/MSAN");
        assert!(config.traces_ids());
    }

    #[test]
    fn coverage_builds_ignore_the_dict_type() {
        let config = Config::from_lookup(lookup(&[
            ("AFL_BUILD_TYPE", "COVERAGE"),
            ("AFL_CONVERT_COMPARISON_TYPE", "ALL"),
        ]))
        .unwrap();
        assert_eq!(config.dict_type, DictType::Normal);
        assert_eq!(config.seed, Some(COVERAGE_SEED));
        assert_eq!(config.map_size(), Ok(AFL_MAX_MAP_SIZE));
        assert!(config.dense_ids());
    }

    #[test]
    fn selections_are_mandatory() {
        assert_matches!(
            Config::from_lookup(lookup(&[("AFL_BUILD_TYPE", "FUZZING")])),
            Err(Fatal::MissingSelection {
                var: "AFL_CONVERT_COMPARISON_TYPE",
                ..
            })
        );
        assert_matches!(
            Config::from_lookup(lookup(&[
                ("AFL_BUILD_TYPE", "FUZZING"),
                ("AFL_CONVERT_COMPARISON_TYPE", "ALL"),
                ("AFL_DICT_TYPE", "SMALL"),
            ])),
            Err(Fatal::InvalidSelection { var: "AFL_DICT_TYPE", value, .. }) if value == "SMALL"
        );
    }

    #[test]
    fn map_size_is_bounded() {
        let mut config = Config::fuzzing(DictType::Normal, ConvertMode::All);
        assert_eq!(config.map_size(), Ok(AFL_COVERAGE_MAP_SIZE));
        config.map_size_kib = Some(u64::from(AFL_MAX_MAP_SIZE_KIB));
        assert_eq!(config.map_size(), Ok(AFL_MAX_MAP_SIZE_KIB * 1024));
        config.map_size_kib = Some(u64::from(AFL_MAX_MAP_SIZE_KIB) + 1);
        assert_matches!(config.map_size(), Err(Fatal::MapSizeOverflow { max: 4095, .. }));
    }
}
