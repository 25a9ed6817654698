//! Pass ordering and build artifacts.
//!
//! [`Pipeline::run`] takes one module through every pass in a fixed order,
//! checking the IR after each of them, and returns the [`BuildArtifacts`] the
//! fuzzer needs next to the compiled program. Writing them is a separate step
//! ([`BuildArtifacts::write`]) so that the passes never touch the file system.

use std::env;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use slog::{Logger, debug, info};

use crate::config::{BuildType, Config, ConvertMode, CounterMode, DictType};
use crate::decompose::{
    CompareStats, StrcmpStats, decompose_compares, decompose_string_compares, lower_selects,
};
use crate::dict::Dictionary;
use crate::error::Fatal;
use crate::harvest::{HarvestStats, harvest};
use crate::instrument::{SourceMap, instrument_edges};
use crate::ir::Module;
use crate::ir::verify::verify;

/// What each pass did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    pub harvest: HarvestStats,
    pub selects: usize,
    pub compares: CompareStats,
    pub strings: StrcmpStats,
    pub probes: u32,
}

#[derive(Debug)]
pub struct BuildArtifacts {
    /// Size of the coverage map the runtime must provide. Dense builds
    /// (coverage, `AFL_NO_COLLISION`) need one byte per identifier, so this
    /// is `bb_count` there, not the configured or maximum size.
    pub map_size: u32,
    pub bb_count: u32,
    pub build_id: u64,
    pub build_type: BuildType,
    pub dict_type: DictType,
    pub counter: CounterMode,
    pub dictionary: Dictionary,
    pub source_map: Option<SourceMap>,
    pub stats: Stats,
}

pub struct Pipeline<'a> {
    config: &'a Config,
    log: Logger,
}

impl<'a> Pipeline<'a> {
    pub fn new(config: &'a Config, log: Logger) -> Self {
        Self { config, log }
    }

    /// Harvests literals, decomposes comparisons and instruments edges.
    ///
    /// Configuration errors surface before the module is touched.
    pub fn run(&self, module: &mut Module) -> Result<BuildArtifacts> {
        let config = self.config;
        let log = &self.log;
        config.map_size()?;
        check(module, "input")?;

        let harvest = harvest(module, config, log).context("Literal harvesting failed")?;
        check(module, "literal harvesting")?;

        let selects = match config.convert {
            ConvertMode::None => 0,
            ConvertMode::All | ConvertMode::NotDict => {
                let count = lower_selects(module, log);
                check(module, "select lowering")?;
                count
            }
        };

        let compares =
            decompose_compares(module, config, log).context("Integer comparison splitting failed")?;
        check(module, "integer comparison splitting")?;

        let strings = decompose_string_compares(module, config, log)
            .context("String comparison splitting failed")?;
        check(module, "string comparison splitting")?;

        let report = instrument_edges(module, config, log).context("Edge instrumentation failed")?;
        check(module, "edge instrumentation")?;

        debug!(log, "Pipeline done";
            "module" => &module.name,
            "dictionary" => report.dictionary.len(),
            "build_id" => format!("{:016x}", report.build_id),
        );

        Ok(BuildArtifacts {
            map_size: report.area_size,
            bb_count: report.bb_count,
            build_id: report.build_id,
            build_type: config.build_type,
            dict_type: config.dict_type,
            counter: config.counter,
            dictionary: report.dictionary,
            source_map: report.source_map,
            stats: Stats {
                harvest,
                selects,
                compares,
                strings,
                probes: report.probes,
            },
        })
    }
}

fn check(module: &Module, stage: &str) -> Result<()> {
    verify(module).with_context(|| format!("Invalid IR after {stage}"))
}

/// Where the artifacts go.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputPaths {
    pub map_size: PathBuf,
    pub bb_count: PathBuf,
    pub build_id: PathBuf,
    pub dictionary: PathBuf,
    /// Coverage builds only.
    pub source_map: Option<PathBuf>,
}

impl OutputPaths {
    pub fn from_env(build_type: BuildType) -> Result<Self, Fatal> {
        Self::from_lookup(build_type, |name| env::var_os(name).map(PathBuf::from))
    }

    pub fn from_lookup(
        build_type: BuildType,
        lookup: impl Fn(&str) -> Option<PathBuf>,
    ) -> Result<Self, Fatal> {
        let required = |var: &'static str| lookup(var).ok_or(Fatal::MissingOutputPath(var));
        Ok(Self {
            map_size: required("AFL_BCCLANG_MAP_FILE")?,
            bb_count: required("AFL_BCCLANG_BBMAP_FILE")?,
            build_id: required("AFL_BCCLANG_BUILD_ID")?,
            dictionary: required("AFL_BCCLANG_DICT_FILE")?,
            source_map: match build_type {
                BuildType::Coverage => Some(required("AFL_BCCLANG_COVERAGE_TO_SRC_FILE")?),
                BuildType::Fuzzing => None,
            },
        })
    }

    /// Conventional names inside one directory.
    pub fn in_dir(dir: &Path, build_type: BuildType) -> Self {
        Self {
            map_size: dir.join("afl.mapsize"),
            bb_count: dir.join("afl.bbsize"),
            build_id: dir.join("afl.buildid"),
            dictionary: dir.join("afl.dict"),
            source_map: (build_type == BuildType::Coverage).then(|| dir.join("afl.cov2src")),
        }
    }
}

impl BuildArtifacts {
    /// The dictionary file, with its header.
    pub fn dictionary_text(&self) -> String {
        self.dictionary
            .render(self.dict_type, self.counter, self.build_id)
    }

    /// Writes every artifact. No file is written if any of them exists.
    ///
    /// Fuzzing builds write the dictionary when it has entries. Coverage
    /// builds write the source mapping instead and remove a stale dictionary.
    pub fn write(&self, paths: &OutputPaths, log: &Logger) -> Result<()> {
        let mut files: Vec<(&Path, Vec<u8>)> = vec![
            (paths.map_size.as_path(), self.map_size.to_le_bytes().to_vec()),
            (paths.bb_count.as_path(), self.bb_count.to_le_bytes().to_vec()),
            (paths.build_id.as_path(), self.build_id.to_le_bytes().to_vec()),
        ];
        match self.build_type {
            BuildType::Fuzzing => {
                if !self.dictionary.is_empty() {
                    files.push((paths.dictionary.as_path(), self.dictionary_text().into_bytes()));
                }
            }
            BuildType::Coverage => {
                let source_map = self.source_map.as_ref().filter(|map| !map.is_empty());
                if let (Some(path), Some(map)) = (&paths.source_map, source_map) {
                    files.push((path.as_path(), map.render().into_bytes()));
                }
            }
        }

        if let Some((path, _)) = files.iter().find(|(path, _)| path.exists()) {
            return Err(Fatal::OutputExists(path.to_path_buf()).into());
        }

        if self.build_type == BuildType::Coverage {
            match fs::remove_file(&paths.dictionary) {
                Ok(()) => debug!(log, "Removed stale dictionary {}", paths.dictionary.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("Cannot delete {}", paths.dictionary.display()));
                }
            }
        }

        for (path, contents) in &files {
            write_new(path, contents)?;
        }
        if self.build_type == BuildType::Fuzzing && !self.dictionary.is_empty() {
            info!(log, "Created {} entries in dictionary",
                self.dictionary.entries(self.dict_type).len());
        }
        Ok(())
    }
}

fn write_new(path: &Path, contents: &[u8]) -> Result<()> {
    let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            return Err(Fatal::OutputExists(path.to_path_buf()).into());
        }
        Err(e) => return Err(e).with_context(|| format!("Cannot create {}", path.display())),
    };
    file.write_all(contents)
        .with_context(|| format!("Cannot write {}", path.display()))
}
