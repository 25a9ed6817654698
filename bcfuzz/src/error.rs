use std::path::PathBuf;

use thiserror::Error;

use crate::ir::BlockId;

/// Conditions that abandon the whole compilation unit.
///
/// Soft conditions (rejected tokens, two constant operands, nothing to
/// instrument) are logged as warnings and never surface here.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Fatal {
    #[error("{var} is not set. Must be {{{expected}}}")]
    MissingSelection {
        var: &'static str,
        expected: &'static str,
    },

    #[error("Invalid {var}={value}. Must be {{{expected}}}")]
    InvalidSelection {
        var: &'static str,
        value: String,
        expected: &'static str,
    },

    #[error("Invalid AFL_MAP_SIZE={0}, expected a size in KiB")]
    InvalidMapSize(String),

    #[error("Overflow map size {requested} KiB. Max value accepted is {max}")]
    MapSizeOverflow { requested: u64, max: u32 },

    #[error("{0} not defined")]
    MissingOutputPath(&'static str),

    #[error("File {} already exists", .0.display())]
    OutputExists(PathBuf),

    #[error("Unsupported integer width {width} in function {function}")]
    UnsupportedWidth { function: String, width: u32 },

    #[error("Found switch instruction in {function}/{block:?}. Lower switches before instrumenting")]
    SwitchPresent { function: String, block: BlockId },

    #[error("Landing pad {block:?} in {function} has {predecessors} predecessors")]
    SharedLandingPad {
        function: String,
        block: BlockId,
        predecessors: usize,
    },

    #[error("Unique successor {name} in {function} already instrumented")]
    AlreadyInstrumented { function: String, name: String },

    #[error("More than {limit} dictionary entries attached to one instruction in {function}")]
    FanOutExceeded { function: String, limit: usize },

    #[error("Invalid IR in {function}: {reason}")]
    Verification { function: String, reason: String },
}
