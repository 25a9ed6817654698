//! Logging for the passes.
//!
//! Every pass takes a [`slog::Logger`]. The driver builds one with
//! [`stderr_logger`], which prints records with the labels fuzzing users are
//! used to reading in compiler output; tests hand in a [`slog::Discard`]
//! logger instead.

use std::fmt;
use std::io::{self, Write};

use slog::{Drain, KV, Key, Level, Logger, OwnedKVList, Record, o};

/// Drain writing one line per record to stderr.
pub struct StderrDrain {
    min_level: Level,
}

impl StderrDrain {
    /// With `quiet` set only warnings and errors get through.
    pub fn new(quiet: bool, verbose: bool) -> Self {
        let min_level = match (quiet, verbose) {
            (true, _) => Level::Warning,
            (false, true) => Level::Debug,
            (false, false) => Level::Info,
        };
        Self { min_level }
    }
}

fn label(level: Level) -> &'static str {
    match level {
        Level::Critical | Level::Error => "[-] PROGRAM ABORT : ",
        Level::Warning => "[!] WARNING: ",
        Level::Info => "[+] ",
        Level::Debug | Level::Trace => "[*] ",
    }
}

/// Collects key-value pairs as ` key=value`.
struct LineSerializer<'a>(&'a mut String);

impl slog::Serializer for LineSerializer<'_> {
    fn emit_arguments(&mut self, key: Key, val: &fmt::Arguments) -> slog::Result {
        use fmt::Write as _;
        write!(self.0, " {key}={val}").map_err(|_| slog::Error::Other)
    }
}

impl Drain for StderrDrain {
    type Ok = ();
    type Err = io::Error;

    fn log(&self, record: &Record, values: &OwnedKVList) -> Result<(), io::Error> {
        if !record.level().is_at_least(self.min_level) {
            return Ok(());
        }
        let mut line = format!("{}{}", label(record.level()), record.msg());
        let mut serializer = LineSerializer(&mut line);
        record
            .kv()
            .serialize(record, &mut serializer)
            .and_then(|_| values.serialize(record, &mut serializer))
            .map_err(|e| io::Error::other(e.to_string()))?;
        let mut stderr = io::stderr().lock();
        writeln!(stderr, "{line}")
    }
}

/// The logger used by the driver.
pub fn stderr_logger(quiet: bool, verbose: bool) -> Logger {
    Logger::root(StderrDrain::new(quiet, verbose).fuse(), o!())
}

/// A logger that drops everything.
pub fn discard() -> Logger {
    Logger::root(slog::Discard, o!())
}
