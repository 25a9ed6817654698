//! Compile-time instrumentation for coverage-guided fuzzing.
//!
//! The passes of this crate rewrite a program, held in the SSA form of
//! [`ir`], so that an AFL-style fuzzer gets more out of every execution:
//!
//! - [`harvest`] collects literals (compared strings, copied arrays, struct
//!   fields, call arguments) as dictionary tokens;
//! - [`decompose`] splits wide integer comparisons and string comparison
//!   calls into byte-sized steps, each of which becomes its own edge;
//! - [`instrument`] gives every interesting edge a probe into the shared
//!   coverage map.
//!
//! [`coordinator::Pipeline`] runs them in order and hands back the
//! artifacts (map size, build id, dictionary) the fuzzer reads.
//!
//! ```
//! use bcfuzz::config::{Config, ConvertMode, DictType};
//! use bcfuzz::coordinator::Pipeline;
//! use bcfuzz::ir::builder::FunctionBuilder;
//! use bcfuzz::ir::{Module, Predicate, Type, Value};
//!
//! let mut module = Module::new("demo");
//! let mut b = FunctionBuilder::new("is_magic", vec![Type::I32], Type::I1);
//! let entry = b.create_block("entry");
//! b.switch_to(entry);
//! let cmp = b.icmp(Predicate::Eq, Value::Arg(0), Value::int(32, 0x1234_5678));
//! b.ret(Some(cmp));
//! b.finish_module(&mut module);
//!
//! let config = Config::fuzzing(DictType::Normal, ConvertMode::All);
//! let artifacts = Pipeline::new(&config, bcfuzz::log::discard())
//!     .run(&mut module)
//!     .unwrap();
//! assert_eq!(artifacts.dictionary.entries(DictType::Normal).len(), 1);
//! ```
pub mod config;
pub mod constants;
pub mod coordinator;
pub mod decompose;
pub mod dict;
pub mod error;
pub mod harvest;
pub mod instrument;
pub mod ir;
pub mod log;
