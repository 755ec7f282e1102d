//! Action payloads carried by the wire protocol.
//!
//! The action layer above the pool constructs these; the worker executes
//! them. Collections use ordered containers so every payload has exactly one
//! wire encoding.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Ask the worker to compile a test program.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileAction {
    pub test_name: String,
    /// Per-test properties, exposed to the compile tool's environment.
    pub properties: BTreeMap<String, String>,
    pub args: Vec<String>,
}

impl CompileAction {
    pub fn new(test_name: impl Into<String>) -> Self {
        Self {
            test_name: test_name.into(),
            ..Self::default()
        }
    }
}

/// Ask the worker to run a test program's entry point.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MainAction {
    pub test_name: String,
    pub properties: BTreeMap<String, String>,
    pub add_exports: BTreeSet<String>,
    pub add_opens: BTreeSet<String>,
    pub add_modules: BTreeSet<String>,
    pub class_path: String,
    pub module_path: String,
    pub entry_point: String,
    pub args: Vec<String>,
}

impl MainAction {
    pub fn new(test_name: impl Into<String>, entry_point: impl Into<String>) -> Self {
        Self {
            test_name: test_name.into(),
            entry_point: entry_point.into(),
            ..Self::default()
        }
    }
}
