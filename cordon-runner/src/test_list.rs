// Copyright (c) The cordon Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The ordered model of registered suites and tests.
//!
//! A [`TestList`] is built once at startup from whatever registration
//! mechanism the embedder uses (an explicit list, a build-time manifest, a
//! process-initialization pass), is read-only for the duration of a run apart
//! from filter-driven disabling, and is dropped at teardown.
//!
//! Ordering is lexicographic by suite name, then by test name, so iteration
//! is deterministic and stable across runs.

use regex::Regex;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::{collections::BTreeMap, fmt};

/// A test body, run in the forked child.
pub type TestFn = fn();

/// A fixture hook, run in the forked child around the test body.
pub type HookFn = fn();

/// Fully-qualified test identifier: suite name plus test name.
///
/// Unique across all registered tests.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct TestId {
    /// The suite (category) this test belongs to.
    pub suite: SmolStr,
    /// The test's own name within the suite.
    pub name: SmolStr,
}

impl TestId {
    /// Creates a new identifier.
    pub fn new(suite: impl Into<SmolStr>, name: impl Into<SmolStr>) -> Self {
        Self {
            suite: suite.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for TestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.suite, self.name)
    }
}

/// The language a test's entry point is written against.
///
/// This is a closed set: it picks the child-side wrapper that drives the
/// test's lifecycle.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum TestLang {
    /// A plain Rust entry point.
    #[default]
    Native,
    /// An entry point that crosses a foreign ABI somewhere inside the body.
    NativeFfi,
}

/// Per-test parameters. All optional; unset fields inherit suite defaults
/// where one exists.
#[derive(Clone, Debug, Default)]
pub struct TestParams {
    /// Wall-clock budget in seconds. Zero means no budget.
    pub timeout_s: Option<f64>,
    /// Terminating with this exit code counts as success.
    pub expected_exit: Option<i32>,
    /// Being killed by this signal counts as success.
    pub expected_signal: Option<i32>,
    /// Disabled tests are consumed by the scheduler but never forked.
    pub disabled: bool,
    /// Skipped tests are reported as skipped rather than silently dropped.
    pub skip: bool,
    /// Fixture hook run before the body.
    pub init: Option<HookFn>,
    /// Fixture hook run after the body, even when the body aborts.
    pub fini: Option<HookFn>,
    /// Human-readable description.
    pub description: Option<String>,
}

/// A registered test. Immutable after registration, apart from the pattern
/// filter flipping `params.disabled`.
#[derive(Clone, Debug)]
pub struct TestCase {
    /// The fully-qualified identifier.
    pub id: TestId,
    /// Picks the child-side entry wrapper.
    pub lang: TestLang,
    /// The parameter bag.
    pub params: TestParams,
    /// The body itself.
    pub body: TestFn,
}

impl TestCase {
    /// Creates a test with default parameters.
    pub fn new(suite: impl Into<SmolStr>, name: impl Into<SmolStr>, body: TestFn) -> Self {
        Self {
            id: TestId::new(suite, name),
            lang: TestLang::Native,
            params: TestParams::default(),
            body,
        }
    }

    /// Replaces the parameter bag.
    pub fn with_params(mut self, params: TestParams) -> Self {
        self.params = params;
        self
    }

    /// Replaces the language tag.
    pub fn with_lang(mut self, lang: TestLang) -> Self {
        self.lang = lang;
        self
    }
}

/// Per-suite parameters.
#[derive(Clone, Debug, Default)]
pub struct SuiteParams {
    /// Default wall-clock budget inherited by tests that declare none.
    pub timeout_s: Option<f64>,
    /// A disabled suite disables all of its tests.
    pub disabled: bool,
    /// Hook run in the child before the test's own init fixture.
    pub setup: Option<HookFn>,
    /// Hook run in the child after the test's own fini fixture.
    pub teardown: Option<HookFn>,
}

/// A registered suite: a named bucket of tests sharing defaults and hooks.
#[derive(Clone, Debug)]
pub struct Suite {
    /// The suite name. Unique across all registered suites.
    pub name: SmolStr,
    /// The parameter bag.
    pub params: SuiteParams,
}

impl Suite {
    /// Creates a suite with default parameters.
    pub fn new(name: impl Into<SmolStr>) -> Self {
        Self {
            name: name.into(),
            params: SuiteParams::default(),
        }
    }

    /// Replaces the parameter bag.
    pub fn with_params(mut self, params: SuiteParams) -> Self {
        self.params = params;
        self
    }
}

#[derive(Clone, Debug)]
struct SuiteEntry {
    suite: Suite,
    tests: BTreeMap<SmolStr, TestCase>,
}

/// The ordered set of all registered tests, bucketed by suite.
#[derive(Clone, Debug, Default)]
pub struct TestList {
    suites: BTreeMap<SmolStr, SuiteEntry>,
    test_count: usize,
}

impl TestList {
    /// Builds a list from iterables of suite and test descriptors.
    ///
    /// Suites are registered first so that tests land in buckets that carry
    /// the declared suite parameters. Entries with an empty suite or test
    /// name are silently dropped, as are duplicate identifiers (the first
    /// registration wins).
    pub fn build(
        suites: impl IntoIterator<Item = Suite>,
        tests: impl IntoIterator<Item = TestCase>,
    ) -> Self {
        let mut list = Self::default();
        for suite in suites {
            list.register_suite(suite);
        }
        for test in tests {
            list.register_test(test);
        }
        list
    }

    /// Registers a suite, creating its bucket. First registration wins.
    pub fn register_suite(&mut self, suite: Suite) {
        if suite.name.is_empty() {
            return;
        }
        self.suites
            .entry(suite.name.clone())
            .or_insert_with(|| SuiteEntry {
                suite,
                tests: BTreeMap::new(),
            });
    }

    /// Registers a test, creating its suite bucket on first use.
    pub fn register_test(&mut self, test: TestCase) {
        if test.id.suite.is_empty() || test.id.name.is_empty() {
            return;
        }
        let entry = self
            .suites
            .entry(test.id.suite.clone())
            .or_insert_with(|| SuiteEntry {
                suite: Suite::new(test.id.suite.clone()),
                tests: BTreeMap::new(),
            });
        let name = test.id.name.clone();
        if !entry.tests.contains_key(&name) {
            entry.tests.insert(name, test);
            self.test_count += 1;
        }
    }

    /// The number of registered tests.
    pub fn test_count(&self) -> usize {
        self.test_count
    }

    /// The number of registered suites.
    pub fn suite_count(&self) -> usize {
        self.suites.len()
    }

    /// Looks up a suite by name.
    pub fn suite(&self, name: &str) -> Option<&Suite> {
        self.suites.get(name).map(|entry| &entry.suite)
    }

    /// Iterates over all (suite, test) pairs in lexicographic order.
    pub fn iter(&self) -> impl Iterator<Item = (&Suite, &TestCase)> + '_ {
        self.suites
            .values()
            .flat_map(|entry| entry.tests.values().map(move |test| (&entry.suite, test)))
    }

    /// Disables every test whose identifier does not match `pattern`.
    ///
    /// Disabled suites are left untouched; their tests never run anyway.
    pub fn disable_unmatched(&mut self, pattern: &Regex) {
        for entry in self.suites.values_mut() {
            if entry.suite.params.disabled {
                continue;
            }
            for test in entry.tests.values_mut() {
                if !pattern.is_match(&test.id.to_string()) {
                    test.params.disabled = true;
                }
            }
        }
    }
}
