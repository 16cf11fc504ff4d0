// Copyright (c) The dutest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The per-process registry of tests and fixtures.
//!
//! Registration is explicit: bundle authors build a [`Registry`] value and
//! hand it to the bundle entry point. Nothing here is global, so tests of
//! the harness itself can build scratch registries freely.

use crate::{
    errors::RegistrationError,
    fixture::Fixture,
    precondition::SharedPrecondition,
    state::State,
    Context,
};
use std::{collections::BTreeMap, sync::Arc, time::Duration};

/// Default total timeout for a test that does not declare one.
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(120);

/// The boxed test function.
pub type TestFn = Arc<dyn Fn(&Context, &State) + Send + Sync>;

/// An immutable test descriptor, created at registration.
#[derive(Clone)]
pub struct Test {
    name: String,
    func: TestFn,
    timeout: Duration,
    exit_timeout: Duration,
    data: Vec<String>,
    software_deps: Vec<String>,
    service_deps: Vec<String>,
    fixture: String,
    precondition: Option<SharedPrecondition>,
    attrs: Vec<String>,
}

impl Test {
    /// Creates a test with the default timeout and no declarations.
    pub fn new(name: impl Into<String>, func: impl Fn(&Context, &State) + Send + Sync + 'static) -> Self {
        Self {
            name: name.into(),
            func: Arc::new(func),
            timeout: DEFAULT_TEST_TIMEOUT,
            exit_timeout: Duration::ZERO,
            data: Vec::new(),
            software_deps: Vec::new(),
            service_deps: Vec::new(),
            fixture: String::new(),
            precondition: None,
            attrs: Vec::new(),
        }
    }

    /// Declares the test's total timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Declares how long the test function may take to return after its
    /// context has expired.
    pub fn with_exit_timeout(mut self, exit_timeout: Duration) -> Self {
        self.exit_timeout = exit_timeout;
        self
    }

    /// Declares external data files.
    pub fn with_data(mut self, data: impl IntoIterator<Item = String>) -> Self {
        self.data = data.into_iter().collect();
        self
    }

    /// Declares software-feature dependencies.
    pub fn with_software_deps(mut self, deps: impl IntoIterator<Item = String>) -> Self {
        self.software_deps = deps.into_iter().collect();
        self
    }

    /// Declares service dependencies.
    pub fn with_service_deps(mut self, deps: impl IntoIterator<Item = String>) -> Self {
        self.service_deps = deps.into_iter().collect();
        self
    }

    /// Declares the test's parent fixture.
    pub fn with_fixture(mut self, fixture: impl Into<String>) -> Self {
        self.fixture = fixture.into();
        self
    }

    /// Attaches a legacy precondition.
    pub fn with_precondition(mut self, precondition: SharedPrecondition) -> Self {
        self.precondition = Some(precondition);
        self
    }

    /// Declares selection attributes.
    pub fn with_attrs(mut self, attrs: impl IntoIterator<Item = String>) -> Self {
        self.attrs = attrs.into_iter().collect();
        self
    }

    /// The test's dotted, package-qualified name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The test function.
    pub fn func(&self) -> &TestFn {
        &self.func
    }

    /// The declared total timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// The declared exit-grace timeout; zero means the default applies.
    pub fn exit_timeout(&self) -> Duration {
        self.exit_timeout
    }

    /// Declared data files.
    pub fn data(&self) -> &[String] {
        &self.data
    }

    /// Declared software-feature dependencies.
    pub fn software_deps(&self) -> &[String] {
        &self.software_deps
    }

    /// Declared service dependencies.
    pub fn service_deps(&self) -> &[String] {
        &self.service_deps
    }

    /// The parent fixture name; empty for none.
    pub fn fixture(&self) -> &str {
        &self.fixture
    }

    /// The attached precondition, if any.
    pub fn precondition(&self) -> Option<&SharedPrecondition> {
        self.precondition.as_ref()
    }

    /// Selection attributes.
    pub fn attrs(&self) -> &[String] {
        &self.attrs
    }
}

impl std::fmt::Debug for Test {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Test")
            .field("name", &self.name)
            .field("fixture", &self.fixture)
            .finish_non_exhaustive()
    }
}

/// Holds every test and fixture a bundle hosts.
#[derive(Default)]
pub struct Registry {
    tests: BTreeMap<String, Arc<Test>>,
    fixtures: BTreeMap<String, Arc<Fixture>>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a test.
    pub fn add_test(&mut self, test: Test) -> Result<(), RegistrationError> {
        if !valid_test_name(&test.name) {
            return Err(RegistrationError::BadTestName {
                name: test.name.clone(),
            });
        }
        if !test.fixture.is_empty() && test.precondition.is_some() {
            return Err(RegistrationError::FixtureAndPrecondition {
                name: test.name.clone(),
            });
        }
        if self.tests.contains_key(&test.name) {
            return Err(RegistrationError::Duplicate {
                kind: "test",
                name: test.name.clone(),
            });
        }
        self.tests.insert(test.name.clone(), Arc::new(test));
        Ok(())
    }

    /// Registers a fixture.
    pub fn add_fixture(&mut self, fixture: Fixture) -> Result<(), RegistrationError> {
        if fixture.name().is_empty() {
            return Err(RegistrationError::EmptyFixtureName);
        }
        if self.fixtures.contains_key(fixture.name()) {
            return Err(RegistrationError::Duplicate {
                kind: "fixture",
                name: fixture.name().to_owned(),
            });
        }
        self.fixtures
            .insert(fixture.name().to_owned(), Arc::new(fixture));
        Ok(())
    }

    /// All registered tests, ordered by name.
    pub fn tests(&self) -> impl Iterator<Item = &Arc<Test>> {
        self.tests.values()
    }

    /// Looks up a test by name.
    pub fn test(&self, name: &str) -> Option<&Arc<Test>> {
        self.tests.get(name)
    }

    /// Looks up a fixture by name.
    pub fn fixture(&self, name: &str) -> Option<&Arc<Fixture>> {
        self.fixtures.get(name)
    }

    /// Computes the ordered root-to-leaf fixture chain for `leaf`, stopping
    /// below `root` (the batch's start fixture; empty for the implicit
    /// root). A leaf equal to `root` yields an empty chain.
    pub fn fixture_chain(
        &self,
        leaf: &str,
        root: &str,
    ) -> Result<Vec<Arc<Fixture>>, RegistrationError> {
        if leaf.is_empty() {
            return Ok(Vec::new());
        }
        let mut chain = Vec::new();
        let mut current = leaf;
        while !current.is_empty() && current != root {
            let fixture =
                self.fixtures
                    .get(current)
                    .ok_or_else(|| RegistrationError::UnknownFixture {
                        name: chain
                            .last()
                            .map_or_else(|| leaf.to_owned(), |f: &Arc<Fixture>| f.name().to_owned()),
                        parent: current.to_owned(),
                    })?;
            chain.push(Arc::clone(fixture));
            if chain.len() > self.fixtures.len() {
                return Err(RegistrationError::BadFixtureChain {
                    name: leaf.to_owned(),
                });
            }
            current = fixture.parent();
        }
        if current != root && current.is_empty() {
            // Walked off the top without meeting the requested root.
            return Err(RegistrationError::BadFixtureChain {
                name: leaf.to_owned(),
            });
        }
        chain.reverse();
        Ok(chain)
    }
}

fn valid_test_name(name: &str) -> bool {
    let components: Vec<&str> = name.split('.').collect();
    components.len() >= 2
        && components.iter().all(|component| {
            !component.is_empty()
                && component
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::FixtureImpl;

    struct Noop;
    impl FixtureImpl for Noop {}

    fn test(name: &str) -> Test {
        Test::new(name, |_ctx, _s| {})
    }

    #[test]
    fn test_name_validation() {
        let mut registry = Registry::new();
        registry.add_test(test("pkg.Good")).unwrap();
        for bad in ["NoPackage", "pkg.", ".Name", "pkg.has space", ""] {
            assert_eq!(
                registry.add_test(test(bad)),
                Err(RegistrationError::BadTestName {
                    name: bad.to_owned()
                })
            );
        }
    }

    #[test]
    fn duplicate_test_rejected() {
        let mut registry = Registry::new();
        registry.add_test(test("pkg.Dup")).unwrap();
        assert_eq!(
            registry.add_test(test("pkg.Dup")),
            Err(RegistrationError::Duplicate {
                kind: "test",
                name: "pkg.Dup".to_owned()
            })
        );
    }

    #[test]
    fn duplicate_fixture_rejected() {
        let mut registry = Registry::new();
        registry.add_fixture(Fixture::new("f", Noop)).unwrap();
        assert_eq!(
            registry.add_fixture(Fixture::new("f", Noop)),
            Err(RegistrationError::Duplicate {
                kind: "fixture",
                name: "f".to_owned()
            })
        );
        assert_eq!(
            registry.add_fixture(Fixture::new("", Noop)),
            Err(RegistrationError::EmptyFixtureName)
        );
    }

    #[test]
    fn fixture_chain_walks_to_root() {
        let mut registry = Registry::new();
        registry.add_fixture(Fixture::new("root", Noop)).unwrap();
        registry
            .add_fixture(Fixture::new("mid", Noop).with_parent("root"))
            .unwrap();
        registry
            .add_fixture(Fixture::new("leaf", Noop).with_parent("mid"))
            .unwrap();

        let chain = registry.fixture_chain("leaf", "").unwrap();
        let names: Vec<_> = chain.iter().map(|f| f.name()).collect();
        assert_eq!(names, ["root", "mid", "leaf"]);

        // With a start fixture, the chain stops below it.
        let chain = registry.fixture_chain("leaf", "root").unwrap();
        let names: Vec<_> = chain.iter().map(|f| f.name()).collect();
        assert_eq!(names, ["mid", "leaf"]);

        assert!(registry.fixture_chain("root", "root").unwrap().is_empty());
    }

    #[test]
    fn unknown_fixture_in_chain() {
        let mut registry = Registry::new();
        registry
            .add_fixture(Fixture::new("child", Noop).with_parent("ghost"))
            .unwrap();
        assert!(matches!(
            registry.fixture_chain("child", ""),
            Err(RegistrationError::UnknownFixture { .. })
        ));
    }

    #[test]
    fn chain_not_reaching_start_fixture_is_an_error() {
        let mut registry = Registry::new();
        registry.add_fixture(Fixture::new("stray", Noop)).unwrap();
        assert!(matches!(
            registry.fixture_chain("stray", "remoteRoot"),
            Err(RegistrationError::BadFixtureChain { .. })
        ));
    }
}
