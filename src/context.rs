//! The explicit per-process core state.
//!
//! Every component receives a [CoreContext] instead of reaching for process
//! globals; tests instantiate a fresh context per case.

use crate::{
    environment::{Environment, EnvironmentManager},
    events::EventBus,
    paths::Paths,
    store::{load_config_set, ConfigStore, LoadedConfig},
    Result,
};

/// One environment's resolved paths, store and event bus.
pub struct CoreContext {
    environment: Environment,
    paths: Paths,
    store: ConfigStore,
    events: EventBus,
}

impl CoreContext {
    /// Opens a context on the given environment, resolving and freezing its
    /// paths and creating the directory skeleton.
    pub fn new(environment: Environment) -> Result<Self> {
        let paths = Paths::resolve(&environment)?;
        paths.ensure_layout()?;
        Ok(Self {
            store: ConfigStore::new(paths.clone()),
            paths,
            environment,
            events: EventBus::new(),
        })
    }

    /// Opens a context on the manager's current environment.
    pub fn open(manager: &EnvironmentManager) -> Result<Self> {
        Self::new(manager.current()?.clone())
    }

    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Snapshot of every configuration document.
    pub fn config(&self) -> Result<LoadedConfig> {
        load_config_set(&self.store)
    }

    /// Switches to another environment: updates the registry pointer,
    /// re-derives paths, discards every cached parse and announces the
    /// switch on the event bus.
    pub fn switch(&mut self, manager: &mut EnvironmentManager, name: &str) -> Result<()> {
        let environment = manager.switch(name, Some(&self.events))?.clone();
        let paths = Paths::resolve(&environment)?;
        paths.ensure_layout()?;
        self.store = ConfigStore::new(paths.clone());
        self.paths = paths;
        self.environment = environment;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use test_log::test;

    use super::CoreContext;
    use crate::{
        environment::{Environment, EnvironmentManager},
        events::CoreEvent,
        test::TestDir,
    };

    #[test]
    fn test_switch_rederives_paths_and_announces() {
        let testdir = TestDir::new();
        let mut manager = EnvironmentManager::init(testdir.path(), false).unwrap();
        manager
            .add(Environment::new(
                "testing",
                testdir.path().join("testing"),
                "test.dev",
                "admin@test.dev",
            ))
            .unwrap();

        let mut ctx = CoreContext::open(&manager).unwrap();
        let rx = ctx.events().subscribe();
        let before = ctx.paths().clone();

        ctx.switch(&mut manager, "testing").unwrap();
        assert_ne!(ctx.paths(), &before);
        assert_eq!(ctx.environment().name, "testing");
        assert!(ctx.paths().config_dir().is_dir());
        assert_eq!(
            rx.recv().unwrap(),
            CoreEvent::EnvironmentSwitched {
                name: "testing".to_string()
            }
        );
    }
}
