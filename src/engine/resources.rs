/// `resources.rs` — ordered resource lifecycle
///
/// Resources register with a priority, dependency names, and start/stop
/// closures. `start_all` brings them up in ascending priority with
/// dependency checks; any non-optional failure rolls back everything
/// already started, in reverse. `stop_all` tears down in reverse start
/// order and never aborts early: cleanup failures are collected and
/// surfaced as an aggregate.
use crate::error::EngineError;

type LifecycleFn = Box<dyn FnMut() -> Result<(), EngineError> + Send>;

pub struct ResourceEntry {
    pub name: &'static str,
    pub priority: u32,
    pub dependencies: Vec<&'static str>,
    pub optional: bool,
    start: LifecycleFn,
    stop: LifecycleFn,
}

impl ResourceEntry {
    pub fn new(
        name: &'static str,
        priority: u32,
        start: impl FnMut() -> Result<(), EngineError> + Send + 'static,
        stop: impl FnMut() -> Result<(), EngineError> + Send + 'static,
    ) -> Self {
        Self {
            name,
            priority,
            dependencies: Vec::new(),
            optional: false,
            start: Box::new(start),
            stop: Box::new(stop),
        }
    }

    pub fn depends_on(mut self, deps: &[&'static str]) -> Self {
        self.dependencies = deps.to_vec();
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

/// A failed `start_all`: the error plus the resources that had completed
/// successfully before it (already rolled back by the time this returns).
#[derive(Debug)]
pub struct StartFailure {
    pub failed_resource: &'static str,
    pub error: EngineError,
    pub started_before_failure: Vec<&'static str>,
}

#[derive(Default)]
pub struct ResourceManager {
    entries: Vec<ResourceEntry>,
    /// Names in start order; non-empty only while running.
    started: Vec<&'static str>,
}

impl ResourceManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, entry: ResourceEntry) {
        self.entries.push(entry);
    }

    pub fn started_names(&self) -> &[&'static str] {
        &self.started
    }

    /// Start everything in ascending priority. On a non-optional failure,
    /// stop what already started (reverse order) and report the failure.
    pub fn start_all(&mut self) -> Result<(), StartFailure> {
        self.entries.sort_by_key(|e| e.priority);
        self.started.clear();

        for i in 0..self.entries.len() {
            let (name, optional, missing_dep) = {
                let e = &self.entries[i];
                let missing = e
                    .dependencies
                    .iter()
                    .find(|d| !self.started.contains(d))
                    .copied();
                (e.name, e.optional, missing)
            };

            let result = match missing_dep {
                Some(dep) => Err(EngineError::ResourceStartFailure {
                    name: name.to_string(),
                    message: format!("dependency '{dep}' is not running"),
                }),
                None => (self.entries[i].start)(),
            };

            match result {
                Ok(()) => {
                    log::info!("resource started: {name}");
                    self.started.push(name);
                }
                Err(e) if optional => {
                    log::warn!("optional resource {name} failed to start: {e}");
                }
                Err(e) => {
                    log::error!("resource {name} failed to start: {e}; rolling back");
                    let started_before_failure = self.started.clone();
                    self.stop_all();
                    return Err(StartFailure {
                        failed_resource: name,
                        error: e,
                        started_before_failure,
                    });
                }
            }
        }
        Ok(())
    }

    /// Stop in reverse start order. Failures never abort the teardown; they
    /// come back as an aggregate.
    pub fn stop_all(&mut self) -> Vec<(&'static str, EngineError)> {
        let mut failures = Vec::new();
        let order: Vec<&'static str> = self.started.drain(..).rev().collect();
        for name in order {
            let Some(entry) = self.entries.iter_mut().find(|e| e.name == name) else {
                continue;
            };
            match (entry.stop)() {
                Ok(()) => log::info!("resource stopped: {name}"),
                Err(e) => {
                    log::warn!("resource {name} failed to stop: {e}");
                    failures.push((name, e));
                }
            }
        }
        failures
    }
}
