//! Pluggable capability modules and the registry that names them.
//!
//! A module is driven through a fixed lifecycle by the worker:
//! `load` → `build_loops` → `sort_loops` → `execute`. Everything a module needs
//! at runtime (the request, the target, a dialer, the event log) arrives through
//! its [`ModuleContext`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::ScanRequest;
use crate::error::{ScanError, StoreError};
use crate::event::{NewEvent, NewTempEvent, ScanId, WriteOutcome};
use crate::network::dialer::Dialer;
use crate::store::EventStore;

/// Selection keyword that expands to every registered module.
pub const ALL_MODULES: &str = "all";

#[async_trait]
pub trait ScanModule: Send {
    /// Reads whatever the module needs before planning (wordlists, earlier signals).
    async fn load(&mut self, _ctx: &ModuleContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Plans the request loops this module will run against the target.
    fn build_loops(&mut self, ctx: &ModuleContext) -> anyhow::Result<()>;

    fn sort_loops(&mut self) {}

    async fn execute(&mut self, ctx: &ModuleContext) -> anyhow::Result<()>;
}

/// Per-task view handed to a module. Cheap to build: the request and the store
/// are shared, not copied.
#[derive(Clone)]
pub struct ModuleContext {
    pub target: String,
    pub module_name: String,
    pub scan_id: ScanId,
    pub request: Arc<ScanRequest>,
    pub dialer: Dialer,
    pub store: Arc<dyn EventStore>,
    pub process_number: usize,
    pub task_number: usize,
    pub total_tasks: usize,
}

impl fmt::Debug for ModuleContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleContext")
            .field("target", &self.target)
            .field("module_name", &self.module_name)
            .field("scan_id", &self.scan_id)
            .field("process_number", &self.process_number)
            .field("task_number", &self.task_number)
            .field("total_tasks", &self.total_tasks)
            .finish_non_exhaustive()
    }
}

impl ModuleContext {
    pub async fn emit(&self, port: Option<u16>, event: Value) -> Result<WriteOutcome, StoreError> {
        let record = NewEvent::new(&self.target, &self.module_name, &self.scan_id, port, event);
        self.store.append(record).await
    }

    pub async fn emit_temp(
        &self,
        event_name: &str,
        data: Value,
    ) -> Result<WriteOutcome, StoreError> {
        let record = NewTempEvent::new(
            &self.target,
            &self.module_name,
            &self.scan_id,
            event_name,
            data,
        );
        self.store.append_temp(record).await
    }

    /// Reads a signal left by `module_name` for this target in the current scan.
    pub async fn find_temp(&self, module_name: &str, event_name: &str) -> Option<Value> {
        self.store
            .query_temp(&self.target, module_name, &self.scan_id, event_name)
            .await
    }

    /// Upper bound on in-flight requests a module may keep against this host.
    pub fn thread_per_host(&self) -> usize {
        self.request.thread_per_host.max(1)
    }

    pub fn timeout(&self) -> Duration {
        self.request.timeout()
    }
}

type ModuleFactory = Arc<dyn Fn() -> Box<dyn ScanModule> + Send + Sync>;

/// Name → factory map populated once at startup.
#[derive(Clone, Default)]
pub struct ModuleRegistry {
    factories: BTreeMap<String, ModuleFactory>,
}

impl fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.factories.keys()).finish()
    }
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Box<dyn ScanModule> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
        self
    }

    pub fn instantiate(&self, name: &str) -> Option<Box<dyn ScanModule>> {
        self.factories.get(name).map(|factory| factory())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Validates a selection and applies exclusions.
    ///
    /// `all` expands to every registered name. Unknown names in `selected` are an
    /// error; unknown names in `excluded` are ignored. Order follows first
    /// appearance and duplicates are removed.
    pub fn resolve_selection(
        &self,
        selected: &[String],
        excluded: &[String],
    ) -> Result<Vec<String>, ScanError> {
        let mut resolved: Vec<String> = Vec::new();

        for name in selected.iter().map(|s| s.trim()).filter(|s| !s.is_empty()) {
            let expanded: Vec<String> = if name == ALL_MODULES {
                self.names().map(str::to_string).collect()
            } else if self.contains(name) {
                vec![name.to_string()]
            } else {
                return Err(ScanError::UnknownModule(name.to_string()));
            };

            for module in expanded {
                if !resolved.contains(&module) {
                    resolved.push(module);
                }
            }
        }

        resolved.retain(|module| !excluded.iter().any(|ex| ex.trim() == module));
        Ok(resolved)
    }
}

// ╔════════════════════════════════════════════╗
// ║ ████████╗███████╗███████╗████████╗███████╗ ║
// ║ ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝██╔════╝ ║
// ║    ██║   █████╗  ███████╗   ██║   ███████╗ ║
// ║    ██║   ██╔══╝  ╚════██║   ██║   ╚════██║ ║
// ║    ██║   ███████╗███████║   ██║   ███████║ ║
// ║    ╚═╝   ╚══════╝╚══════╝   ╚═╝   ╚══════╝ ║
// ╚════════════════════════════════════════════╝

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl ScanModule for Noop {
        fn build_loops(&mut self, _ctx: &ModuleContext) -> anyhow::Result<()> {
            Ok(())
        }

        async fn execute(&mut self, _ctx: &ModuleContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn registry() -> ModuleRegistry {
        ModuleRegistry::new()
            .register("port_scan", || Box::new(Noop))
            .register("icmp_scan", || Box::new(Noop))
            .register("subdomain_scan", || Box::new(Noop))
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn instantiates_registered_modules_only() {
        let reg = registry();
        assert_eq!(reg.len(), 3);
        assert!(reg.instantiate("port_scan").is_some());
        assert!(reg.instantiate("nope").is_none());
    }

    #[test]
    fn all_expands_to_every_module() {
        let resolved = registry()
            .resolve_selection(&names(&["all"]), &[])
            .unwrap();
        assert_eq!(resolved, names(&["icmp_scan", "port_scan", "subdomain_scan"]));
    }

    #[test]
    fn exclusions_are_applied_after_expansion() {
        let resolved = registry()
            .resolve_selection(&names(&["all", "port_scan"]), &names(&["icmp_scan", "ghost"]))
            .unwrap();
        assert_eq!(resolved, names(&["port_scan", "subdomain_scan"]));
    }

    #[test]
    fn unknown_selection_is_rejected() {
        let err = registry()
            .resolve_selection(&names(&["port_scan", "bogus"]), &[])
            .unwrap_err();
        assert!(matches!(err, ScanError::UnknownModule(name) if name == "bogus"));
    }
}
