//! Step scheduler.
//!
//! Steps execute strictly in registration order; `depends_on` never
//! reorders anything. Dependencies are validated lazily, when a step is
//! about to run, against what has actually executed or was completed in a
//! previous run — so a step whose dependency was skipped fails with a
//! diagnostic instead of running on missing inputs.

use std::collections::HashSet;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tracing::{debug, info};

use crate::steps::StepContext;

#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn run(&self, ctx: &StepContext) -> Result<()>;
}

pub struct PipelineStep {
    pub name: String,
    pub depends_on: Vec<String>,
    handler: Box<dyn StepHandler>,
}

/// Callbacks around each step, used to persist run state. `on_error` fires
/// before the error propagates.
#[derive(Default)]
pub struct PipelineHooks<'a> {
    pub before: Option<Box<dyn FnMut(&str) + 'a>>,
    pub after: Option<Box<dyn FnMut(&str) + 'a>>,
    pub on_error: Option<Box<dyn FnMut(&str, &anyhow::Error) + 'a>>,
}

#[derive(Default)]
pub struct Pipeline {
    steps: Vec<PipelineStep>,
}

impl Pipeline {
    pub fn register(
        &mut self,
        name: &str,
        depends_on: &[&str],
        handler: Box<dyn StepHandler>,
    ) -> Result<()> {
        if self.steps.iter().any(|step| step.name == name) {
            bail!("step '{name}' registered twice");
        }
        self.steps.push(PipelineStep {
            name: name.to_string(),
            depends_on: depends_on.iter().map(|dep| dep.to_string()).collect(),
            handler,
        });
        Ok(())
    }

    pub fn step_names(&self) -> Vec<String> {
        self.steps.iter().map(|step| step.name.clone()).collect()
    }

    /// Expand a `--only` selection to include transitive dependencies,
    /// preserving registration order. Unknown step names are rejected.
    pub fn dependency_closure(&self, only: &[String]) -> Result<Vec<String>> {
        for name in only {
            if !self.steps.iter().any(|step| step.name == *name) {
                bail!("unknown step '{name}'; available: {}", self.step_names().join(", "));
            }
        }
        let mut selected: HashSet<&str> = only.iter().map(String::as_str).collect();
        // Walk in reverse so a selected step pulls in dependencies that
        // were registered before it, transitively.
        for step in self.steps.iter().rev() {
            if selected.contains(step.name.as_str()) {
                for dep in &step.depends_on {
                    selected.insert(dep);
                }
            }
        }
        Ok(self
            .steps
            .iter()
            .filter(|step| selected.contains(step.name.as_str()))
            .map(|step| step.name.clone())
            .collect())
    }

    /// Run the pipeline. `selection` limits which steps execute (callers
    /// pass a dependency closure); `completed` names steps already done in
    /// a previous run, which are skipped but still satisfy dependencies.
    pub async fn run(
        &self,
        ctx: &StepContext,
        selection: Option<&[String]>,
        completed: &HashSet<String>,
        hooks: &mut PipelineHooks<'_>,
    ) -> Result<()> {
        let mut satisfied: HashSet<&str> = completed.iter().map(String::as_str).collect();

        for step in &self.steps {
            if let Some(selection) = selection {
                if !selection.contains(&step.name) {
                    debug!(step = %step.name, "Step not selected, skipping");
                    continue;
                }
            }
            if completed.contains(&step.name) {
                info!(step = %step.name, "Step already completed, skipping");
                continue;
            }

            let missing: Vec<&str> = step
                .depends_on
                .iter()
                .map(String::as_str)
                .filter(|dep| !satisfied.contains(dep))
                .collect();
            if !missing.is_empty() {
                bail!(
                    "step '{}' cannot run: unsatisfied dependencies [{}]",
                    step.name,
                    missing.join(", ")
                );
            }

            if let Some(before) = hooks.before.as_mut() {
                before(&step.name);
            }
            info!(step = %step.name, "Running step");
            match step.handler.run(ctx).await {
                Ok(()) => {
                    if let Some(after) = hooks.after.as_mut() {
                        after(&step.name);
                    }
                    satisfied.insert(&step.name);
                }
                Err(err) => {
                    if let Some(on_error) = hooks.on_error.as_mut() {
                        on_error(&step.name, &err);
                    }
                    return Err(err.context(format!("step '{}' failed", step.name)));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        fail: AtomicBool,
    }

    #[async_trait]
    impl StepHandler for Recorder {
        async fn run(&self, _ctx: &StepContext) -> Result<()> {
            self.log.lock().unwrap().push(format!("run({})", self.name));
            if self.fail.load(Ordering::SeqCst) {
                bail!("boom");
            }
            Ok(())
        }
    }

    fn recorder(
        name: &'static str,
        log: &Arc<Mutex<Vec<String>>>,
        fail: bool,
    ) -> Box<Recorder> {
        Box::new(Recorder {
            name,
            log: log.clone(),
            fail: AtomicBool::new(fail),
        })
    }

    fn ctx() -> StepContext {
        StepContext::for_tests()
    }

    #[tokio::test]
    async fn steps_run_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = Pipeline::default();
        pipeline.register("b", &[], recorder("b", &log, false)).unwrap();
        pipeline.register("a", &["b"], recorder("a", &log, false)).unwrap();
        pipeline.register("c", &["a"], recorder("c", &log, false)).unwrap();

        pipeline
            .run(&ctx(), None, &HashSet::new(), &mut PipelineHooks::default())
            .await
            .unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["run(b)", "run(a)", "run(c)"]);
    }

    #[tokio::test]
    async fn hook_sequence_around_failure() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = Pipeline::default();
        pipeline.register("a", &[], recorder("a", &log, false)).unwrap();
        pipeline.register("b", &["a"], recorder("b", &log, true)).unwrap();
        pipeline.register("c", &["b"], recorder("c", &log, false)).unwrap();

        let hook_log = log.clone();
        let after_log = log.clone();
        let error_log = log.clone();
        let mut hooks = PipelineHooks {
            before: Some(Box::new(move |step| {
                hook_log.lock().unwrap().push(format!("before({step})"));
            })),
            after: Some(Box::new(move |step| {
                after_log.lock().unwrap().push(format!("after({step})"));
            })),
            on_error: Some(Box::new(move |step, _err| {
                error_log.lock().unwrap().push(format!("error({step})"));
            })),
        };

        let err = pipeline
            .run(&ctx(), None, &HashSet::new(), &mut hooks)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("step 'b' failed"));
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "before(a)", "run(a)", "after(a)",
                "before(b)", "run(b)", "error(b)",
            ]
        );
    }

    #[tokio::test]
    async fn completed_steps_are_skipped_but_satisfy_dependencies() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = Pipeline::default();
        pipeline.register("a", &[], recorder("a", &log, false)).unwrap();
        pipeline.register("b", &["a"], recorder("b", &log, false)).unwrap();

        let completed: HashSet<String> = ["a".to_string()].into();
        pipeline
            .run(&ctx(), None, &completed, &mut PipelineHooks::default())
            .await
            .unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["run(b)"]);
    }

    #[tokio::test]
    async fn unsatisfied_dependency_fails_with_diagnostic() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = Pipeline::default();
        pipeline.register("a", &[], recorder("a", &log, false)).unwrap();
        pipeline.register("b", &["a", "x"], recorder("b", &log, false)).unwrap();

        let err = pipeline
            .run(&ctx(), None, &HashSet::new(), &mut PipelineHooks::default())
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("'b'") && msg.contains("x"), "got: {msg}");
        // The failing step never ran.
        assert_eq!(*log.lock().unwrap(), vec!["run(a)"]);
    }

    #[tokio::test]
    async fn selection_skips_unselected_steps() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = Pipeline::default();
        pipeline.register("a", &[], recorder("a", &log, false)).unwrap();
        pipeline.register("b", &[], recorder("b", &log, false)).unwrap();

        let selection = vec!["b".to_string()];
        pipeline
            .run(&ctx(), Some(&selection), &HashSet::new(), &mut PipelineHooks::default())
            .await
            .unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["run(b)"]);
    }

    #[test]
    fn closure_pulls_in_transitive_dependencies_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = Pipeline::default();
        pipeline.register("fetch", &[], recorder("fetch", &log, false)).unwrap();
        pipeline.register("translate", &["fetch"], recorder("translate", &log, false)).unwrap();
        pipeline.register("format", &["translate"], recorder("format", &log, false)).unwrap();
        pipeline.register("publish", &["format"], recorder("publish", &log, false)).unwrap();

        let closure = pipeline.dependency_closure(&["format".to_string()]).unwrap();
        assert_eq!(closure, vec!["fetch", "translate", "format"]);

        assert!(pipeline.dependency_closure(&["nope".to_string()]).is_err());
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = Pipeline::default();
        pipeline.register("a", &[], recorder("a", &log, false)).unwrap();
        assert!(pipeline.register("a", &[], recorder("a", &log, false)).is_err());
    }
}
