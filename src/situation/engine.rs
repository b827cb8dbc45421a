//! Runs a registry of situations into a [`Report`].
//!
//! Situations are launched in topological order once every dependency has
//! finished. A semaphore bounds how many run at once. A situation whose
//! dependency did not pass is skipped. Each diagnostic runs in its own task
//! so a panic is reported as [`Verdict::Crashed`] instead of ending the run.

use std::any::Any;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use super::report::{Anomaly, Report, SituationResult, Verdict};
use super::{SituationContext, SituationRegistry};
use crate::error::Result;

pub struct Engine {
    registry: SituationRegistry,
    context: Arc<SituationContext>,
}

impl Engine {
    pub fn new(registry: SituationRegistry, context: SituationContext) -> Self {
        Self {
            registry,
            context: Arc::new(context),
        }
    }

    pub fn registry(&self) -> &SituationRegistry {
        &self.registry
    }

    pub fn context(&self) -> &SituationContext {
        &self.context
    }

    /// Run every situation. Fails only if the registry cannot be ordered.
    pub async fn run(&self) -> Result<Report> {
        let order = self.registry.order_indices()?;
        let n = self.registry.len();
        let deps = (0..n)
            .map(|i| self.registry.dependency_indices(i))
            .collect::<Result<Vec<_>>>()?;

        let limit = self.context.config().max_concurrent_situations.max(1);
        let semaphore = Arc::new(Semaphore::new(limit));
        let mut results: Vec<Option<SituationResult>> = vec![None; n];
        let mut launched = vec![false; n];
        let mut tasks = JoinSet::new();

        tracing::info!(situations = n, concurrency = limit, "run started");

        loop {
            for &i in &order {
                if launched[i] || !deps[i].iter().all(|&d| results[d].is_some()) {
                    continue;
                }
                let blocker = deps[i]
                    .iter()
                    .find(|&&d| !results[d].as_ref().is_some_and(|r| r.verdict.is_pass()));
                if let Some(&blocker) = blocker {
                    launched[i] = true;
                    results[i] = Some(self.skipped(i, blocker));
                    continue;
                }
                let Ok(permit) = Arc::clone(&semaphore).try_acquire_owned() else {
                    break;
                };
                launched[i] = true;
                let situation = Arc::clone(self.registry.at(i));
                let context = Arc::clone(&self.context);
                tasks.spawn(async move {
                    let _permit = permit;
                    let id = situation.id();
                    let name = situation.name();
                    let started = Instant::now();
                    tracing::info!(situation = id, "running");

                    let run = tokio::spawn(async move { situation.diagnostic(&context).await });
                    let (verdict, detail) = match run.await {
                        Ok(outcome) if outcome.is_failure() => (Verdict::Failed, outcome.detail().to_string()),
                        Ok(outcome) => (Verdict::Passed, outcome.detail().to_string()),
                        Err(e) if e.is_panic() => (Verdict::Crashed, panic_message(e.into_panic())),
                        Err(_) => (Verdict::Crashed, "diagnostic cancelled".to_string()),
                    };
                    let elapsed_ms = started.elapsed().as_millis() as u64;
                    tracing::info!(situation = id, ?verdict, elapsed_ms, "finished");

                    let result = SituationResult {
                        id: id.to_string(),
                        name: name.to_string(),
                        verdict,
                        detail,
                        elapsed_ms,
                    };
                    (i, result)
                });
            }

            match tasks.join_next().await {
                Some(Ok((i, result))) => results[i] = Some(result),
                Some(Err(e)) => tracing::error!("Situation task error: {}", e),
                None => break,
            }
        }

        let anomalies = self
            .context
            .drain_anomalies()
            .await
            .into_iter()
            .map(|(role, failure)| Anomaly {
                role,
                detail: failure.to_string(),
            })
            .collect();
        self.context.close_all().await;

        let results = order
            .into_iter()
            .map(|i| match results[i].take() {
                Some(result) => result,
                None if launched[i] => self.result(i, Verdict::Crashed, "situation task lost"),
                None => {
                    let blocker = deps[i].first().copied().unwrap_or(i);
                    self.skipped(i, blocker)
                }
            })
            .collect();
        Ok(Report { results, anomalies })
    }

    fn result(&self, i: usize, verdict: Verdict, detail: &str) -> SituationResult {
        let situation = self.registry.at(i);
        SituationResult {
            id: situation.id().to_string(),
            name: situation.name().to_string(),
            verdict,
            detail: detail.to_string(),
            elapsed_ms: 0,
        }
    }

    fn skipped(&self, i: usize, blocker: usize) -> SituationResult {
        let blocked_by = self.registry.at(blocker).id().to_string();
        tracing::info!(situation = self.registry.at(i).id(), %blocked_by, "skipped");
        self.result(i, Verdict::Skipped { blocked_by }, "")
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("diagnostic panicked: {}", message)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::*;
    use crate::auth::JsonHandshake;
    use crate::config::ProbeConfig;
    use crate::error::ProbeError;
    use crate::situation::{Outcome, Situation};
    use crate::transport::MemoryConnector;
    use crate::BoxFuture;

    #[derive(Clone, Copy)]
    enum Behaviour {
        Pass,
        Fail,
        Panic,
    }

    struct Scripted {
        id: &'static str,
        deps: &'static [&'static str],
        behaviour: Behaviour,
        log: Arc<Mutex<Vec<&'static str>>>,
        running: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl Situation for Scripted {
        fn id(&self) -> &'static str {
            self.id
        }

        fn name(&self) -> &'static str {
            "scripted"
        }

        fn dependencies(&self) -> &'static [&'static str] {
            self.deps
        }

        fn diagnostic<'a>(&'a self, _ctx: &'a SituationContext) -> BoxFuture<'a, Outcome> {
            Box::pin(async move {
                let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                self.log.lock().push(self.id);
                tokio::time::sleep(Duration::from_millis(10)).await;
                self.running.fetch_sub(1, Ordering::SeqCst);
                match self.behaviour {
                    Behaviour::Pass => Outcome::conformant("ok"),
                    Behaviour::Fail => Outcome::violation("broken"),
                    Behaviour::Panic => panic!("boom"),
                }
            })
        }
    }

    struct Harness {
        registry: SituationRegistry,
        log: Arc<Mutex<Vec<&'static str>>>,
        running: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                registry: SituationRegistry::new(),
                log: Arc::default(),
                running: Arc::default(),
                peak: Arc::default(),
            }
        }

        fn add(&mut self, id: &'static str, deps: &'static [&'static str], behaviour: Behaviour) {
            self.registry
                .register(Scripted {
                    id,
                    deps,
                    behaviour,
                    log: self.log.clone(),
                    running: self.running.clone(),
                    peak: self.peak.clone(),
                })
                .unwrap();
        }

        async fn run(self, concurrency: usize) -> (Report, Vec<&'static str>, usize) {
            let config = ProbeConfig {
                max_concurrent_situations: concurrency,
                ..ProbeConfig::default()
            };
            let (connector, _servers) = MemoryConnector::new();
            let context = SituationContext::new(
                config,
                Arc::new(connector),
                Arc::new(JsonHandshake::new(Duration::from_millis(100))),
            );
            let report = Engine::new(self.registry, context).run().await.unwrap();
            let log = self.log.lock().clone();
            (report, log, self.peak.load(Ordering::SeqCst))
        }
    }

    #[tokio::test]
    async fn test_runs_in_dependency_order() {
        let mut harness = Harness::new();
        harness.add("echo", &["proceed"], Behaviour::Pass);
        harness.add("proceed", &["auth"], Behaviour::Pass);
        harness.add("auth", &[], Behaviour::Pass);

        let (report, log, peak) = harness.run(1).await;
        assert_eq!(log, ["auth", "proceed", "echo"]);
        assert_eq!(peak, 1);
        assert!(report.all_passed());
        let ids: Vec<_> = report.results.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["auth", "proceed", "echo"]);
    }

    #[tokio::test]
    async fn test_failed_dependency_skips_dependents() {
        let mut harness = Harness::new();
        harness.add("auth", &[], Behaviour::Fail);
        harness.add("proceed", &["auth"], Behaviour::Pass);
        harness.add("echo", &["proceed"], Behaviour::Pass);
        harness.add("free", &[], Behaviour::Pass);

        let (report, log, _) = harness.run(1).await;
        assert_eq!(log, ["auth", "free"]);
        assert_eq!(report.get("auth").unwrap().verdict, Verdict::Failed);
        assert_eq!(report.get("auth").unwrap().detail, "broken");
        assert_eq!(
            report.get("proceed").unwrap().verdict,
            Verdict::Skipped {
                blocked_by: "auth".into()
            }
        );
        assert_eq!(
            report.get("echo").unwrap().verdict,
            Verdict::Skipped {
                blocked_by: "proceed".into()
            }
        );
        assert_eq!(report.get("free").unwrap().verdict, Verdict::Passed);
    }

    #[tokio::test]
    async fn test_panic_is_crash_not_abort() {
        let mut harness = Harness::new();
        harness.add("bad", &[], Behaviour::Panic);
        harness.add("after", &["bad"], Behaviour::Pass);
        harness.add("good", &[], Behaviour::Pass);

        let (report, _, _) = harness.run(1).await;
        let bad = report.get("bad").unwrap();
        assert_eq!(bad.verdict, Verdict::Crashed);
        assert!(bad.detail.contains("boom"));
        assert!(matches!(
            report.get("after").unwrap().verdict,
            Verdict::Skipped { .. }
        ));
        assert_eq!(report.get("good").unwrap().verdict, Verdict::Passed);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let mut harness = Harness::new();
        for id in ["a", "b", "c", "d", "e"] {
            harness.add(id, &[], Behaviour::Pass);
        }
        let (report, _, peak) = harness.run(2).await;
        assert_eq!(report.passed(), 5);
        assert!(peak <= 2);
    }

    #[tokio::test]
    async fn test_cycle_reported_before_running() {
        let mut harness = Harness::new();
        harness.add("a", &["b"], Behaviour::Pass);
        harness.add("b", &["a"], Behaviour::Pass);
        let log = harness.log.clone();

        let (connector, _servers) = MemoryConnector::new();
        let context = SituationContext::new(
            ProbeConfig::default(),
            Arc::new(connector),
            Arc::new(JsonHandshake::new(Duration::from_millis(100))),
        );
        let err = Engine::new(harness.registry, context).run().await.unwrap_err();
        assert!(matches!(err, ProbeError::DependencyCycle(_)));
        assert!(log.lock().is_empty());
    }
}
