//! Connectivity health checks.
//!
//! [`HealthChecker`] runs a canary query on a pooled session. A
//! [`HealthRegistry`] aggregates any number of named [`HealthProbe`]s into a
//! single report for a health endpoint.

use crate::db::executor::operation_label;
use crate::db::pool::Pool;
use crate::error::{DbError, DbResult};
use crate::instrument::{Instrument, Metadata, TracingInstrumentation, with_instrumentation};
use crate::models::ResultSet;
use async_trait::async_trait;
use futures_util::future::join_all;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Canary statement; a healthy server answers with a single `1`.
pub const CANARY_SQL: &str = "SELECT 1 AS healthy";

/// Anything that can report whether a dependency is usable.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn is_healthy(&self) -> DbResult<bool>;
}

/// Canary-query probe for a pool.
#[derive(Clone)]
pub struct HealthChecker {
    pool: Pool,
    instrument: Arc<dyn Instrument>,
    label: Option<String>,
}

impl HealthChecker {
    pub fn new(pool: Pool) -> Self {
        Self::with_instrument(pool, Arc::new(TracingInstrumentation))
    }

    pub fn with_instrument(pool: Pool, instrument: Arc<dyn Instrument>) -> Self {
        Self {
            pool,
            instrument,
            label: None,
        }
    }

    /// Set the instrumentation label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Run the canary query.
    ///
    /// Returns `Ok(true)` only when the canary comes back as exactly one row
    /// holding `1`. A driver error destroys the session; a clean round trip
    /// with the wrong answer releases it. Both fail with a health check error.
    pub async fn is_healthy(&self) -> DbResult<bool> {
        let label = operation_label(self.label.as_deref(), "health");
        with_instrumentation(&*self.instrument, &label, self.probe(), |_| Metadata::new()).await
    }

    async fn probe(&self) -> DbResult<bool> {
        let mut session = self
            .pool
            .acquire()
            .await
            .map_err(|e| DbError::health_check("could not acquire a session", Some(e)))?;

        let results = match session.query(CANARY_SQL).await {
            Ok(results) => results,
            Err(e) => {
                self.pool.destroy(session).await;
                return Err(DbError::health_check("canary query failed", Some(e)));
            }
        };
        self.pool.release(session);

        match canary_value(&results) {
            Some(value) if is_one(value) => {
                debug!("Canary query succeeded");
                Ok(true)
            }
            Some(value) => Err(DbError::health_check(
                format!("canary returned {} instead of 1", value),
                None,
            )),
            None => Err(DbError::health_check(
                "canary did not return exactly one row with one column",
                None,
            )),
        }
    }
}

#[async_trait]
impl HealthProbe for HealthChecker {
    async fn is_healthy(&self) -> DbResult<bool> {
        HealthChecker::is_healthy(self).await
    }
}

fn canary_value(results: &[ResultSet]) -> Option<&JsonValue> {
    match results {
        [result] => result.scalar(),
        _ => None,
    }
}

fn is_one(value: &JsonValue) -> bool {
    match value {
        JsonValue::Number(n) => n.as_u64() == Some(1) || n.as_f64() == Some(1.0),
        JsonValue::String(s) => s == "1",
        _ => false,
    }
}

/// Health of one registered source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceHealth {
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Aggregated health: healthy only if every source is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub sources: BTreeMap<String, SourceHealth>,
}

/// Named set of probes checked together.
#[derive(Default, Clone)]
pub struct HealthRegistry {
    probes: Vec<(String, Arc<dyn HealthProbe>)>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a probe under `name`, replacing any probe with the same name.
    pub fn register(&mut self, name: impl Into<String>, probe: Arc<dyn HealthProbe>) {
        let name = name.into();
        self.probes.retain(|(existing, _)| *existing != name);
        self.probes.push((name, probe));
    }

    pub fn len(&self) -> usize {
        self.probes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }

    /// Run every probe concurrently, each on its own task.
    ///
    /// A probe that errors or panics counts as unhealthy. Fails only when
    /// nothing is registered.
    pub async fn check(&self) -> DbResult<HealthReport> {
        if self.probes.is_empty() {
            return Err(DbError::health_check("no sources registered", None));
        }

        let handles: Vec<_> = self
            .probes
            .iter()
            .map(|(name, probe)| {
                let probe = Arc::clone(probe);
                (name, tokio::spawn(async move { probe.is_healthy().await }))
            })
            .collect();

        let checks = handles.into_iter().map(|(name, handle)| async move {
            let health = match handle.await {
                Ok(Ok(healthy)) => SourceHealth {
                    healthy,
                    error: None,
                },
                Ok(Err(e)) => {
                    warn!(source = %name, error = %e.redacted(), "Health probe failed");
                    SourceHealth {
                        healthy: false,
                        error: Some(e.redacted().to_string()),
                    }
                }
                Err(e) => {
                    warn!(source = %name, error = %e, "Health probe did not finish");
                    let reason = if e.is_panic() {
                        "probe panicked"
                    } else {
                        "probe cancelled"
                    };
                    SourceHealth {
                        healthy: false,
                        error: Some(reason.to_string()),
                    }
                }
            };
            (name.clone(), health)
        });

        let sources: BTreeMap<_, _> = join_all(checks).await.into_iter().collect();
        let healthy = sources.values().all(|source| source.healthy);
        Ok(HealthReport { healthy, sources })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Row;

    struct Fixed(bool);

    #[async_trait]
    impl HealthProbe for Fixed {
        async fn is_healthy(&self) -> DbResult<bool> {
            Ok(self.0)
        }
    }

    struct Failing;

    #[async_trait]
    impl HealthProbe for Failing {
        async fn is_healthy(&self) -> DbResult<bool> {
            Err(DbError::health_check("down", None))
        }
    }

    struct Panicking;

    #[async_trait]
    impl HealthProbe for Panicking {
        async fn is_healthy(&self) -> DbResult<bool> {
            panic!("probe bug")
        }
    }

    fn row(value: JsonValue) -> Row {
        let mut row = Row::new();
        row.insert("healthy".into(), value);
        row
    }

    #[test]
    fn test_canary_value_validation() {
        let ok = vec![ResultSet::with_rows(vec![row(1.into())])];
        assert!(canary_value(&ok).is_some_and(is_one));

        let text = vec![ResultSet::with_rows(vec![row("1".into())])];
        assert!(canary_value(&text).is_some_and(is_one));

        let wrong = vec![ResultSet::with_rows(vec![row(2.into())])];
        assert!(!canary_value(&wrong).is_some_and(is_one));

        assert!(canary_value(&[ResultSet::default()]).is_none());
        assert!(canary_value(&[]).is_none());
    }

    #[tokio::test]
    async fn test_registry_empty_fails() {
        let err = HealthRegistry::new().check().await.unwrap_err();
        assert!(err.to_string().contains("no sources registered"));
    }

    #[tokio::test]
    async fn test_registry_is_logical_and() {
        let mut registry = HealthRegistry::new();
        registry.register("primary", Arc::new(Fixed(true)));
        registry.register("replica", Arc::new(Fixed(true)));
        assert!(registry.check().await.unwrap().healthy);

        registry.register("replica", Arc::new(Fixed(false)));
        assert_eq!(registry.len(), 2);
        let report = registry.check().await.unwrap();
        assert!(!report.healthy);
        assert!(report.sources["primary"].healthy);
        assert!(!report.sources["replica"].healthy);
    }

    #[tokio::test]
    async fn test_registry_contains_errors_and_panics() {
        let mut registry = HealthRegistry::new();
        registry.register("ok", Arc::new(Fixed(true)));
        registry.register("failing", Arc::new(Failing));
        registry.register("panicking", Arc::new(Panicking));

        let report = registry.check().await.unwrap();
        assert!(!report.healthy);
        assert!(report.sources["ok"].healthy);
        assert!(report.sources["failing"].error.as_deref().unwrap().contains("down"));
        assert_eq!(
            report.sources["panicking"].error.as_deref(),
            Some("probe panicked")
        );
    }
}
