use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::errors::AppError;
use crate::search::models::{BreachRecord, SearchKind, SourceStatus};
use crate::search::sources::{BreachSource, SourceError};

/// Merged results of one query across all sources.
#[derive(Debug, Clone)]
pub struct Aggregated {
    pub records: Vec<BreachRecord>,
    pub sources: Vec<SourceStatus>,
}

/// Queries every source concurrently and merges what comes back.
///
/// One slow or failing source never sinks the whole lookup; the query only
/// fails when every source that was asked failed.
#[derive(Clone)]
pub struct SearchAggregator {
    sources: Arc<Vec<Arc<dyn BreachSource>>>,
    timeout: Duration,
}

impl SearchAggregator {
    pub fn new(sources: Vec<Arc<dyn BreachSource>>, timeout: Duration) -> Self {
        Self {
            sources: Arc::new(sources),
            timeout,
        }
    }

    pub fn source_names(&self) -> Vec<&'static str> {
        self.sources.iter().map(|s| s.name()).collect()
    }

    pub async fn search(&self, query: &str, kind: SearchKind) -> Result<Aggregated, AppError> {
        let mut tasks: JoinSet<(usize, Result<Vec<BreachRecord>, SourceError>)> = JoinSet::new();
        let mut asked = 0usize;

        for (index, source) in self.sources.iter().enumerate() {
            if !source.supports(kind) {
                continue;
            }
            asked += 1;
            let source = source.clone();
            let query = query.to_string();
            let timeout = self.timeout;
            tasks.spawn(async move {
                let result = match tokio::time::timeout(timeout, source.search(&query, kind)).await
                {
                    Ok(result) => result,
                    Err(_) => Err(SourceError::Timeout(timeout)),
                };
                (index, result)
            });
        }

        if asked == 0 {
            return Err(AppError::Validation(format!(
                "{kind} lookups are not available"
            )));
        }

        // Slot results by source index so output order does not depend on
        // which source answered first.
        let mut slots: Vec<Option<Result<Vec<BreachRecord>, SourceError>>> =
            (0..self.sources.len()).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, result)) => slots[index] = Some(result),
                Err(e) => warn!("Breach source task panicked: {e}"),
            }
        }

        let mut seen = HashSet::new();
        let mut records = Vec::new();
        let mut statuses = Vec::with_capacity(asked);
        for (source, slot) in self.sources.iter().zip(slots) {
            let Some(result) = slot else {
                if source.supports(kind) {
                    statuses.push(SourceStatus {
                        name: source.name().to_string(),
                        ok: false,
                        count: 0,
                        error: Some("task aborted".to_string()),
                    });
                }
                continue;
            };
            match result {
                Ok(found) => {
                    statuses.push(SourceStatus {
                        name: source.name().to_string(),
                        ok: true,
                        count: found.len(),
                        error: None,
                    });
                    for record in found {
                        if seen.insert(record.dedup_key()) {
                            records.push(record);
                        }
                    }
                }
                Err(e) => {
                    warn!(source = source.name(), %kind, "Breach source failed: {e}");
                    statuses.push(SourceStatus {
                        name: source.name().to_string(),
                        ok: false,
                        count: 0,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        if statuses.iter().all(|s| !s.ok) {
            return Err(AppError::Upstream(format!(
                "All breach sources failed for {kind} lookup"
            )));
        }

        debug!(%kind, total = records.len(), "Aggregated breach lookup");
        Ok(Aggregated {
            records,
            sources: statuses,
        })
    }
}
