use std::collections::HashSet;

use axum::{extract::State, Json};
use tracing::info;

use crate::auth::{AuthMethod, CurrentUser};
use crate::entitlements::redaction::redact_for_tier;
use crate::entitlements::tiers::{Feature, Limit};
use crate::entitlements::{Grant, Requirement};
use crate::errors::AppError;
use crate::search::models::{
    BulkItem, BulkSearchRequest, BulkSearchResponse, SearchKind, SearchRequest, SearchResponse,
};
use crate::state::AppState;

fn requirements_for(kind: SearchKind, access: Feature) -> Vec<Requirement> {
    let mut requirements = vec![Requirement::Feature(access)];
    if let Some(feature) = kind.required_feature() {
        requirements.push(Requirement::Feature(feature));
    }
    requirements
}

fn is_redacted(grant: &Grant) -> bool {
    !grant.tier().has_feature(Feature::UnredactedResults)
}

async fn single_lookup(
    state: &AppState,
    user: &CurrentUser,
    req: SearchRequest,
    access: Feature,
    meter: Limit,
) -> Result<SearchResponse, AppError> {
    let query = req.kind.normalize(&req.query)?;
    let mut requirements = requirements_for(req.kind, access);
    requirements.push(Requirement::metered(meter));

    let grant = state.guard().check(user, &requirements).await?;
    let found = state.search.search(&query, req.kind).await?;
    grant.record(meter, 1).await?;

    let redacted = is_redacted(&grant);
    let results = redact_for_tier(grant.tier(), found.records);
    info!(
        user = %user.sub,
        kind = %req.kind,
        total = results.len(),
        redacted,
        "Breach lookup"
    );

    Ok(SearchResponse {
        query,
        kind: req.kind,
        total: results.len(),
        redacted,
        results,
        sources: found.sources,
    })
}

/// POST /api/search
pub async fn handle_search(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(req): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, AppError> {
    single_lookup(&state, &user, req, Feature::BasicSearch, Limit::LookupsPerDay)
        .await
        .map(Json)
}

/// POST /api/v1/search
///
/// Programmatic access. Only API keys are accepted and each lookup costs one
/// monthly API credit instead of a daily lookup.
pub async fn handle_api_search(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(req): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, AppError> {
    if user.via != AuthMethod::ApiKey {
        return Err(AppError::Forbidden);
    }
    single_lookup(&state, &user, req, Feature::ApiAccess, Limit::ApiCreditsPerMonth)
        .await
        .map(Json)
}

/// POST /api/search/bulk
///
/// Charges one lookup per distinct query that a source answered.
pub async fn handle_bulk_search(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(req): Json<BulkSearchRequest>,
) -> Result<Json<BulkSearchResponse>, AppError> {
    let kind = req.kind;
    let mut seen = HashSet::new();
    let mut queries = Vec::with_capacity(req.queries.len());
    for raw in &req.queries {
        let query = kind.normalize(raw)?;
        if seen.insert(query.clone()) {
            queries.push(query);
        }
    }
    if queries.is_empty() {
        return Err(AppError::Validation(
            "Bulk search needs at least one query".to_string(),
        ));
    }

    let batch = queries.len() as u64;
    let mut requirements = requirements_for(kind, Feature::BulkSearch);
    requirements.push(Requirement::Capacity {
        limit: Limit::BulkBatchSize,
        current: 0,
        requested: batch,
    });
    requirements.push(Requirement::Metered {
        limit: Limit::LookupsPerDay,
        amount: batch,
    });
    let grant = state.guard().check(&user, &requirements).await?;
    let redacted = is_redacted(&grant);

    let mut answered = 0u64;
    let mut items = Vec::with_capacity(queries.len());
    for query in queries {
        match state.search.search(&query, kind).await {
            Ok(found) => {
                answered += 1;
                let results = redact_for_tier(grant.tier(), found.records);
                items.push(BulkItem {
                    query,
                    total: results.len(),
                    results,
                    error: None,
                });
            }
            Err(e) => items.push(BulkItem {
                query,
                total: 0,
                results: Vec::new(),
                error: Some(e.to_string()),
            }),
        }
    }
    grant.record(Limit::LookupsPerDay, answered).await?;

    info!(user = %user.sub, %kind, batch, answered, "Bulk breach lookup");
    Ok(Json(BulkSearchResponse {
        kind,
        redacted,
        items,
    }))
}
