use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use tracing::info;
use uuid::Uuid;

use crate::auth::CurrentUser;
use crate::entitlements::tiers::{Feature, Limit};
use crate::entitlements::Requirement;
use crate::errors::AppError;
use crate::monitoring::models::{CreateTargetRequest, MonitoringTarget, ScanStatus};
use crate::state::AppState;

fn not_found(id: Uuid) -> AppError {
    AppError::NotFound(format!("Monitoring target {id} not found"))
}

/// GET /api/monitoring/targets
///
/// Not gated: a downgraded user can still see and remove old targets.
pub async fn handle_list_targets(
    State(state): State<AppState>,
    user: CurrentUser,
) -> Result<Json<Vec<MonitoringTarget>>, AppError> {
    Ok(Json(state.monitoring.list(&user.sub).await?))
}

/// POST /api/monitoring/targets
pub async fn handle_create_target(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(req): Json<CreateTargetRequest>,
) -> Result<(StatusCode, Json<MonitoringTarget>), AppError> {
    let value = req.kind.search_kind().normalize(&req.value)?;
    let current = state.monitoring.count(&user.sub).await?;

    state
        .guard()
        .check(
            &user,
            &[
                Requirement::Feature(Feature::Monitoring),
                Requirement::Capacity {
                    limit: Limit::MonitoringTargets,
                    current,
                    requested: 1,
                },
            ],
        )
        .await?;

    state
        .subscriptions
        .upsert_user(&user.sub, user.email.as_deref())
        .await?;
    let target = state
        .monitoring
        .create(&user.sub, req.kind, &value)
        .await?
        .ok_or_else(|| {
            AppError::Validation(format!("{} {value} is already monitored", req.kind))
        })?;

    info!(user = %user.sub, target = %target.id, kind = %target.kind, "Monitoring target added");
    Ok((StatusCode::CREATED, Json(target)))
}

/// DELETE /api/monitoring/targets/:id
pub async fn handle_delete_target(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    if state.monitoring.delete(&user.sub, id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found(id))
    }
}

/// POST /api/monitoring/targets/:id/scan
///
/// Scans immediately instead of waiting for the scheduler. Costs one lookup.
pub async fn handle_scan_target(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<Json<MonitoringTarget>, AppError> {
    let grant = state
        .guard()
        .check(
            &user,
            &[
                Requirement::Feature(Feature::Monitoring),
                Requirement::metered(Limit::LookupsPerDay),
            ],
        )
        .await?;

    let target = state
        .monitoring
        .begin_scan(&user.sub, id)
        .await?
        .ok_or_else(|| not_found(id))?;
    let scanned = state.scanner().scan(&target).await?;
    if scanned.status != ScanStatus::Failed {
        grant.record(Limit::LookupsPerDay, 1).await?;
    }

    Ok(Json(scanned))
}
