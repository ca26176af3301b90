//! Supervised account status and manual reconnects.

use crate::error::ApiError;
use crate::supervisor::{AccountStatus, ConnectionSupervisor, SupervisorError, SupervisorStatistics};
use rocket::State;
use rocket::serde::json::Json;
use rocket_okapi::okapi::schemars::JsonSchema;
use rocket_okapi::openapi;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, JsonSchema)]
pub struct AccountsResponse {
    pub accounts: Vec<AccountStatus>,
    pub statistics: SupervisorStatistics,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ReconnectResponse {
    /// Number of accounts that were asked to reconnect.
    pub requested: usize,
}

/// Every registered account, sorted by id, with aggregate counters.
#[openapi(tag = "Accounts")]
#[get("/accounts")]
pub fn list_accounts(supervisor: &State<ConnectionSupervisor>) -> Json<AccountsResponse> {
    Json(AccountsResponse {
        accounts: supervisor.all_statuses(),
        statistics: supervisor.statistics(),
    })
}

#[openapi(tag = "Accounts")]
#[get("/accounts/<account_id>")]
pub fn get_account(
    account_id: &str,
    supervisor: &State<ConnectionSupervisor>,
) -> Result<Json<AccountStatus>, ApiError> {
    supervisor
        .status_of(account_id)
        .map(Json)
        .ok_or_else(|| SupervisorError::UnknownAccount(account_id.to_string()).into())
}

/// Force a reconnect of every account that has not permanently failed.
/// Failure counters are left untouched.
#[openapi(tag = "Accounts")]
#[post("/accounts/reconnect")]
pub fn reconnect_all(supervisor: &State<ConnectionSupervisor>) -> Json<ReconnectResponse> {
    let requested = supervisor.reconnect_all();
    log::info!("operator requested reconnect of {} accounts", requested);
    Json(ReconnectResponse { requested })
}

#[openapi(tag = "Accounts")]
#[post("/accounts/<account_id>/reconnect")]
pub fn reconnect_account(
    account_id: &str,
    supervisor: &State<ConnectionSupervisor>,
) -> Result<Json<ReconnectResponse>, ApiError> {
    supervisor.reconnect(account_id)?;
    log::info!("operator requested reconnect of {}", account_id);
    Ok(Json(ReconnectResponse { requested: 1 }))
}
