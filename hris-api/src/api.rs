use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use bigdecimal::BigDecimal;
use chrono::NaiveDate;
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use hris_shared::schema::{employees, payrolls};
use hris_shared::{publish_event, Clock, DbPool, EmployeeCreated, OutboxError, PayrollPayslipRequested};
use num_traits::Zero;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

use crate::models::{Employee, NewEmployee, NewPayroll, Payroll};

pub const REQUEST_ID_HEADER: &str = "x-request-id";
const MAX_REQUEST_ID_CHARS: usize = 128;

#[derive(Clone)]
pub struct AppState {
    pub pool: DbPool,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Deserialize)]
pub struct CreateEmployeeRequest {
    pub company_id: Uuid,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
}

impl CreateEmployeeRequest {
    fn validate(&self) -> Result<(), ApiError> {
        if self.first_name.trim().is_empty() || self.last_name.trim().is_empty() {
            return Err(ApiError::Invalid("first_name and last_name are required".to_string()));
        }
        if !self.email.contains('@') {
            return Err(ApiError::Invalid(format!("invalid email: {}", self.email)));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
pub struct CreatePayrollRequest {
    pub company_id: Uuid,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
}

#[derive(Debug, Deserialize)]
pub struct RequestPayslipRequest {
    pub company_id: Uuid,
    pub requested_by: Uuid,
}

#[derive(Debug, Serialize)]
pub struct PayslipRequestedResponse {
    pub payroll_id: Uuid,
    pub event_id: Uuid,
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Invalid(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<DieselError> for ApiError {
    fn from(err: DieselError) -> Self {
        match &err {
            DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, info) => {
                ApiError::Conflict(info.message().to_string())
            }
            _ => ApiError::Internal(err.into()),
        }
    }
}

impl From<OutboxError> for ApiError {
    fn from(err: OutboxError) -> Self {
        match err {
            OutboxError::InvalidEvent(reason) => ApiError::Invalid(reason),
            OutboxError::Database(e) => e.into(),
            other => ApiError::Internal(other.into()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Invalid(m) => (StatusCode::UNPROCESSABLE_ENTITY, m),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::Conflict(m) => (StatusCode::CONFLICT, m),
            ApiError::Internal(e) => {
                error!(error = %e, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/employees", post(create_employee))
        .route("/payrolls", post(create_payroll))
        .route("/payrolls/:id/payslips", post(request_payslip))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

/// Correlation id from the caller, trimmed to what the outbox column holds.
pub fn request_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(|value| value.chars().take(MAX_REQUEST_ID_CHARS).collect())
}

pub async fn create_employee(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateEmployeeRequest>,
) -> Result<(StatusCode, Json<Employee>), ApiError> {
    request.validate()?;

    let now = state.clock.now();
    let new_employee = NewEmployee {
        id: Uuid::new_v4(),
        company_id: request.company_id,
        first_name: request.first_name.trim().to_string(),
        last_name: request.last_name.trim().to_string(),
        email: request.email.trim().to_lowercase(),
        created_at: now,
        updated_at: now,
    };
    let event = EmployeeCreated::new(
        new_employee.id,
        new_employee.company_id,
        request_id(&headers),
        now,
    );

    let mut conn = state.pool.get().await.map_err(OutboxError::from)?;
    let conn: &mut AsyncPgConnection = &mut conn;
    let employee = conn
        .transaction::<_, ApiError, _>(|conn| {
            Box::pin(async move {
                let employee = diesel::insert_into(employees::table)
                    .values(&new_employee)
                    .returning(Employee::as_returning())
                    .get_result(conn)
                    .await?;

                publish_event(conn, &event).await?;
                Ok(employee)
            })
        })
        .await?;

    info!(employee_id = %employee.id, company_id = %employee.company_id, "Employee created");
    Ok((StatusCode::CREATED, Json(employee)))
}

pub async fn create_payroll(
    State(state): State<AppState>,
    Json(request): Json<CreatePayrollRequest>,
) -> Result<(StatusCode, Json<Payroll>), ApiError> {
    if request.period_end < request.period_start {
        return Err(ApiError::Invalid(format!(
            "period_end {} is before period_start {}",
            request.period_end, request.period_start
        )));
    }

    let now = state.clock.now();
    let new_payroll = NewPayroll {
        id: Uuid::new_v4(),
        company_id: request.company_id,
        period_start: request.period_start,
        period_end: request.period_end,
        gross_total: BigDecimal::zero(),
        status: "draft".to_string(),
        created_at: now,
        updated_at: now,
    };

    let mut conn = state.pool.get().await.map_err(OutboxError::from)?;
    let conn: &mut AsyncPgConnection = &mut conn;
    let payroll = diesel::insert_into(payrolls::table)
        .values(&new_payroll)
        .returning(Payroll::as_returning())
        .get_result(conn)
        .await?;

    info!(payroll_id = %payroll.id, company_id = %payroll.company_id, "Payroll created");
    Ok((StatusCode::CREATED, Json(payroll)))
}

pub async fn request_payslip(
    State(state): State<AppState>,
    Path(payroll_id): Path<Uuid>,
    Json(request): Json<RequestPayslipRequest>,
) -> Result<(StatusCode, Json<PayslipRequestedResponse>), ApiError> {
    let event = PayrollPayslipRequested::new(
        payroll_id,
        request.company_id,
        request.requested_by,
        state.clock.now(),
    );

    let mut conn = state.pool.get().await.map_err(OutboxError::from)?;
    let conn: &mut AsyncPgConnection = &mut conn;
    let event_id = conn
        .transaction::<_, ApiError, _>(|conn| {
            Box::pin(async move {
                let found: Option<Uuid> = payrolls::table
                    .filter(payrolls::id.eq(event.payroll_id))
                    .filter(payrolls::company_id.eq(event.company_id))
                    .select(payrolls::id)
                    .first(conn)
                    .await
                    .optional()?;

                if found.is_none() {
                    return Err(ApiError::NotFound(format!("payroll {} not found", event.payroll_id)));
                }

                Ok(publish_event(conn, &event).await?)
            })
        })
        .await?;

    info!(%payroll_id, %event_id, "Payslip requested");
    Ok((
        StatusCode::ACCEPTED,
        Json(PayslipRequestedResponse {
            payroll_id,
            event_id,
            status: "requested".to_string(),
        }),
    ))
}

pub async fn health_check() -> &'static str {
    "OK"
}
