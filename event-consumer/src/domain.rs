//! Domain facades invoked by the consumers, with their Postgres
//! implementations.

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::NaiveDate;
use diesel::prelude::*;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use hris_shared::db::classify_unique_violation;
use hris_shared::schema::{employee_salaries, payrolls, payslips};
use hris_shared::{Clock, DbPool, DomainError, SystemClock};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::models::{NewEmployeeSalary, NewPayslip};

pub const SALARY_UNIQUE_CONSTRAINT: &str = "employee_salaries_employee_id_effective_date_key";

#[derive(Debug, Clone, PartialEq)]
pub struct CreateSalary {
    pub employee_id: Uuid,
    pub base_salary: BigDecimal,
    pub effective_date: NaiveDate,
}

#[async_trait]
pub trait EmployeeSalaryDomain: Send + Sync {
    /// A second salary for the same employee and date is a
    /// [`DomainError::DuplicateEffect`].
    async fn create(&self, company_id: Uuid, salary: CreateSalary) -> Result<(), DomainError>;
}

#[async_trait]
pub trait PayrollDomain: Send + Sync {
    /// Regenerates in place; calling it again for the same payroll replaces
    /// the previous payslip.
    async fn generate_payslip(&self, company_id: Uuid, payroll_id: Uuid) -> Result<(), DomainError>;
}

pub struct PgEmployeeSalaries {
    pool: DbPool,
    clock: Arc<dyn Clock>,
}

impl PgEmployeeSalaries {
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

#[async_trait]
impl EmployeeSalaryDomain for PgEmployeeSalaries {
    async fn create(&self, company_id: Uuid, salary: CreateSalary) -> Result<(), DomainError> {
        let row = NewEmployeeSalary {
            id: Uuid::new_v4(),
            company_id,
            employee_id: salary.employee_id,
            base_salary: salary.base_salary,
            effective_date: salary.effective_date,
            created_at: self.clock.now(),
        };

        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| anyhow::anyhow!("database pool: {e}"))?;
        let conn: &mut AsyncPgConnection = &mut conn;

        diesel::insert_into(employee_salaries::table)
            .values(&row)
            .execute(conn)
            .await
            .map_err(|e| classify_unique_violation(e, SALARY_UNIQUE_CONSTRAINT))?;

        debug!(salary_id = %row.id, employee_id = %row.employee_id, "Salary row inserted");
        Ok(())
    }
}

pub struct PgPayrolls {
    pool: DbPool,
    clock: Arc<dyn Clock>,
}

impl PgPayrolls {
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

#[async_trait]
impl PayrollDomain for PgPayrolls {
    async fn generate_payslip(&self, company_id: Uuid, payroll_id: Uuid) -> Result<(), DomainError> {
        let now = self.clock.now();
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| anyhow::anyhow!("database pool: {e}"))?;
        let conn: &mut AsyncPgConnection = &mut conn;

        let revision = conn
            .transaction::<_, anyhow::Error, _>(|conn| {
                Box::pin(async move {
                    let gross_total: BigDecimal = payrolls::table
                        .filter(payrolls::id.eq(payroll_id))
                        .filter(payrolls::company_id.eq(company_id))
                        .select(payrolls::gross_total)
                        .for_update()
                        .first(conn)
                        .await
                        .optional()?
                        .ok_or_else(|| {
                            anyhow::anyhow!("payroll {payroll_id} not found for company {company_id}")
                        })?;

                    let slip = NewPayslip {
                        id: Uuid::new_v4(),
                        company_id,
                        payroll_id,
                        gross_total: gross_total.clone(),
                        revision: 1,
                        generated_at: now,
                    };

                    let revision: i32 = diesel::insert_into(payslips::table)
                        .values(&slip)
                        .on_conflict(payslips::payroll_id)
                        .do_update()
                        .set((
                            payslips::gross_total.eq(gross_total),
                            payslips::revision.eq(payslips::revision + 1),
                            payslips::generated_at.eq(now),
                        ))
                        .returning(payslips::revision)
                        .get_result(conn)
                        .await?;

                    Ok(revision)
                })
            })
            .await?;

        debug!(%payroll_id, revision, "Payslip generated");
        Ok(())
    }
}
