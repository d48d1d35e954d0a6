use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, Utc};
use diesel::prelude::*;
use hris_shared::schema::{employee_salaries, payslips};
use uuid::Uuid;

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = employee_salaries)]
pub struct NewEmployeeSalary {
    pub id: Uuid,
    pub company_id: Uuid,
    pub employee_id: Uuid,
    pub base_salary: BigDecimal,
    pub effective_date: NaiveDate,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = payslips)]
pub struct NewPayslip {
    pub id: Uuid,
    pub company_id: Uuid,
    pub payroll_id: Uuid,
    pub gross_total: BigDecimal,
    pub revision: i32,
    pub generated_at: DateTime<Utc>,
}
