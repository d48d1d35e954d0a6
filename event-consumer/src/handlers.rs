use async_trait::async_trait;
use bigdecimal::BigDecimal;
use hris_shared::{Clock, DomainError, EmployeeCreated, EventHandler, PayrollPayslipRequested};
use num_traits::Zero;
use std::sync::Arc;
use tracing::info;

use crate::domain::{CreateSalary, EmployeeSalaryDomain, PayrollDomain};

/// Opens a zero salary effective today for every new employee.
pub struct EmployeeSalaryHandler<D> {
    domain: D,
    clock: Arc<dyn Clock>,
}

impl<D: EmployeeSalaryDomain> EmployeeSalaryHandler<D> {
    pub fn new(domain: D, clock: Arc<dyn Clock>) -> Self {
        Self { domain, clock }
    }
}

#[async_trait]
impl<D: EmployeeSalaryDomain> EventHandler for EmployeeSalaryHandler<D> {
    type Event = EmployeeCreated;

    async fn handle(&self, event: EmployeeCreated) -> Result<(), DomainError> {
        let salary = CreateSalary {
            employee_id: event.employee_id,
            base_salary: BigDecimal::zero(),
            effective_date: self.clock.today(),
        };
        let effective_date = salary.effective_date;

        self.domain.create(event.company_id, salary).await?;

        info!(
            employee_id = %event.employee_id,
            company_id = %event.company_id,
            %effective_date,
            request_id = event.request_id.as_deref().unwrap_or("-"),
            "Default salary created"
        );
        Ok(())
    }
}

pub struct PayslipHandler<D> {
    domain: D,
}

impl<D: PayrollDomain> PayslipHandler<D> {
    pub fn new(domain: D) -> Self {
        Self { domain }
    }
}

#[async_trait]
impl<D: PayrollDomain> EventHandler for PayslipHandler<D> {
    type Event = PayrollPayslipRequested;

    async fn handle(&self, event: PayrollPayslipRequested) -> Result<(), DomainError> {
        self.domain
            .generate_payslip(event.company_id, event.payroll_id)
            .await?;

        info!(
            payroll_id = %event.payroll_id,
            requested_by = %event.requested_by,
            "Payslip generated"
        );
        Ok(())
    }
}
