//! Event bodies carried as outbox payloads and broker message values.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const EMPLOYEE_LIFECYCLE_TOPIC: &str = "hr.employee.lifecycle.v1";
pub const PAYSLIP_REQUESTED_TOPIC: &str = "hr.payroll.payslip.requested.v1";

pub const EMPLOYEE_CREATED: &str = "employee.created";
pub const PAYSLIP_REQUESTED: &str = "payroll.payslip.requested";

pub const EMPLOYEE_AGGREGATE: &str = "employee";
pub const PAYROLL_AGGREGATE: &str = "payroll";

pub const HEADER_EVENT_TYPE: &str = "event_type";
pub const HEADER_AGGREGATE_TYPE: &str = "aggregate_type";

/// A domain event with a fixed topic and a canonical JSON encoding.
pub trait DomainEvent: Serialize + DeserializeOwned + Send + Sync + 'static {
    const TOPIC: &'static str;
    const EVENT_TYPE: &'static str;
    const AGGREGATE_TYPE: &'static str;

    /// Broker key; keeps per-aggregate ordering on the partition.
    fn aggregate_id(&self) -> String;

    /// The type recorded in the body, which may differ from `EVENT_TYPE`
    /// when a topic carries several kinds of events.
    fn event_type(&self) -> &str;

    fn request_id(&self) -> Option<&str> {
        None
    }

    fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmployeeCreated {
    #[serde(default)]
    pub request_id: Option<String>,
    pub event_type: String,
    pub employee_id: Uuid,
    pub company_id: Uuid,
    pub occurred_at: DateTime<Utc>,
}

impl EmployeeCreated {
    pub fn new(
        employee_id: Uuid,
        company_id: Uuid,
        request_id: Option<String>,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            request_id,
            event_type: EMPLOYEE_CREATED.to_string(),
            employee_id,
            company_id,
            occurred_at,
        }
    }
}

impl DomainEvent for EmployeeCreated {
    const TOPIC: &'static str = EMPLOYEE_LIFECYCLE_TOPIC;
    const EVENT_TYPE: &'static str = EMPLOYEE_CREATED;
    const AGGREGATE_TYPE: &'static str = EMPLOYEE_AGGREGATE;

    fn aggregate_id(&self) -> String {
        self.employee_id.to_string()
    }

    fn event_type(&self) -> &str {
        &self.event_type
    }

    fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayrollPayslipRequested {
    pub event_type: String,
    pub payroll_id: Uuid,
    pub company_id: Uuid,
    pub requested_by: Uuid,
    pub occurred_at: DateTime<Utc>,
}

impl PayrollPayslipRequested {
    pub fn new(
        payroll_id: Uuid,
        company_id: Uuid,
        requested_by: Uuid,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_type: PAYSLIP_REQUESTED.to_string(),
            payroll_id,
            company_id,
            requested_by,
            occurred_at,
        }
    }
}

impl DomainEvent for PayrollPayslipRequested {
    const TOPIC: &'static str = PAYSLIP_REQUESTED_TOPIC;
    const EVENT_TYPE: &'static str = PAYSLIP_REQUESTED;
    const AGGREGATE_TYPE: &'static str = PAYROLL_AGGREGATE;

    fn aggregate_id(&self) -> String {
        self.payroll_id.to_string()
    }

    fn event_type(&self) -> &str {
        &self.event_type
    }
}
