diesel::table! {
    outbox_events (id) {
        id -> Uuid,
        request_id -> Nullable<Varchar>,
        aggregate_type -> Varchar,
        aggregate_id -> Varchar,
        event_type -> Varchar,
        topic -> Varchar,
        payload -> Bytea,
        status -> Varchar,
        retry_count -> Int4,
        next_retry_at -> Nullable<Timestamptz>,
        processed_at -> Nullable<Timestamptz>,
        error_message -> Nullable<Varchar>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
        seq -> Int8,
    }
}

diesel::table! {
    employees (id) {
        id -> Uuid,
        company_id -> Uuid,
        first_name -> Varchar,
        last_name -> Varchar,
        email -> Varchar,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    employee_salaries (id) {
        id -> Uuid,
        company_id -> Uuid,
        employee_id -> Uuid,
        base_salary -> Numeric,
        effective_date -> Date,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    payrolls (id) {
        id -> Uuid,
        company_id -> Uuid,
        period_start -> Date,
        period_end -> Date,
        gross_total -> Numeric,
        status -> Varchar,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    payslips (id) {
        id -> Uuid,
        company_id -> Uuid,
        payroll_id -> Uuid,
        gross_total -> Numeric,
        revision -> Int4,
        generated_at -> Timestamptz,
    }
}

diesel::joinable!(employee_salaries -> employees (employee_id));
diesel::joinable!(payslips -> payrolls (payroll_id));

diesel::allow_tables_to_appear_in_same_query!(
    outbox_events,
    employees,
    employee_salaries,
    payrolls,
    payslips,
);
