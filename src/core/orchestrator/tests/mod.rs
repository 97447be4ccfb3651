mod approvals;
mod plan_parsing;
mod resilience;
mod state_machine;
