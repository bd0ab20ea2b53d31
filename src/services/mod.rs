pub mod gateways;
pub mod notifications;
pub mod reconciliation;
pub mod sweeper;
