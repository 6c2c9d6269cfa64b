pub mod models;
pub mod tracker;

pub use models::{
    BudgetSummary, ChargeOutcome, Cost, Currency, ProviderRecord, ProviderRow, ProviderTier,
};
pub use tracker::BudgetTracker;
