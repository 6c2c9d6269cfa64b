//! Budget data model: currencies, provider records, summaries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Billing currency of a provider account. Monetary currencies aggregate
/// into the month-wide spend; the rest are tracked per-provider only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Currency {
    Usd,
    Eur,
    Gbp,
    Credits,
    Requests,
}

impl Currency {
    pub fn is_monetary(self) -> bool {
        matches!(self, Self::Usd | Self::Eur | Self::Gbp)
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Usd => write!(f, "USD"),
            Self::Eur => write!(f, "EUR"),
            Self::Gbp => write!(f, "GBP"),
            Self::Credits => write!(f, "credits"),
            Self::Requests => write!(f, "requests"),
        }
    }
}

impl FromStr for Currency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "usd" => Ok(Self::Usd),
            "eur" => Ok(Self::Eur),
            "gbp" => Ok(Self::Gbp),
            "credits" => Ok(Self::Credits),
            "requests" => Ok(Self::Requests),
            other => Err(format!("unknown currency: {other}")),
        }
    }
}

/// Cost class of a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderTier {
    Paid,
    Free,
    Unknown,
}

impl fmt::Display for ProviderTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Paid => write!(f, "paid"),
            Self::Free => write!(f, "free"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

impl FromStr for ProviderTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "paid" => Ok(Self::Paid),
            "free" => Ok(Self::Free),
            "unknown" => Ok(Self::Unknown),
            other => Err(format!("unknown provider tier: {other}")),
        }
    }
}

/// Durable record of one provider account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRecord {
    pub name: String,
    pub tier: ProviderTier,
    pub currency: Currency,
    pub known_balance: Option<f64>,
    pub balance_updated_at: Option<DateTime<Utc>>,
    pub spent_tracked: f64,
    /// Environment variable name holding the credential.
    pub api_key_ref: String,
    /// Prices per 1K tokens in the provider currency.
    pub input_per_1k: f64,
    pub output_per_1k: f64,
    pub notes: Option<String>,
}

impl ProviderRecord {
    /// Remaining balance when a known balance exists; unbounded otherwise.
    pub fn estimated_remaining(&self) -> Option<f64> {
        self.known_balance.map(|b| b - self.spent_tracked)
    }

    pub fn is_free(&self) -> bool {
        self.tier == ProviderTier::Free
    }

    /// Whether a credential is present in the environment (or not needed).
    pub fn has_credential(&self) -> bool {
        self.api_key_ref.is_empty()
            || std::env::var(&self.api_key_ref).map_or(false, |v| !v.is_empty())
    }
}

/// A cost amount tagged with its currency.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Cost {
    pub amount: f64,
    pub currency: Currency,
}

/// Result of an atomic charge.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChargeOutcome {
    Ok(Cost),
    /// The charge was recorded but pushed the month past its cap.
    OverCap(Cost),
}

impl ChargeOutcome {
    pub fn cost(&self) -> Cost {
        match self {
            Self::Ok(c) | Self::OverCap(c) => *c,
        }
    }

    pub fn is_over_cap(&self) -> bool {
        matches!(self, Self::OverCap(_))
    }
}

/// Point-in-time budget status for the API and the planner context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetSummary {
    pub monthly_cap_usd: f64,
    pub spent_this_month_usd: f64,
    pub remaining_usd: f64,
    pub percent_used: f64,
    pub providers: Vec<ProviderRow>,
}

impl BudgetSummary {
    pub fn has_free_provider(&self) -> bool {
        self.providers.iter().any(|p| p.tier == ProviderTier::Free)
    }
}

/// One provider row inside a [`BudgetSummary`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRow {
    pub name: String,
    pub tier: ProviderTier,
    pub currency: Currency,
    pub known_balance: Option<f64>,
    pub spent_tracked: f64,
    pub estimated_remaining: Option<f64>,
    pub available: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monetary_currencies_are_exactly_usd_eur_gbp() {
        assert!(Currency::Usd.is_monetary());
        assert!(Currency::Eur.is_monetary());
        assert!(Currency::Gbp.is_monetary());
        assert!(!Currency::Credits.is_monetary());
        assert!(!Currency::Requests.is_monetary());
    }

    #[test]
    fn estimated_remaining_needs_a_known_balance() {
        let mut rec = ProviderRecord {
            name: "p".into(),
            tier: ProviderTier::Paid,
            currency: Currency::Usd,
            known_balance: None,
            balance_updated_at: None,
            spent_tracked: 3.0,
            api_key_ref: String::new(),
            input_per_1k: 0.0,
            output_per_1k: 0.0,
            notes: None,
        };
        assert_eq!(rec.estimated_remaining(), None);
        rec.known_balance = Some(10.0);
        assert_eq!(rec.estimated_remaining(), Some(7.0));
    }
}
