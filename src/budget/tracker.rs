//! Budget tracker: per-provider spend accounting and cap enforcement.
//!
//! All mutations go through `charge`, which holds the tracker mutex for the
//! whole read-modify-write, so concurrent callers cannot interleave. Monetary
//! currencies (USD/EUR/GBP) aggregate into the month-wide total; credits and
//! request counts are tracked per provider only.

use crate::budget::models::*;
use crate::state::Database;
use anyhow::{bail, Result};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Tracks balances and the monthly cap. Clone-cheap handle.
#[derive(Clone)]
pub struct BudgetTracker {
    db: Arc<Mutex<Database>>,
    /// Serializes every mutation (charge, rollover, overrides).
    guard: Arc<Mutex<()>>,
    default_cap_usd: f64,
}

impl BudgetTracker {
    pub fn new(db: Arc<Mutex<Database>>, default_cap_usd: f64) -> Self {
        Self {
            db,
            guard: Arc::new(Mutex::new(())),
            default_cap_usd,
        }
    }

    /// Ensure the budget row and the given provider rows exist.
    pub async fn ensure_seeded(&self, providers: &[ProviderRecord]) -> Result<()> {
        let _guard = self.guard.lock().await;
        let db = self.db.lock().await;
        db.budget_row(self.default_cap_usd, &current_month())?;
        for rec in providers {
            if db.get_provider(&rec.name)?.is_none() {
                db.upsert_provider(rec)?;
            }
        }
        Ok(())
    }

    /// Estimated cost of a call in the provider's own currency.
    pub async fn estimate(
        &self,
        provider: &str,
        input_tokens: u32,
        output_tokens: u32,
    ) -> Result<Cost> {
        let db = self.db.lock().await;
        let Some(rec) = db.get_provider(provider)? else {
            bail!("Unknown provider: {provider}");
        };
        Ok(estimate_for(&rec, input_tokens, output_tokens))
    }

    /// Whether a call with the given estimate is allowed to start.
    /// Free providers never block on budget.
    pub async fn can_afford(&self, provider: &str, estimate: &Cost) -> Result<bool> {
        let db = self.db.lock().await;
        let Some(rec) = db.get_provider(provider)? else {
            return Ok(false);
        };
        if rec.is_free() {
            return Ok(true);
        }

        // Provider-level balance, when one is known.
        if let Some(remaining) = rec.estimated_remaining() {
            let needed = match rec.currency {
                Currency::Requests => 1.0,
                _ => estimate.amount,
            };
            if remaining < needed {
                return Ok(false);
            }
        }

        // Month-wide cap applies to monetary currencies only.
        if rec.currency.is_monetary() {
            let (cap, spent, _) = db.budget_row(self.default_cap_usd, &current_month())?;
            if spent + estimate.amount > cap {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Record actual usage after a call completes (success or failure).
    /// Atomic: the whole read-modify-write happens under the tracker mutex.
    pub async fn charge(
        &self,
        provider: &str,
        actual_in: u32,
        actual_out: u32,
    ) -> Result<ChargeOutcome> {
        let _guard = self.guard.lock().await;
        let db = self.db.lock().await;
        let Some(rec) = db.get_provider(provider)? else {
            bail!("Unknown provider: {provider}");
        };

        let cost = match rec.currency {
            // One call is one request, tokens notwithstanding.
            Currency::Requests => Cost {
                amount: 1.0,
                currency: Currency::Requests,
            },
            _ => estimate_for(&rec, actual_in, actual_out),
        };

        db.add_provider_spend(provider, cost.amount)?;

        if rec.currency.is_monetary() {
            let month = current_month();
            let (cap, spent, stored_month) = db.budget_row(self.default_cap_usd, &month)?;
            let spent = if stored_month == month { spent } else { 0.0 };
            let new_spent = spent + cost.amount;
            db.set_budget_row(cap, new_spent, &month)?;
            if new_spent > cap {
                warn!(
                    "Monthly cap exceeded: {:.4} > {:.4} after charging {}",
                    new_spent, cap, provider
                );
                return Ok(ChargeOutcome::OverCap(cost));
            }
        }
        Ok(ChargeOutcome::Ok(cost))
    }

    /// Reset monthly accounting at the calendar boundary. Resets the month
    /// total and tracked spend for monetary currencies only.
    pub async fn reset_month(&self) -> Result<()> {
        let _guard = self.guard.lock().await;
        let db = self.db.lock().await;
        let month = current_month();
        let (cap, _, _) = db.budget_row(self.default_cap_usd, &month)?;
        db.set_budget_row(cap, 0.0, &month)?;
        db.reset_monetary_spend()?;
        info!("Budget month reset ({month})");
        Ok(())
    }

    /// Roll the month over if the calendar has moved past the stored month.
    pub async fn maybe_rollover(&self) -> Result<bool> {
        let stored = {
            let db = self.db.lock().await;
            db.budget_row(self.default_cap_usd, &current_month())?.2
        };
        if stored != current_month() {
            self.reset_month().await?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Record a creator-reported balance; restarts spend tracking for it.
    pub async fn set_known_balance(
        &self,
        provider: &str,
        value: f64,
        currency: Currency,
    ) -> Result<()> {
        let _guard = self.guard.lock().await;
        let db = self.db.lock().await;
        if db.get_provider(provider)?.is_none() {
            bail!("Unknown provider: {provider}");
        }
        db.set_provider_balance(provider, value, currency)?;
        info!("Balance updated for {provider}: {value} {currency}");
        Ok(())
    }

    /// Replace the monthly cap. Reachable only through the
    /// creator-authenticated API path; no tool or plan field maps here.
    pub async fn override_cap(&self, new_cap_usd: f64) -> Result<()> {
        if new_cap_usd <= 0.0 {
            bail!("Cap must be positive");
        }
        let _guard = self.guard.lock().await;
        let db = self.db.lock().await;
        let month = current_month();
        let (_, spent, _) = db.budget_row(self.default_cap_usd, &month)?;
        db.set_budget_row(new_cap_usd, spent, &month)?;
        info!("Monthly cap overridden to {new_cap_usd:.2} USD");
        Ok(())
    }

    pub async fn register_provider(&self, rec: &ProviderRecord) -> Result<()> {
        let _guard = self.guard.lock().await;
        let db = self.db.lock().await;
        db.upsert_provider(rec)?;
        Ok(())
    }

    pub async fn provider(&self, name: &str) -> Result<Option<ProviderRecord>> {
        let db = self.db.lock().await;
        db.get_provider(name)
    }

    /// Point-in-time summary for the API and the planner context.
    pub async fn status(&self) -> Result<BudgetSummary> {
        let db = self.db.lock().await;
        let month = current_month();
        let (cap, spent, stored_month) = db.budget_row(self.default_cap_usd, &month)?;
        let spent = if stored_month == month { spent } else { 0.0 };

        let providers = db
            .list_providers()?
            .into_iter()
            .map(|rec| ProviderRow {
                available: rec.has_credential(),
                estimated_remaining: rec.estimated_remaining(),
                name: rec.name,
                tier: rec.tier,
                currency: rec.currency,
                known_balance: rec.known_balance,
                spent_tracked: rec.spent_tracked,
            })
            .collect();

        Ok(BudgetSummary {
            monthly_cap_usd: cap,
            spent_this_month_usd: spent,
            remaining_usd: (cap - spent).max(0.0),
            percent_used: if cap > 0.0 { (spent / cap) * 100.0 } else { 0.0 },
            providers,
        })
    }

    /// Tier ceiling recommended by the month's burn rate.
    pub async fn recommended_tier(&self) -> Result<crate::types::Tier> {
        use crate::types::Tier;
        let status = self.status().await?;
        Ok(match status.percent_used {
            p if p >= 95.0 => Tier::LocalOnly,
            p if p >= 80.0 => Tier::Level3,
            p if p >= 60.0 => Tier::Level2,
            _ => Tier::Level1,
        })
    }
}

fn estimate_for(rec: &ProviderRecord, input_tokens: u32, output_tokens: u32) -> Cost {
    let amount = (input_tokens as f64 / 1_000.0) * rec.input_per_1k
        + (output_tokens as f64 / 1_000.0) * rec.output_per_1k;
    Cost {
        amount,
        currency: rec.currency,
    }
}

fn current_month() -> String {
    Utc::now().format("%Y-%m").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(name: &str, tier: ProviderTier, currency: Currency) -> ProviderRecord {
        ProviderRecord {
            name: name.into(),
            tier,
            currency,
            known_balance: None,
            balance_updated_at: None,
            spent_tracked: 0.0,
            api_key_ref: String::new(),
            input_per_1k: 0.002,
            output_per_1k: 0.004,
            notes: None,
        }
    }

    async fn tracker(cap: f64, providers: Vec<ProviderRecord>) -> BudgetTracker {
        let db = Arc::new(Mutex::new(Database::open_memory().unwrap()));
        {
            let db = db.lock().await;
            db.load_or_init_state("d").unwrap();
        }
        let tracker = BudgetTracker::new(db, cap);
        tracker.ensure_seeded(&providers).await.unwrap();
        tracker
    }

    #[tokio::test]
    async fn estimate_uses_per_1k_prices() {
        let t = tracker(100.0, vec![provider("p", ProviderTier::Paid, Currency::Usd)]).await;
        let cost = t.estimate("p", 1000, 500).await.unwrap();
        assert!((cost.amount - (0.002 + 0.002)).abs() < 1e-9);
        assert_eq!(cost.currency, Currency::Usd);
    }

    #[tokio::test]
    async fn charge_tracks_spend_and_detects_over_cap() {
        let t = tracker(0.005, vec![provider("p", ProviderTier::Paid, Currency::Usd)]).await;

        let first = t.charge("p", 1000, 0).await.unwrap(); // 0.002
        assert!(!first.is_over_cap());

        let second = t.charge("p", 1000, 500).await.unwrap(); // +0.004 => 0.006 > cap
        assert!(second.is_over_cap());

        // After exceeding the cap, nothing monetary is affordable.
        let est = t.estimate("p", 100, 100).await.unwrap();
        assert!(!t.can_afford("p", &est).await.unwrap());

        let status = t.status().await.unwrap();
        assert!(status.spent_this_month_usd > status.monthly_cap_usd);
        assert_eq!(status.remaining_usd, 0.0);
    }

    #[tokio::test]
    async fn request_currency_charges_one_per_call() {
        let t = tracker(
            100.0,
            vec![provider("req", ProviderTier::Paid, Currency::Requests)],
        )
        .await;
        t.set_known_balance("req", 2.0, Currency::Requests)
            .await
            .unwrap();

        let outcome = t.charge("req", 12345, 678).await.unwrap();
        assert_eq!(outcome.cost().amount, 1.0);
        assert_eq!(outcome.cost().currency, Currency::Requests);

        let rec = t.provider("req").await.unwrap().unwrap();
        assert_eq!(rec.spent_tracked, 1.0);
        assert_eq!(rec.estimated_remaining(), Some(1.0));

        // One request left: affordable. After it, not.
        let est = Cost {
            amount: 0.0,
            currency: Currency::Requests,
        };
        assert!(t.can_afford("req", &est).await.unwrap());
        t.charge("req", 1, 1).await.unwrap();
        assert!(!t.can_afford("req", &est).await.unwrap());
    }

    #[tokio::test]
    async fn free_providers_never_block() {
        let t = tracker(
            0.0001,
            vec![provider("free", ProviderTier::Free, Currency::Requests)],
        )
        .await;
        let est = Cost {
            amount: 999.0,
            currency: Currency::Requests,
        };
        assert!(t.can_afford("free", &est).await.unwrap());
    }

    #[tokio::test]
    async fn month_reset_clears_monetary_spend_only() {
        let t = tracker(
            100.0,
            vec![
                provider("usd", ProviderTier::Paid, Currency::Usd),
                provider("req", ProviderTier::Paid, Currency::Requests),
            ],
        )
        .await;
        t.charge("usd", 1000, 1000).await.unwrap();
        t.charge("req", 1, 1).await.unwrap();

        t.reset_month().await.unwrap();

        let status = t.status().await.unwrap();
        assert_eq!(status.spent_this_month_usd, 0.0);
        let usd = status.providers.iter().find(|p| p.name == "usd").unwrap();
        let req = status.providers.iter().find(|p| p.name == "req").unwrap();
        assert_eq!(usd.spent_tracked, 0.0);
        assert_eq!(req.spent_tracked, 1.0);
    }

    #[tokio::test]
    async fn set_known_balance_restarts_tracking() {
        let t = tracker(100.0, vec![provider("p", ProviderTier::Paid, Currency::Usd)]).await;
        t.charge("p", 10_000, 0).await.unwrap();
        t.set_known_balance("p", 42.0, Currency::Usd).await.unwrap();
        let rec = t.provider("p").await.unwrap().unwrap();
        assert_eq!(rec.spent_tracked, 0.0);
        assert_eq!(rec.estimated_remaining(), Some(42.0));
    }

    #[tokio::test]
    async fn override_cap_rejects_nonpositive() {
        let t = tracker(10.0, vec![]).await;
        assert!(t.override_cap(-5.0).await.is_err());
        t.override_cap(250.0).await.unwrap();
        assert_eq!(t.status().await.unwrap().monthly_cap_usd, 250.0);
    }

    #[tokio::test]
    async fn recommended_tier_degrades_with_burn() {
        let t = tracker(1.0, vec![provider("p", ProviderTier::Paid, Currency::Usd)]).await;
        assert_eq!(t.recommended_tier().await.unwrap(), crate::types::Tier::Level1);
        // 0.002/1k in, so 350k input tokens = 0.70 => 70%
        t.charge("p", 350_000, 0).await.unwrap();
        assert_eq!(t.recommended_tier().await.unwrap(), crate::types::Tier::Level2);
        t.charge("p", 150_000, 0).await.unwrap(); // 1.00 => 100%
        assert_eq!(
            t.recommended_tier().await.unwrap(),
            crate::types::Tier::LocalOnly
        );
    }
}
