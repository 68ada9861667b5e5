//! Storage and grain-count quota

use grainhost_core::{Account, GrainhostConfig, Result, Store};

/// Why an account is over quota
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaStatus {
    /// Within limits
    Ok,
    /// Too many grains
    OutOfGrains,
    /// Too much storage
    OutOfStorage,
}

impl QuotaStatus {
    /// Whether a limit was hit
    pub fn is_exceeded(self) -> bool {
        self != QuotaStatus::Ok
    }
}

/// Check `account` against its plan with limits scaled by the given factors
fn check(
    config: &GrainhostConfig,
    store: &dyn Store,
    account: &Account,
    grain_factor: u64,
    storage_factor: f64,
) -> Result<QuotaStatus> {
    if !config.quota.enabled || account.is_admin {
        return Ok(QuotaStatus::Ok);
    }
    let Some(plan) = config.plan(account.plan.as_deref()) else {
        tracing::warn!(account_id = %account.id, plan = ?account.plan, "account names an unknown plan");
        return Ok(QuotaStatus::Ok);
    };

    if let Some(grains) = plan.grains {
        let count = store.count_grains_for_account(&account.id)? as u64;
        if count >= grains.saturating_mul(grain_factor) {
            return Ok(QuotaStatus::OutOfGrains);
        }
    }

    let storage_limit = plan.storage_bytes as f64 * storage_factor;
    match account.storage_usage {
        Some(usage) if usage as f64 >= storage_limit => Ok(QuotaStatus::OutOfStorage),
        _ => Ok(QuotaStatus::Ok),
    }
}

/// Whether the account may not create new grains
pub fn over_quota(config: &GrainhostConfig, store: &dyn Store, account: &Account) -> Result<QuotaStatus> {
    check(config, store, account, 1, 1.0)
}

/// Whether the account is so far over quota that its grains may not start
pub fn excessively_over_quota(
    config: &GrainhostConfig,
    store: &dyn Store,
    account: &Account,
) -> Result<QuotaStatus> {
    check(
        config,
        store,
        account,
        config.quota.excess_grain_factor,
        config.quota.excess_storage_factor,
    )
}
