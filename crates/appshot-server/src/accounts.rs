use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Deserialize;
use subtle::ConstantTimeEq;

use appshot_core::admission::{QuotaLedger, Tier};
use appshot_core::error::AppError;

/// One entry of `APPSHOT_ACCOUNTS`.
#[derive(Debug, Clone, Deserialize)]
struct AccountSpec {
    api_key: String,
    client_id: String,
    /// Unknown names fall back to the free tier.
    tier: Option<String>,
    /// Remaining billable requests. Absent means unlimited.
    quota: Option<u64>,
}

/// The identity an API key resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub client_id: String,
    pub tier: Tier,
}

/// API-key registry and per-account request balance.
///
/// The balance is a billing budget, debited per accepted request and
/// credited back only for requests that could not be enqueued. It is
/// separate from the hourly rate-limit windows kept in the cache.
#[derive(Clone, Default)]
pub struct AccountBook {
    keys: Arc<Vec<(String, Account)>>,
    balances: Arc<Mutex<HashMap<String, u64>>>,
}

impl AccountBook {
    /// Parse a JSON array of `{api_key, client_id, tier?, quota?}` objects.
    pub fn from_json(raw: &str) -> Result<Self, AppError> {
        let specs: Vec<AccountSpec> = serde_json::from_str(raw)
            .map_err(|e| AppError::ConfigError(format!("Invalid APPSHOT_ACCOUNTS: {e}")))?;

        let mut seen_keys = HashSet::new();
        let mut seen_clients = HashSet::new();
        let mut keys = Vec::with_capacity(specs.len());
        let mut balances = HashMap::new();

        for spec in specs {
            if spec.api_key.is_empty() || spec.client_id.is_empty() {
                return Err(AppError::ConfigError(
                    "APPSHOT_ACCOUNTS entries need a non-empty api_key and client_id".into(),
                ));
            }
            if !seen_keys.insert(spec.api_key.clone()) {
                return Err(AppError::ConfigError(format!(
                    "Duplicate api_key for client '{}'",
                    spec.client_id
                )));
            }
            if !seen_clients.insert(spec.client_id.clone()) {
                return Err(AppError::ConfigError(format!(
                    "Duplicate client_id '{}'",
                    spec.client_id
                )));
            }
            let tier = Tier::resolve(spec.tier.as_deref());
            if spec.tier.as_deref().is_some_and(|raw| raw.parse::<Tier>().is_err()) {
                tracing::warn!(client_id = %spec.client_id, tier = ?spec.tier, "Unknown tier in APPSHOT_ACCOUNTS, using free");
            }
            if let Some(quota) = spec.quota {
                balances.insert(spec.client_id.clone(), quota);
            }
            keys.push((
                spec.api_key,
                Account {
                    client_id: spec.client_id,
                    tier,
                },
            ));
        }

        Ok(Self {
            keys: Arc::new(keys),
            balances: Arc::new(Mutex::new(balances)),
        })
    }

    /// Reads `APPSHOT_ACCOUNTS`. Unset yields an empty book, which rejects
    /// every client request.
    pub fn from_env() -> Result<Self, AppError> {
        match std::env::var("APPSHOT_ACCOUNTS") {
            Ok(raw) => Self::from_json(&raw),
            Err(_) => {
                tracing::warn!("APPSHOT_ACCOUNTS not set; client endpoints will reject all keys");
                Ok(Self::default())
            }
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Resolve an API key. Every stored key is compared in constant time.
    pub fn authenticate(&self, api_key: &str) -> Option<Account> {
        let mut found = None;
        for (key, account) in self.keys.iter() {
            if bool::from(key.as_bytes().ct_eq(api_key.as_bytes())) {
                found = Some(account.clone());
            }
        }
        found
    }

    /// Remaining balance, `None` when the account is unlimited or unknown.
    pub fn remaining(&self, client_id: &str) -> Option<u64> {
        self.lock_inner().get(client_id).copied()
    }

    fn lock_inner(&self) -> MutexGuard<'_, HashMap<String, u64>> {
        self.balances.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned account balance mutex");
            poisoned.into_inner()
        })
    }
}

impl QuotaLedger for AccountBook {
    async fn try_consume(&self, client_id: &str, amount: u64) -> Result<bool, AppError> {
        let mut balances = self.lock_inner();
        let Some(balance) = balances.get_mut(client_id) else {
            return Ok(true);
        };
        if *balance < amount {
            tracing::info!(%client_id, balance = *balance, %amount, "Account balance exhausted");
            return Ok(false);
        }
        *balance -= amount;
        Ok(true)
    }

    async fn refund(&self, client_id: &str, amount: u64) -> Result<(), AppError> {
        if let Some(balance) = self.lock_inner().get_mut(client_id) {
            *balance = balance.saturating_add(amount);
            tracing::debug!(%client_id, %amount, balance = *balance, "Balance refunded");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ACCOUNTS: &str = r#"[
        {"api_key": "key-free", "client_id": "acme"},
        {"api_key": "key-pro", "client_id": "globex", "tier": "premium", "quota": 3}
    ]"#;

    #[test]
    fn test_authenticate() {
        let book = AccountBook::from_json(ACCOUNTS).unwrap();
        assert_eq!(book.len(), 2);

        let free = book.authenticate("key-free").unwrap();
        assert_eq!(free.client_id, "acme");
        assert_eq!(free.tier, Tier::Free);

        let pro = book.authenticate("key-pro").unwrap();
        assert_eq!(pro.tier, Tier::Premium);

        assert!(book.authenticate("key-pr").is_none());
        assert!(book.authenticate("").is_none());
    }

    #[test]
    fn test_rejects_bad_config() {
        assert!(matches!(
            AccountBook::from_json("not json"),
            Err(AppError::ConfigError(_))
        ));
        assert!(AccountBook::from_json(
            r#"[{"api_key": "k", "client_id": "a"}, {"api_key": "k", "client_id": "b"}]"#
        )
        .is_err());
        assert!(AccountBook::from_json(
            r#"[{"api_key": "k1", "client_id": "a"}, {"api_key": "k2", "client_id": "a"}]"#
        )
        .is_err());
        assert!(AccountBook::from_json(r#"[{"api_key": "", "client_id": "a"}]"#).is_err());
    }

    #[test]
    fn test_unknown_tier_falls_back_to_free() {
        let book = AccountBook::from_json(
            r#"[{"api_key": "k", "client_id": "a", "tier": "gold"},
                {"api_key": "k2", "client_id": "b", "tier": "Enterprise"}]"#,
        )
        .unwrap();
        assert_eq!(book.authenticate("k").unwrap().tier, Tier::Free);
        assert_eq!(book.authenticate("k2").unwrap().tier, Tier::Enterprise);
    }

    #[tokio::test]
    async fn test_balance_decrements_until_exhausted() {
        let book = AccountBook::from_json(ACCOUNTS).unwrap();

        assert!(book.try_consume("globex", 2).await.unwrap());
        assert_eq!(book.remaining("globex"), Some(1));
        assert!(!book.try_consume("globex", 2).await.unwrap());
        assert_eq!(book.remaining("globex"), Some(1));
        assert!(book.try_consume("globex", 1).await.unwrap());
        assert!(!book.try_consume("globex", 1).await.unwrap());
    }

    #[tokio::test]
    async fn test_unlimited_accounts_always_pass() {
        let book = AccountBook::from_json(ACCOUNTS).unwrap();
        assert_eq!(book.remaining("acme"), None);
        assert!(book.try_consume("acme", 1_000_000).await.unwrap());
    }

    #[tokio::test]
    async fn test_refund_restores_metered_balance_only() {
        let book = AccountBook::from_json(ACCOUNTS).unwrap();
        assert!(book.try_consume("globex", 3).await.unwrap());
        book.refund("globex", 2).await.unwrap();
        assert_eq!(book.remaining("globex"), Some(2));

        book.refund("acme", 5).await.unwrap();
        assert_eq!(book.remaining("acme"), None);
    }
}
