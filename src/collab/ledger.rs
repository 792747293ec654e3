//! Local token ledger.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::collab::TokenLedger;
use crate::error::CollaboratorError;
use crate::snapshot::JsonSnapshot;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerAccount {
    pub used: u64,
    pub issued: u64,
}

impl LedgerAccount {
    pub fn remaining(&self) -> i64 {
        let issued = i64::try_from(self.issued).unwrap_or(i64::MAX);
        let used = i64::try_from(self.used).unwrap_or(i64::MAX);
        issued.saturating_sub(used)
    }
}

/// Token accounts keyed by lowercased owner identity, optionally persisted
/// to a JSON snapshot.
#[derive(Debug, Default)]
pub struct LocalTokenLedger {
    snapshot: Option<JsonSnapshot>,
    accounts: Mutex<BTreeMap<String, LedgerAccount>>,
}

impl LocalTokenLedger {
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub async fn open(snapshot: JsonSnapshot) -> Result<Self, CollaboratorError> {
        let accounts: BTreeMap<String, LedgerAccount> = snapshot.load_or_default().await?;
        Ok(Self {
            snapshot: Some(snapshot),
            accounts: Mutex::new(accounts),
        })
    }

    /// Grant `amount` more tokens, creating the account if needed.
    pub async fn issue(&self, owner: &str, amount: u64) -> Result<LedgerAccount, CollaboratorError> {
        let mut accounts = self.accounts.lock().await;
        let account = accounts.entry(account_key(owner)).or_default();
        account.issued = account.issued.saturating_add(amount);
        let updated = *account;
        self.persist(&accounts).await?;
        Ok(updated)
    }

    async fn persist(&self, accounts: &BTreeMap<String, LedgerAccount>) -> Result<(), CollaboratorError> {
        if let Some(snapshot) = &self.snapshot {
            snapshot.save(accounts).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl TokenLedger for LocalTokenLedger {
    async fn get(&self, owner: &str) -> Result<Option<LedgerAccount>, CollaboratorError> {
        Ok(self.accounts.lock().await.get(&account_key(owner)).copied())
    }

    async fn increment(
        &self,
        owner: &str,
        amount: u64,
    ) -> Result<Option<LedgerAccount>, CollaboratorError> {
        let mut accounts = self.accounts.lock().await;
        let Some(account) = accounts.get_mut(&account_key(owner)) else {
            return Ok(None);
        };
        account.used = account.used.saturating_add(amount);
        let updated = *account;
        self.persist(&accounts).await?;
        Ok(Some(updated))
    }
}

fn account_key(owner: &str) -> String {
    owner.trim().to_lowercase()
}
