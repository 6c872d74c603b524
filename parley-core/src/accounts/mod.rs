//! src/accounts/mod.rs
//!
//! In-memory registry of configured accounts. Accounts are unique by
//! (protocol, case-folded username).

pub mod uri;

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, info};

use parley_common::error::DuplicateAccount;
use parley_common::models::{normalize_name, Account, AccountId, Protocol};

pub use uri::parse_account_uri;

#[derive(Debug, Default)]
pub struct AccountRegistry {
    accounts: BTreeMap<AccountId, Account>,
    index: HashMap<(Protocol, String), AccountId>,
    next_id: u32,
}

impl AccountRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_account(&mut self, account: Account) -> Result<AccountId, DuplicateAccount> {
        let key = (account.protocol.clone(), account.normalized_username());
        if self.index.contains_key(&key) {
            debug!("(AccountRegistry) rejecting duplicate => {}://{}", account.protocol, account.username);
            return Err(DuplicateAccount {
                protocol: account.protocol,
                username: account.username,
            });
        }

        self.next_id += 1;
        let id = AccountId(self.next_id);
        info!("(AccountRegistry) added {} => {}://{}", id, account.protocol, account.username);
        self.index.insert(key, id);
        self.accounts.insert(id, account);
        Ok(id)
    }

    pub fn get(&self, id: AccountId) -> Option<&Account> {
        self.accounts.get(&id)
    }

    pub fn find(&self, protocol: &Protocol, username: &str) -> Option<AccountId> {
        self.index
            .get(&(protocol.clone(), normalize_name(username)))
            .copied()
    }

    /// Drops an account. Callers must make sure no session is using it.
    pub fn remove(&mut self, id: AccountId) -> Option<Account> {
        let account = self.accounts.remove(&id)?;
        self.index
            .remove(&(account.protocol.clone(), account.normalized_username()));
        info!("(AccountRegistry) removed {}", id);
        Some(account)
    }

    /// Accounts in the order they were added.
    pub fn iter(&self) -> impl Iterator<Item = (AccountId, &Account)> {
        self.accounts.iter().map(|(id, acct)| (*id, acct))
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}
