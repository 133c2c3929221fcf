//! Change token persistence.

use crate::error::SyncResult;
use crate::store::KeyValueStore;
use cloudsync_protocol::{ChangeToken, ZoneId};
use std::fmt;
use std::sync::Arc;

const DATABASE_TOKEN_KEY: &str = "database_change_token";
const ZONE_TOKEN_PREFIX: &str = "zone_change_token/";
const SUBSCRIPTION_PREFIX: &str = "subscription_active/";

/// The scope a change token belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TokenScope {
    /// The database-level "which zones changed" cursor.
    Database,
    /// The record-level cursor of one zone.
    Zone(ZoneId),
}

impl TokenScope {
    /// Stable storage key of this scope.
    pub fn key(&self) -> String {
        match self {
            TokenScope::Database => DATABASE_TOKEN_KEY.to_string(),
            TokenScope::Zone(zone) => format!("{ZONE_TOKEN_PREFIX}{zone}"),
        }
    }
}

impl fmt::Display for TokenScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenScope::Database => f.write_str("database"),
            TokenScope::Zone(zone) => write!(f, "zone {zone}"),
        }
    }
}

/// Durable mapping from sync scope to resumption cursor.
///
/// Also records, per zone, whether the change-notification subscription
/// is known to be active. All writes go straight to the underlying
/// [`KeyValueStore`]; nothing is cached here.
#[derive(Clone)]
pub struct ChangeTokenStore {
    store: Arc<dyn KeyValueStore>,
}

impl ChangeTokenStore {
    /// Creates a token store over the given key-value store.
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Reads the token of a scope. `None` means "fetch from the beginning".
    pub fn get(&self, scope: &TokenScope) -> SyncResult<Option<ChangeToken>> {
        Ok(self.store.get(&scope.key())?.map(ChangeToken::from_bytes))
    }

    /// Stores or clears the token of a scope.
    pub fn set(&self, scope: &TokenScope, token: Option<&ChangeToken>) -> SyncResult<()> {
        match token {
            Some(token) => self.store.set(&scope.key(), token.as_bytes().to_vec()),
            None => self.store.remove(&scope.key()),
        }
    }

    /// Reads the database-level token.
    pub fn database_token(&self) -> SyncResult<Option<ChangeToken>> {
        self.get(&TokenScope::Database)
    }

    /// Stores or clears the database-level token.
    pub fn set_database_token(&self, token: Option<&ChangeToken>) -> SyncResult<()> {
        self.set(&TokenScope::Database, token)
    }

    /// Reads a zone token.
    pub fn zone_token(&self, zone: &ZoneId) -> SyncResult<Option<ChangeToken>> {
        self.get(&TokenScope::Zone(zone.clone()))
    }

    /// Stores or clears a zone token.
    pub fn set_zone_token(&self, zone: &ZoneId, token: Option<&ChangeToken>) -> SyncResult<()> {
        self.set(&TokenScope::Zone(zone.clone()), token)
    }

    /// Lists every stored zone token.
    pub fn zone_tokens(&self) -> SyncResult<Vec<(ZoneId, ChangeToken)>> {
        let mut tokens = Vec::new();
        for key in self.store.keys()? {
            let Some(zone) = key.strip_prefix(ZONE_TOKEN_PREFIX) else {
                continue;
            };
            if let Some(bytes) = self.store.get(&key)? {
                tokens.push((ZoneId::new(zone), ChangeToken::from_bytes(bytes)));
            }
        }
        Ok(tokens)
    }

    /// Returns true if the zone's subscription is cached as active.
    pub fn subscription_active(&self, zone: &ZoneId) -> SyncResult<bool> {
        Ok(self
            .store
            .get(&format!("{SUBSCRIPTION_PREFIX}{zone}"))?
            .is_some_and(|value| value.first() == Some(&1)))
    }

    /// Caches whether the zone's subscription is active.
    pub fn set_subscription_active(&self, zone: &ZoneId, active: bool) -> SyncResult<()> {
        let key = format!("{SUBSCRIPTION_PREFIX}{zone}");
        if active {
            self.store.set(&key, vec![1])
        } else {
            self.store.remove(&key)
        }
    }

    /// Lists zones whose subscription is cached as active.
    pub fn active_subscriptions(&self) -> SyncResult<Vec<ZoneId>> {
        let mut zones = Vec::new();
        for key in self.store.keys()? {
            if let Some(zone) = key.strip_prefix(SUBSCRIPTION_PREFIX) {
                let zone = ZoneId::new(zone);
                if self.subscription_active(&zone)? {
                    zones.push(zone);
                }
            }
        }
        Ok(zones)
    }

    /// Clears the database token and every zone token, forcing a full
    /// resync on the next fetch. Subscription flags are kept.
    pub fn reset_all(&self) -> SyncResult<()> {
        self.set_database_token(None)?;
        for (zone, _) in self.zone_tokens()? {
            self.set_zone_token(&zone, None)?;
        }
        Ok(())
    }
}

impl fmt::Debug for ChangeTokenStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeTokenStore").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryKeyValueStore;

    fn token_store() -> ChangeTokenStore {
        ChangeTokenStore::new(Arc::new(MemoryKeyValueStore::new()))
    }

    #[test]
    fn absent_by_default() {
        let tokens = token_store();
        assert_eq!(tokens.database_token().unwrap(), None);
        assert_eq!(tokens.zone_token(&ZoneId::new("DogZone")).unwrap(), None);
        assert!(!tokens.subscription_active(&ZoneId::new("DogZone")).unwrap());
    }

    #[test]
    fn set_is_idempotent_and_clearable() {
        let tokens = token_store();
        let zone = ZoneId::new("DogZone");
        let token = ChangeToken::from_bytes(vec![4, 2]);

        tokens.set_zone_token(&zone, Some(&token)).unwrap();
        tokens.set_zone_token(&zone, Some(&token)).unwrap();
        assert_eq!(tokens.zone_token(&zone).unwrap(), Some(token));

        tokens.set_zone_token(&zone, None).unwrap();
        tokens.set_zone_token(&zone, None).unwrap();
        assert_eq!(tokens.zone_token(&zone).unwrap(), None);
    }

    #[test]
    fn scopes_are_independent() {
        let tokens = token_store();
        let dogs = ZoneId::new("DogZone");
        let cats = ZoneId::new("CatZone");

        tokens
            .set_database_token(Some(&ChangeToken::from_bytes(vec![1])))
            .unwrap();
        tokens
            .set_zone_token(&dogs, Some(&ChangeToken::from_bytes(vec![2])))
            .unwrap();
        tokens
            .set_zone_token(&cats, Some(&ChangeToken::from_bytes(vec![3])))
            .unwrap();

        tokens.set_zone_token(&dogs, None).unwrap();
        assert_eq!(
            tokens.zone_token(&cats).unwrap(),
            Some(ChangeToken::from_bytes(vec![3]))
        );
        assert_eq!(
            tokens.database_token().unwrap(),
            Some(ChangeToken::from_bytes(vec![1]))
        );
        assert_eq!(tokens.zone_tokens().unwrap().len(), 1);
    }

    #[test]
    fn reset_all_keeps_subscriptions() {
        let tokens = token_store();
        let zone = ZoneId::new("DogZone");
        tokens
            .set_database_token(Some(&ChangeToken::from_bytes(vec![1])))
            .unwrap();
        tokens
            .set_zone_token(&zone, Some(&ChangeToken::from_bytes(vec![2])))
            .unwrap();
        tokens.set_subscription_active(&zone, true).unwrap();

        tokens.reset_all().unwrap();

        assert_eq!(tokens.database_token().unwrap(), None);
        assert!(tokens.zone_tokens().unwrap().is_empty());
        assert_eq!(tokens.active_subscriptions().unwrap(), vec![zone]);
    }

    #[test]
    fn scope_keys_are_stable() {
        assert_eq!(TokenScope::Database.key(), "database_change_token");
        assert_eq!(
            TokenScope::Zone(ZoneId::new("DogZone")).key(),
            "zone_change_token/DogZone"
        );
    }
}
