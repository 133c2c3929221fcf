//! Reset command implementation.

use cloudsync_engine::{ChangeTokenStore, FileKeyValueStore};
use cloudsync_protocol::ZoneId;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// What a reset removed.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ResetResult {
    /// Number of change tokens cleared.
    pub tokens_cleared: usize,
    /// Number of subscription flags cleared.
    pub subscriptions_cleared: usize,
}

/// Clears tokens in the store at `path`.
///
/// With `zone`, only that zone's token (and flag) is touched. Without it,
/// the database token and every zone token are cleared.
pub fn reset(
    path: &Path,
    zone: Option<&str>,
    subscriptions: bool,
) -> Result<ResetResult, Box<dyn std::error::Error>> {
    if !path.exists() {
        return Err(format!("No token store found at {:?}", path).into());
    }
    let tokens = ChangeTokenStore::new(Arc::new(FileKeyValueStore::open(path)?));
    let mut result = ResetResult::default();

    match zone {
        Some(zone) => {
            let zone = ZoneId::new(zone);
            if tokens.zone_token(&zone)?.is_some() {
                tokens.set_zone_token(&zone, None)?;
                result.tokens_cleared += 1;
            }
            if subscriptions && tokens.subscription_active(&zone)? {
                tokens.set_subscription_active(&zone, false)?;
                result.subscriptions_cleared += 1;
            }
        }
        None => {
            result.tokens_cleared = tokens.zone_tokens()?.len()
                + usize::from(tokens.database_token()?.is_some());
            tokens.reset_all()?;
            if subscriptions {
                for zone in tokens.active_subscriptions()? {
                    tokens.set_subscription_active(&zone, false)?;
                    result.subscriptions_cleared += 1;
                }
            }
        }
    }
    Ok(result)
}

/// Runs the reset command.
pub fn run(
    path: &Path,
    zone: Option<&str>,
    subscriptions: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let result = reset(path, zone, subscriptions)?;
    info!(
        tokens = result.tokens_cleared,
        subscriptions = result.subscriptions_cleared,
        "token store reset"
    );
    println!(
        "Cleared {} token(s) and {} subscription flag(s)",
        result.tokens_cleared, result.subscriptions_cleared
    );
    Ok(())
}
