//! Tokens command implementation.

use cloudsync_engine::{ChangeTokenStore, FileKeyValueStore};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

/// Contents of a token store.
#[derive(Debug, Serialize)]
pub struct TokenReport {
    /// Token store path.
    pub path: String,
    /// Database change token, hex encoded.
    pub database_token: Option<String>,
    /// Zone change tokens.
    pub zones: Vec<ZoneTokenEntry>,
    /// Zones whose subscription is cached as active.
    pub subscriptions: Vec<String>,
}

/// One zone token.
#[derive(Debug, Serialize)]
pub struct ZoneTokenEntry {
    /// Zone identifier.
    pub zone: String,
    /// Change token, hex encoded.
    pub token: String,
}

/// Reads every token from the store at `path`.
pub fn collect(path: &Path) -> Result<TokenReport, Box<dyn std::error::Error>> {
    if !path.exists() {
        return Err(format!("No token store found at {:?}", path).into());
    }
    let tokens = ChangeTokenStore::new(Arc::new(FileKeyValueStore::open(path)?));

    Ok(TokenReport {
        path: path.display().to_string(),
        database_token: tokens.database_token()?.map(|token| token.to_hex()),
        zones: tokens
            .zone_tokens()?
            .into_iter()
            .map(|(zone, token)| ZoneTokenEntry {
                zone: zone.to_string(),
                token: token.to_hex(),
            })
            .collect(),
        subscriptions: tokens
            .active_subscriptions()?
            .into_iter()
            .map(|zone| zone.to_string())
            .collect(),
    })
}

/// Runs the tokens command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let report = collect(path)?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&report)?),
        _ => print_text(&report),
    }
    Ok(())
}

fn print_text(report: &TokenReport) {
    println!("CloudSync Token Store");
    println!("=====================");
    println!();
    println!("Path: {}", report.path);
    println!();
    println!(
        "Database token: {}",
        report.database_token.as_deref().unwrap_or("(none)")
    );
    println!();
    println!("Zone tokens:");
    if report.zones.is_empty() {
        println!("  (none)");
    }
    for entry in &report.zones {
        println!("  {:<24} {}", entry.zone, entry.token);
    }
    println!();
    println!("Active subscriptions:");
    if report.subscriptions.is_empty() {
        println!("  (none)");
    }
    for zone in &report.subscriptions {
        println!("  {zone}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudsync_protocol::{ChangeToken, ZoneId};

    #[test]
    fn collects_tokens_and_subscriptions() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("tokens.cbor");
        {
            let tokens = ChangeTokenStore::new(Arc::new(FileKeyValueStore::open(&path).unwrap()));
            tokens
                .set_database_token(Some(&ChangeToken::from_bytes(vec![0xab])))
                .unwrap();
            tokens
                .set_zone_token(&ZoneId::new("DogZone"), Some(&ChangeToken::from_bytes(vec![1, 2])))
                .unwrap();
            tokens
                .set_subscription_active(&ZoneId::new("DogZone"), true)
                .unwrap();
        }

        let report = collect(&path).unwrap();

        assert_eq!(report.database_token.as_deref(), Some("ab"));
        assert_eq!(report.zones.len(), 1);
        assert_eq!(report.zones[0].zone, "DogZone");
        assert_eq!(report.zones[0].token, "0102");
        assert_eq!(report.subscriptions, vec!["DogZone"]);
    }

    #[test]
    fn missing_store_is_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(collect(&dir.path().join("absent.cbor")).is_err());
    }
}
