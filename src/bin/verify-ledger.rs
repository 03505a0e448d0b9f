use anyhow::{anyhow, Result};
use clap::{Arg, ArgAction, Command};
use std::time::Duration;
use tracing::{error, info};

use compliance_core::database::Database;
use compliance_core::ledger::{find_tampered_entries, merkle_root, LedgerFilter, LedgerStore, VerificationResult};

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("verify-ledger")
        .version("0.1.0")
        .about("Verify compliance ledger hash chains")
        .arg(
            Arg::new("database")
                .short('d')
                .long("database")
                .value_name("URL")
                .help("Database URL, e.g. sqlite://compliance.db")
                .required(true),
        )
        .arg(
            Arg::new("tenant")
                .short('t')
                .long("tenant")
                .value_name("TENANT")
                .help("Verify only this tenant (default: every tenant)"),
        )
        .arg(
            Arg::new("merkle-root")
                .short('m')
                .long("merkle-root")
                .value_name("HASH")
                .requires("tenant")
                .help("Expected Merkle root over the tenant's full chain"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue)
                .help("Enable verbose output"),
        )
        .arg(
            Arg::new("quiet")
                .short('q')
                .long("quiet")
                .action(ArgAction::SetTrue)
                .help("Suppress output except errors"),
        )
        .get_matches();

    let verbose = matches.get_flag("verbose");
    let quiet = matches.get_flag("quiet");

    // Set log level based on flags
    let level = if quiet {
        tracing::Level::ERROR
    } else if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let database_url = matches
        .get_one::<String>("database")
        .ok_or_else(|| anyhow!("--database is required"))?;
    let database = Database::open_existing(database_url, 1, Duration::from_secs(30)).await?;
    let ledger = LedgerStore::new(database);

    let tenants = match matches.get_one::<String>("tenant") {
        Some(tenant) => vec![tenant.clone()],
        None => ledger.tenants().await?,
    };
    if tenants.is_empty() {
        info!("No tenant chains found");
    }

    let mut broken = Vec::new();
    for tenant in &tenants {
        let result = ledger.verify_chain(tenant, None, None).await?;
        report(&result, quiet);
        if !result.is_valid {
            if verbose {
                match ledger.read(tenant, &LedgerFilter::default()).await {
                    Ok(entries) => {
                        let tampered = find_tampered_entries(&entries);
                        if !tampered.is_empty() {
                            eprintln!("  entries with mismatched hashes: {:?}", tampered);
                        }
                    }
                    Err(e) => eprintln!("  entries could not be read back: {}", e),
                }
            }
            broken.push(tenant.clone());
        }
    }

    if let (Some(expected), Some(tenant)) = (
        matches.get_one::<String>("merkle-root"),
        matches.get_one::<String>("tenant"),
    ) {
        let entries = ledger.read(tenant, &LedgerFilter::default()).await?;
        let actual = merkle_root(&entries);
        if actual.as_deref() != Some(expected.as_str()) {
            error!("Merkle root mismatch for {}: expected {}, got {:?}", tenant, expected, actual);
            std::process::exit(1);
        }
        if !quiet {
            println!("✓ Merkle root matches for {}", tenant);
        }
    }

    if !broken.is_empty() {
        error!("Ledger verification failed for: {}", broken.join(", "));
        std::process::exit(1);
    }

    if !quiet {
        println!("✓ Verified {} tenant chain(s)", tenants.len());
    }
    Ok(())
}

fn report(result: &VerificationResult, quiet: bool) {
    if result.is_valid {
        if !quiet {
            println!("✓ {}", result.summary());
        }
    } else {
        eprintln!("✗ {}", result.summary());
        if let (Some(expected), Some(actual)) = (&result.expected_hash, &result.actual_hash) {
            eprintln!("  expected: {}", expected);
            eprintln!("  actual:   {}", actual);
        }
    }
}
