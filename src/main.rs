//! PrivacyGuard: privacy-preserving query gateway.
//!
//! One-shot CLI over the gateway core. Results are printed as JSON on
//! stdout; logs go to stderr through the sanitizing writer.

use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use privacyguard::adapters::sanitize::SanitizingMakeWriter;
use privacyguard::adapters::SqliteEvaluator;
use privacyguard::application::{QueryGateway, ReceiptLedger};
use privacyguard::domain::Policy;

fn usage() -> String {
    [
        "Usage: privacyguard <command> [args]",
        "",
        "Commands:",
        "  analyze <sql>              risk-analyze a query (no execution)",
        "  execute <sql>              execute under policy, accepting rewrites",
        "  execute --reject <sql>     execute only if no rewrite is required",
        "  rewrite <sql>              lattice search for the minimal-loss safe rewrite",
        "  verify <receipt.json>      verify a previously issued receipt",
        "  import <data.csv>          load patient records into the store",
        "",
        "Environment:",
        "  PG_DB_PATH                 store location (default privacyguard.db)",
        "  PG_SIGNING_SEED            receipt signing seed",
        "  PG_K_MIN, PG_L_MIN, PG_DROP_PREDICATE   policy overrides",
    ]
    .join("\n")
}

fn init_logging() -> tracing_appender::non_blocking::WorkerGuard {
    // Logs go to stderr so stdout stays machine-readable.
    let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(SanitizingMakeWriter::new(writer)),
        )
        .init();

    guard
}

fn open_gateway() -> Result<QueryGateway<SqliteEvaluator>> {
    let db_path =
        std::env::var("PG_DB_PATH").unwrap_or_else(|_| "privacyguard.db".to_string());
    let store = SqliteEvaluator::new(&db_path)
        .with_context(|| format!("Failed to open store at {db_path}"))?;
    Ok(QueryGateway::new(Arc::new(store), ReceiptLedger::from_env()))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> Result<()> {
    let _guard = init_logging();

    let mut args = std::env::args().skip(1);
    let command = args.next().ok_or_else(|| anyhow!(usage()))?;

    match command.as_str() {
        "analyze" => {
            let sql = args.next().ok_or_else(|| anyhow!(usage()))?;
            let gateway = open_gateway()?;
            print_json(&gateway.analyze(&sql, &Policy::from_env_or_default()))?;
        }
        "execute" => {
            let mut accept_rewrite = true;
            let mut sql = args.next().ok_or_else(|| anyhow!(usage()))?;
            if sql == "--reject" {
                accept_rewrite = false;
                sql = args.next().ok_or_else(|| anyhow!(usage()))?;
            }
            let gateway = open_gateway()?;
            let outcome = gateway.execute(&sql, accept_rewrite, &Policy::from_env_or_default())?;
            print_json(&outcome)?;
        }
        "rewrite" => {
            let sql = args.next().ok_or_else(|| anyhow!(usage()))?;
            let gateway = open_gateway()?;
            let candidate = gateway.search_rewrite(&sql, &Policy::from_env_or_default());
            print_json(&serde_json::json!({
                "rewritten_sql": candidate.rewritten_sql,
                "applied_rules": candidate.applied_rules,
                "information_loss": candidate.information_loss,
                "safe": candidate.safe,
                "analysis": candidate.analysis,
            }))?;
        }
        "verify" => {
            let path = args.next().ok_or_else(|| anyhow!(usage()))?;
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {path}"))?;
            let receipt: serde_json::Value =
                serde_json::from_str(&text).context("Receipt is not valid JSON")?;
            let gateway = open_gateway()?;
            print_json(&gateway.verify(&receipt))?;
        }
        "import" => {
            let path = args.next().ok_or_else(|| anyhow!(usage()))?;
            let db_path =
                std::env::var("PG_DB_PATH").unwrap_or_else(|_| "privacyguard.db".to_string());
            let store = SqliteEvaluator::new(&db_path)
                .with_context(|| format!("Failed to open store at {db_path}"))?;
            let inserted = store.import_csv_file(&path)?;
            print_json(&serde_json::json!({
                "status": "ok",
                "inserted": inserted,
                "total": store.total_records()?,
            }))?;
        }
        "-h" | "--help" => println!("{}", usage()),
        other => bail!("Unknown command: {other}\n\n{}", usage()),
    }

    Ok(())
}
