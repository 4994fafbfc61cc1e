use anyhow::{bail, Result};
use std::env;
use std::path::Path;

use records_aggregates::{
    backfill_aggregates, backfill_counters, import_csv, logging, reconcile_aggregates,
    repair_invoice_totals, tenant_summary, DocumentKind, Engine, EngineConfig, ImportMode,
    MigrationReport,
};

const USAGE: &str = "\
Usage: records-aggregates <command>

Commands:
  init                                   Create the database schema
  import <csv> [--untracked]             Load records from CSV
  migrate <counters|totals|aggregates|reconcile|all>
  stats <tenant>                         Print the tenant summary
  provision <tenant>                     Mint the tenant's inbound address

Environment:
  RECORDS_AGGREGATES_CONFIG              TOML config file
  RECORDS_AGGREGATES_DB                  Database path override
  RUST_LOG                               Log filter";

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    let config = EngineConfig::from_env()?;
    logging::init(&config.log_filter);

    match args.get(1).map(String::as_str) {
        Some("init") => run_init(config),
        Some("import") => match args.get(2) {
            Some(path) => {
                let mode = if args.iter().any(|a| a == "--untracked") {
                    ImportMode::Untracked
                } else {
                    ImportMode::Tracked
                };
                run_import(config, Path::new(path), mode)
            }
            None => usage(),
        },
        Some("migrate") => match args.get(2) {
            Some(job) => run_migrate(config, job),
            None => usage(),
        },
        Some("stats") => match args.get(2) {
            Some(tenant) => run_stats(config, tenant),
            None => usage(),
        },
        Some("provision") => match args.get(2) {
            Some(tenant) => run_provision(config, tenant),
            None => usage(),
        },
        _ => usage(),
    }
}

fn usage() -> Result<()> {
    eprintln!("{}", USAGE);
    std::process::exit(2);
}

fn run_init(config: EngineConfig) -> Result<()> {
    println!("🗄️  Records Aggregates - Database Setup");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let path = config.database_path.clone();
    let mut engine = Engine::open(config)?;
    engine.checkpoint()?;

    println!("✓ Database initialized with WAL mode: {}", path.display());
    Ok(())
}

fn run_import(config: EngineConfig, csv_path: &Path, mode: ImportMode) -> Result<()> {
    println!("📥 Records Aggregates - CSV Import");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let mut engine = Engine::open(config)?;

    println!("\n📂 Loading {}...", csv_path.display());
    let report = import_csv(&mut engine, csv_path, mode)?;

    println!("✓ Imported {} records", report.imported);
    if !report.failed.is_empty() {
        println!("⚠️  {} rows rejected:", report.failed.len());
        for (line, message) in &report.failed {
            println!("   line {}: {}", line, message);
        }
    }
    if mode == ImportMode::Untracked {
        println!("\n   Records are not tracked yet. Run: records-aggregates migrate aggregates");
    }

    Ok(())
}

fn run_migrate(config: EngineConfig, job: &str) -> Result<()> {
    println!("🔧 Records Aggregates - Migration: {}", job);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let mut engine = Engine::open(config)?;

    let jobs: Vec<&str> = match job {
        "counters" | "totals" | "aggregates" | "reconcile" => vec![job],
        "all" => vec!["counters", "totals", "aggregates"],
        other => bail!("unknown migration `{}`", other),
    };

    for job in jobs {
        match job {
            "counters" => {
                for kind in DocumentKind::ALL {
                    let report = backfill_counters(&mut engine, kind)?;
                    print_report(&format!("{} counters", kind), &report);
                }
            }
            "totals" => print_report("invoice totals", &repair_invoice_totals(&mut engine)?),
            "aggregates" => print_report("aggregates", &backfill_aggregates(&mut engine)?),
            "reconcile" => print_report("reconcile", &reconcile_aggregates(&mut engine)?),
            _ => {}
        }
    }

    Ok(())
}

fn print_report(name: &str, report: &MigrationReport) {
    println!("\n📋 {}", name);
    println!("✓ Updated: {}", report.updated);
    println!("✓ Skipped: {}", report.skipped);

    if report.errors.is_empty() {
        println!("✅ No errors");
    } else {
        println!("❌ Errors: {}", report.errors.len());
        for err in &report.errors {
            match &err.record_id {
                Some(id) => println!("   {} / {}: {}", err.tenant_id, id, err.message),
                None => println!("   {}: {}", err.tenant_id, err.message),
            }
        }
    }
}

fn run_stats(config: EngineConfig, tenant: &str) -> Result<()> {
    let engine = Engine::open(config)?;
    let summary = tenant_summary(&engine, tenant, chrono::Utc::now())?;

    println!("📊 Tenant {}", tenant);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("Clients:   {} active, {} leads", summary.active_clients, summary.lead_clients);
    println!(
        "Projects:  {} in progress, {} completed this month",
        summary.projects_in_progress, summary.projects_completed_this_month
    );
    println!(
        "Quotes:    {} open ({}), {} accepted",
        summary.open_quotes,
        money(summary.open_quote_value_cents),
        money(summary.accepted_quote_value_cents)
    );
    println!(
        "Invoices:  {} outstanding ({}), {} paid ({})",
        summary.outstanding_invoices,
        money(summary.outstanding_revenue_cents),
        summary.paid_invoices,
        money(summary.paid_revenue_cents)
    );
    println!("This month: {} collected", money(summary.paid_revenue_this_month_cents));

    Ok(())
}

fn run_provision(config: EngineConfig, tenant: &str) -> Result<()> {
    let mut engine = Engine::open(config)?;
    let address = engine.provision_tenant(tenant)?;

    println!("✓ Inbound address for {}: {}", tenant, address);
    Ok(())
}

fn money(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    format!("{}${}.{:02}", sign, cents.abs() / 100, cents.abs() % 100)
}
