//! Command surface for the invoice memory pipeline.
//!
//! The binary is a thin harness: it loads JSON fixtures of the domain types,
//! feeds them through [`InvoiceProcessor`], and prints the results as pretty
//! JSON. All pipeline behavior lives in `invoice-memory-core`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use invoice_memory_core::{HumanCorrection, Invoice, InvoiceProcessor, MemoryStore, PurchaseOrder};
use invoice_memory_store_sqlite::{SqliteAuditLog, SqliteMemoryStore};
use serde::de::DeserializeOwned;

#[derive(Debug, Parser)]
#[command(name = "imem")]
#[command(about = "Invoice memory pipeline CLI")]
pub struct Cli {
    #[arg(long, default_value = "./invoice_memory.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Process one extracted invoice through Recall -> Apply -> Decide.
    Process(ProcessArgs),
    /// Learn from a human correction.
    Correct(CorrectArgs),
    /// Inspect stored memories.
    Memories {
        #[command(subcommand)]
        command: MemoriesCommand,
    },
    /// List the audit log for one invoice.
    Audit(AuditArgs),
}

#[derive(Debug, Args)]
pub struct ProcessArgs {
    #[arg(long)]
    invoice: PathBuf,
    #[arg(long)]
    purchase_orders: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct CorrectArgs {
    #[arg(long)]
    correction: PathBuf,
}

#[derive(Debug, Subcommand)]
pub enum MemoriesCommand {
    Vendor(VendorMemoriesArgs),
    Corrections,
    Resolutions,
}

#[derive(Debug, Args)]
pub struct VendorMemoriesArgs {
    #[arg(long)]
    vendor: String,
}

#[derive(Debug, Args)]
pub struct AuditArgs {
    #[arg(long)]
    invoice_id: String,
}

/// Executes the parsed CLI command graph.
///
/// # Errors
/// Returns an error when store open/migrate, fixture loading, or the
/// requested pipeline operation fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let store = SqliteMemoryStore::open(&cli.db)?;
    store.migrate()?;

    match cli.command {
        Command::Process(args) => {
            let invoice: Invoice = read_json_file(&args.invoice)?;
            let purchase_orders: Vec<PurchaseOrder> = match args.purchase_orders {
                Some(path) => read_json_file(&path)?,
                None => Vec::new(),
            };

            let audit = SqliteAuditLog::open(&cli.db)?;
            audit.migrate()?;

            let mut processor = InvoiceProcessor::new(store, audit);
            let result = processor.process(&invoice, &purchase_orders)?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Command::Correct(args) => {
            let correction: HumanCorrection = read_json_file(&args.correction)?;

            let audit = SqliteAuditLog::open(&cli.db)?;
            audit.migrate()?;

            let mut processor = InvoiceProcessor::new(store, audit);
            let updates = processor.apply_correction(&correction)?;
            println!("{}", serde_json::to_string_pretty(&updates)?);
            Ok(())
        }
        Command::Memories { command } => {
            match command {
                MemoriesCommand::Vendor(args) => {
                    let memories = store.list_vendor_memories(&args.vendor)?;
                    println!("{}", serde_json::to_string_pretty(&memories)?);
                }
                MemoriesCommand::Corrections => {
                    let memories = store.list_correction_memories()?;
                    println!("{}", serde_json::to_string_pretty(&memories)?);
                }
                MemoriesCommand::Resolutions => {
                    let memories = store.list_resolution_memories()?;
                    println!("{}", serde_json::to_string_pretty(&memories)?);
                }
            }
            Ok(())
        }
        Command::Audit(args) => {
            let audit = SqliteAuditLog::open(&cli.db)?;
            audit.migrate()?;
            let entries = audit.list_for_invoice(&args.invoice_id)?;
            println!("{}", serde_json::to_string_pretty(&entries)?);
            Ok(())
        }
    }
}

fn read_json_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let body = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&body).with_context(|| format!("failed to parse {}", path.display()))
}
