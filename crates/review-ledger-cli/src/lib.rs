//! `reviewctl` command surface.
//!
//! Every command prints its result as pretty JSON on stdout; failures go to
//! stderr through [`anyhow`]. Host programs can embed the same behavior via
//! [`run_cli`] (parsed CLI) or [`run_review_with_db`] (a single command
//! against a database path).

use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use review_ledger_core::{ItemId, ReviewDraft, ReviewEdit, ReviewId};
use review_ledger_service::catalog::{
    CatalogDirectory, CatalogError, PermissiveCatalog, StaticCatalog,
};
use review_ledger_service::{ListReviewsQuery, ReviewService, ServiceConfig};
use review_ledger_store_sqlite::SqliteReviewStore;

#[derive(Debug, Parser)]
#[command(name = "reviewctl")]
#[command(about = "Review ledger CLI")]
pub struct Cli {
    #[arg(long, default_value = "./review_ledger.sqlite3")]
    db: PathBuf,

    /// Restrict the catalog to these item ids (repeatable). Without it every
    /// item id is accepted.
    #[arg(long = "known-item")]
    known_items: Vec<i64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Review {
        #[command(subcommand)]
        command: Box<ReviewCommand>,
    },
    System {
        #[command(subcommand)]
        command: Box<SystemCommand>,
    },
}

#[derive(Debug, Subcommand)]
pub enum ReviewCommand {
    Add(AddArgs),
    Edit(EditArgs),
    Delete(DeleteArgs),
    List(ListArgs),
    Counts(CountsArgs),
}

#[derive(Debug, Args)]
pub struct AddArgs {
    #[arg(long)]
    item: i64,
    #[arg(long)]
    rating: i64,
    #[arg(long)]
    comment: Option<String>,
}

#[derive(Debug, Args)]
pub struct EditArgs {
    #[arg(long)]
    id: i64,
    #[arg(long)]
    rating: i64,
    #[arg(long)]
    comment: Option<String>,
}

#[derive(Debug, Args)]
pub struct DeleteArgs {
    #[arg(long)]
    id: i64,
}

#[derive(Debug, Args)]
pub struct ListArgs {
    #[arg(long)]
    item: i64,
    #[arg(long)]
    limit: Option<usize>,
    /// Cursor from the previous page's `next_cursor`.
    #[arg(long)]
    from: Option<String>,
}

#[derive(Debug, Args)]
pub struct CountsArgs {
    #[arg(long = "item", required = true)]
    items: Vec<i64>,
}

#[derive(Debug, Subcommand)]
pub enum SystemCommand {
    Reconcile,
    Status,
    Check,
}

/// Catalog picked from the command line: a fixed id set when `--known-item`
/// flags are present, otherwise accept-everything.
#[derive(Debug, Clone)]
pub enum CliCatalog {
    Permissive(PermissiveCatalog),
    Static(StaticCatalog),
}

impl CliCatalog {
    fn from_known_items(known_items: &[i64]) -> Self {
        if known_items.is_empty() {
            Self::Permissive(PermissiveCatalog)
        } else {
            Self::Static(StaticCatalog::from_ids(known_items.iter().copied()))
        }
    }
}

impl CatalogDirectory for CliCatalog {
    fn exists_by_item_id(&self, item_id: ItemId) -> Result<bool, CatalogError> {
        match self {
            Self::Permissive(catalog) => catalog.exists_by_item_id(item_id),
            Self::Static(catalog) => catalog.exists_by_item_id(item_id),
        }
    }
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when store open/migrate or command execution fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let catalog = CliCatalog::from_known_items(&cli.known_items);
    match cli.command {
        Command::Review { command } => run_review_with_db(&cli.db, catalog, *command),
        Command::System { command } => run_system_with_db(&cli.db, catalog, *command),
    }
}

/// Executes a single review command against the database at `db_path`.
///
/// # Errors
/// Returns an error when store open/migrate or the command fails.
pub fn run_review_with_db(
    db_path: &std::path::Path,
    catalog: CliCatalog,
    command: ReviewCommand,
) -> Result<()> {
    let mut service = open_service(db_path, catalog)?;
    run_review(command, &mut service)
}

/// Executes a single system command against the database at `db_path`.
///
/// # Errors
/// Returns an error when store open/migrate or the command fails, and when a
/// consistency check reports the ledger unhealthy.
pub fn run_system_with_db(
    db_path: &std::path::Path,
    catalog: CliCatalog,
    command: SystemCommand,
) -> Result<()> {
    let mut service = open_service(db_path, catalog)?;
    run_system(command, &mut service)
}

fn open_service(
    db_path: &std::path::Path,
    catalog: CliCatalog,
) -> Result<ReviewService<CliCatalog>> {
    let store = SqliteReviewStore::open(db_path)?;
    store.migrate()?;
    Ok(ReviewService::new(store, catalog, ServiceConfig::default())?)
}

fn run_review(command: ReviewCommand, service: &mut ReviewService<CliCatalog>) -> Result<()> {
    match command {
        ReviewCommand::Add(args) => {
            let review = service.create_review(&ReviewDraft {
                item_id: ItemId(args.item),
                rating: args.rating,
                comment: args.comment,
            })?;
            println!("{}", serde_json::to_string_pretty(&review)?);
            Ok(())
        }
        ReviewCommand::Edit(args) => {
            let review = service.edit_review(&ReviewEdit {
                id: ReviewId(args.id),
                rating: args.rating,
                comment: args.comment,
            })?;
            println!("{}", serde_json::to_string_pretty(&review)?);
            Ok(())
        }
        ReviewCommand::Delete(args) => {
            let review = service.delete_review(ReviewId(args.id))?;
            println!("{}", serde_json::to_string_pretty(&review)?);
            Ok(())
        }
        ReviewCommand::List(args) => {
            let page = service.list_reviews(&ListReviewsQuery {
                item_id: ItemId(args.item),
                limit: args.limit,
                from: args.from,
            })?;
            println!("{}", serde_json::to_string_pretty(&page)?);
            Ok(())
        }
        ReviewCommand::Counts(args) => {
            let item_ids: Vec<ItemId> = args.items.iter().copied().map(ItemId).collect();
            let counts = service.count_reviews(&item_ids)?;
            println!("{}", serde_json::to_string_pretty(&counts)?);
            Ok(())
        }
    }
}

fn run_system(command: SystemCommand, service: &mut ReviewService<CliCatalog>) -> Result<()> {
    match command {
        SystemCommand::Reconcile => {
            let report = service.reconcile()?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        SystemCommand::Status => {
            let status = service.ledger_status()?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        SystemCommand::Check => {
            let check = service.ledger_check()?;
            println!("{}", serde_json::to_string_pretty(&check)?);

            if !check.healthy {
                return Err(anyhow!(
                    "ledger consistency check failed: {}",
                    check
                        .issues
                        .iter()
                        .map(|issue| format!("{}:{}", issue.code, issue.message))
                        .collect::<Vec<_>>()
                        .join("; ")
                ));
            }

            Ok(())
        }
    }
}
