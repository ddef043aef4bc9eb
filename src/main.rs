use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use secrecy::ExposeSecret;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use millrace::config::Config;
use millrace::opml::{self, OpmlFeed};
use millrace::repo;
use millrace::storage::{
    build_items_query, Account, AccountKind, Database, DatabaseError, MainFilter, QueryFilters,
    SortOrder, SubFilter,
};
use millrace::util::validate_url;

/// Get the config directory path (~/.config/millrace/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    let config_dir = PathBuf::from(home).join(".config").join("millrace");
    Ok(config_dir)
}

#[derive(Parser, Debug)]
#[command(name = "millrace", about = "Multi-backend feed sync engine", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sync accounts: push pending marks, mirror folders/feeds, pull items
    Sync {
        /// Sync only this account
        #[arg(long, value_name = "ID")]
        account: Option<i64>,

        /// Retry local feeds skipped after repeated failures
        #[arg(long)]
        force: bool,
    },

    /// List stored items, newest first
    List(ListArgs),

    /// List feeds with their unread counts
    Feeds {
        /// Account to list (defaults to the first)
        #[arg(long, value_name = "ID")]
        account: Option<i64>,
    },

    /// Subscribe to a feed URL (local accounts only)
    AddFeed {
        url: String,

        /// Account to add to (defaults to the first local account)
        #[arg(long, value_name = "ID")]
        account: Option<i64>,

        /// Folder to file the subscription under, created if needed
        #[arg(long, value_name = "NAME")]
        folder: Option<String>,
    },

    /// Mark an item read/unread or starred/unstarred
    Mark {
        #[arg(value_enum)]
        action: MarkAction,
        item_id: i64,
    },

    /// Import subscriptions from an OPML file (local accounts only)
    ImportOpml {
        path: PathBuf,

        /// Account to import into (defaults to the first local account)
        #[arg(long, value_name = "ID")]
        account: Option<i64>,
    },

    /// Export subscriptions to an OPML file (local accounts only)
    ExportOpml {
        path: PathBuf,

        /// Account to export (defaults to the first local account)
        #[arg(long, value_name = "ID")]
        account: Option<i64>,
    },
}

#[derive(clap::Args, Debug)]
struct ListArgs {
    /// Account to list (defaults to the first)
    #[arg(long, value_name = "ID")]
    account: Option<i64>,

    /// Restrict to one feed
    #[arg(long, value_name = "ID", conflicts_with = "folder")]
    feed: Option<i64>,

    /// Restrict to one folder
    #[arg(long, value_name = "ID")]
    folder: Option<i64>,

    /// Starred items only
    #[arg(long, conflicts_with = "new")]
    starred: bool,

    /// Items published in the last 24 hours only
    #[arg(long)]
    new: bool,

    /// Hide items already read
    #[arg(long)]
    unread_only: bool,

    /// Sort oldest first instead of newest first
    #[arg(long)]
    oldest_first: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum MarkAction {
    Read,
    Unread,
    Star,
    Unstar,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing for debug logging
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Cli::parse();

    // Set up config directory
    let config_dir = get_config_dir()?;
    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;
        println!("Created config directory: {}", config_dir.display());
    }

    // Credentials live under this directory (config + database), so it must
    // stay user-only.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        match std::fs::metadata(&config_dir) {
            Ok(metadata) => {
                let mut perms = metadata.permissions();
                perms.set_mode(0o700);
                if let Err(e) = std::fs::set_permissions(&config_dir, perms) {
                    tracing::warn!(
                        path = %config_dir.display(),
                        error = %e,
                        "Failed to set config directory permissions to 0700"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(
                    path = %config_dir.display(),
                    error = %e,
                    "Failed to read config directory metadata"
                );
            }
        }
    }

    let config = Config::load(&config_dir.join("config.toml"))?;

    // Open database
    let db_path = config.database_path(&config_dir);
    let db_path_str = db_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
    let db = match Database::open(db_path_str).await {
        Ok(db) => db,
        Err(DatabaseError::InstanceLocked) => {
            eprintln!(
                "Error: Another instance of millrace appears to be running. Please close it and try again."
            );
            std::process::exit(1);
        }
        Err(e) => {
            return Err(anyhow::anyhow!("Failed to open database: {}", e));
        }
    };

    // Mirror config accounts into the database so they have stable ids.
    for entry in &config.accounts {
        db.ensure_account(
            &entry.name,
            entry.kind,
            entry.url.as_deref(),
            entry.login.as_deref(),
            entry.password.as_ref().map(|p| p.expose_secret()),
        )
        .await
        .with_context(|| format!("Failed to set up account '{}'", entry.name))?;
    }

    match args.command {
        Command::Sync { account, force } => cmd_sync(&db, account, force).await,
        Command::List(list) => cmd_list(&db, list).await,
        Command::Feeds { account } => cmd_feeds(&db, account).await,
        Command::AddFeed {
            url,
            account,
            folder,
        } => cmd_add_feed(&db, &url, account, folder).await,
        Command::Mark { action, item_id } => cmd_mark(&db, action, item_id).await,
        Command::ImportOpml { path, account } => cmd_import_opml(&db, &path, account).await,
        Command::ExportOpml { path, account } => cmd_export_opml(&db, &path, account).await,
    }
}

// ============================================================================
// Account resolution
// ============================================================================

/// Accounts a sync run covers: the one named, or all of them.
async fn select_accounts(db: &Database, account_id: Option<i64>) -> Result<Vec<Account>> {
    match account_id {
        Some(id) => {
            let account = db
                .get_account(id)
                .await?
                .with_context(|| format!("No account with id {id}"))?;
            Ok(vec![account])
        }
        None => {
            let accounts = db.list_accounts().await?;
            anyhow::ensure!(!accounts.is_empty(), "No accounts configured");
            Ok(accounts)
        }
    }
}

/// The account a read command targets: the one named, or the first one.
async fn resolve_account(db: &Database, account_id: Option<i64>) -> Result<Account> {
    match account_id {
        Some(id) => db
            .get_account(id)
            .await?
            .with_context(|| format!("No account with id {id}")),
        None => {
            let accounts = db.list_accounts().await?;
            accounts.into_iter().next().context("No accounts configured")
        }
    }
}

/// Subscription management only makes sense for local accounts; remote
/// backends own their own subscription lists.
async fn resolve_local_account(db: &Database, account_id: Option<i64>) -> Result<Account> {
    match account_id {
        Some(id) => {
            let account = db
                .get_account(id)
                .await?
                .with_context(|| format!("No account with id {id}"))?;
            anyhow::ensure!(
                account.kind == AccountKind::Local,
                "Account '{}' is a {} account; subscriptions are managed on the server",
                account.name,
                account.kind
            );
            Ok(account)
        }
        None => {
            let accounts = db.list_accounts().await?;
            accounts
                .into_iter()
                .find(|a| a.kind == AccountKind::Local)
                .context("No local account configured")
        }
    }
}

// ============================================================================
// Commands
// ============================================================================

async fn cmd_sync(db: &Database, account_id: Option<i64>, force: bool) -> Result<()> {
    let accounts = select_accounts(db, account_id).await?;
    let client = http_client()?;

    let mut failures = 0usize;
    for account in &accounts {
        match repo::sync_account(db, &client, account, force).await {
            Ok(summary) => {
                println!(
                    "{}: {} feeds, {} new items, {} marks pushed",
                    account.name, summary.feeds, summary.items_inserted, summary.marks_pushed
                );
            }
            Err(e) => {
                failures += 1;
                eprintln!("{}: sync failed: {:#}", account.name, e);
            }
        }
    }

    if failures > 0 {
        anyhow::bail!("{failures} of {} account(s) failed to sync", accounts.len());
    }
    Ok(())
}

async fn cmd_list(db: &Database, list: ListArgs) -> Result<()> {
    let account = resolve_account(db, list.account).await?;

    let main_filter = if list.starred {
        MainFilter::Stars
    } else if list.new {
        MainFilter::New
    } else {
        MainFilter::All
    };
    // clap rejects --feed together with --folder
    let sub_filter = if list.feed.is_some() {
        SubFilter::Feed
    } else if list.folder.is_some() {
        SubFilter::Folder
    } else {
        SubFilter::None
    };

    let filters = QueryFilters {
        account_id: account.id,
        main_filter,
        sub_filter,
        filter_feed_id: list.feed,
        filter_folder_id: list.folder,
        sort_order: if list.oldest_first {
            SortOrder::OldestToNewest
        } else {
            SortOrder::NewestToOldest
        },
        show_read: !list.unread_only,
    };

    let sql = build_items_query(&filters, account.kind.separate_state())?;
    let rows = db.query_items(&sql).await?;

    if rows.is_empty() {
        println!("No items.");
        return Ok(());
    }
    for row in &rows {
        let date = row
            .pub_date_utc()
            .map(|d| d.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "unknown date".to_string());
        let unread = if row.read { ' ' } else { 'N' };
        let star = if row.starred { '*' } else { ' ' };
        println!(
            "{:>6} {}{} {}  {}  [{}]",
            row.id, unread, star, date, row.title, row.feed_name
        );
    }
    Ok(())
}

async fn cmd_feeds(db: &Database, account_id: Option<i64>) -> Result<()> {
    let account = resolve_account(db, account_id).await?;
    let feeds = db
        .list_feeds(account.id, account.kind.separate_state())
        .await?;

    if feeds.is_empty() {
        println!("No feeds in account '{}'.", account.name);
        return Ok(());
    }
    for feed in &feeds {
        let status = match &feed.error {
            Some(error) => format!("  ERROR: {error}"),
            None => String::new(),
        };
        println!(
            "{:>6} {:>5} unread  {}{}",
            feed.id, feed.unread_count, feed.name, status
        );
    }
    Ok(())
}

async fn cmd_add_feed(
    db: &Database,
    url: &str,
    account_id: Option<i64>,
    folder: Option<String>,
) -> Result<()> {
    let account = resolve_local_account(db, account_id).await?;
    validate_url(url)?;

    let folder_id = match folder {
        Some(name) => Some(db.ensure_folder(account.id, &name).await?),
        None => None,
    };

    // Named after its URL until the first fetch reveals a title.
    let feed_id = db.insert_feed(account.id, url, url, folder_id).await?;
    println!("Subscribed to {url} (feed id {feed_id})");
    Ok(())
}

async fn cmd_mark(db: &Database, action: MarkAction, item_id: i64) -> Result<()> {
    let account = db
        .account_for_item(item_id)
        .await?
        .with_context(|| format!("No item with id {item_id}"))?;

    let changed = match action {
        MarkAction::Read => db.set_item_read(item_id, true, &account).await?,
        MarkAction::Unread => db.set_item_read(item_id, false, &account).await?,
        MarkAction::Star => db.set_item_starred(item_id, true, &account).await?,
        MarkAction::Unstar => db.set_item_starred(item_id, false, &account).await?,
    };

    if changed {
        let verb = match action {
            MarkAction::Read => "read",
            MarkAction::Unread => "unread",
            MarkAction::Star => "starred",
            MarkAction::Unstar => "unstarred",
        };
        println!("Item {item_id} marked {verb}.");
    } else {
        println!("Item {item_id} already in that state.");
    }
    Ok(())
}

async fn cmd_import_opml(db: &Database, path: &Path, account_id: Option<i64>) -> Result<()> {
    let account = resolve_local_account(db, account_id).await?;

    // Canonicalize to resolve symlinks before reading
    let canonical = path
        .canonicalize()
        .with_context(|| format!("Failed to resolve import file: {}", path.display()))?;
    let metadata = std::fs::metadata(&canonical)?;
    if !metadata.is_file() {
        anyhow::bail!("Import path must be a regular file");
    }
    let path_str = canonical
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in OPML path"))?;

    let feeds = opml::parse(path_str)
        .await
        .context("Failed to parse OPML file")?;
    if feeds.is_empty() {
        println!("No valid feeds found in {}", path.display());
        return Ok(());
    }

    let mut imported = 0usize;
    let mut already = 0usize;
    for feed in &feeds {
        if db
            .find_feed_by_url(account.id, &feed.xml_url)
            .await?
            .is_some()
        {
            already += 1;
            continue;
        }
        let folder_id = match &feed.folder {
            Some(name) => Some(db.ensure_folder(account.id, name).await?),
            None => None,
        };
        db.insert_feed(account.id, &feed.title, &feed.xml_url, folder_id)
            .await
            .with_context(|| format!("Failed to import {}", feed.xml_url))?;
        imported += 1;
    }

    println!(
        "Imported {imported} feeds into account '{}' ({already} already subscribed)",
        account.name
    );
    Ok(())
}

async fn cmd_export_opml(db: &Database, path: &Path, account_id: Option<i64>) -> Result<()> {
    let account = resolve_local_account(db, account_id).await?;

    let feeds = db.list_feeds(account.id, false).await?;
    let folders = db.list_folders(account.id).await?;
    let folder_names: HashMap<i64, String> =
        folders.into_iter().map(|f| (f.id, f.name)).collect();

    let opml_feeds: Vec<OpmlFeed> = feeds
        .iter()
        .filter_map(|feed| {
            let xml_url = feed.url.clone()?;
            Some(OpmlFeed {
                title: feed.name.clone(),
                xml_url,
                html_url: feed.site_url.clone(),
                folder: feed
                    .folder_id
                    .and_then(|id| folder_names.get(&id).cloned()),
            })
        })
        .collect();
    anyhow::ensure!(
        !opml_feeds.is_empty(),
        "Account '{}' has no feeds to export",
        account.name
    );

    opml::export_to_file(&opml_feeds, path)?;
    println!("Exported {} feeds to {}", opml_feeds.len(), path.display());
    Ok(())
}

fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(concat!("millrace/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to build HTTP client")
}
