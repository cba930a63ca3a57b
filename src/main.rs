use anyhow::{anyhow, Result};
use chrono::Local;
use clap::{Parser, Subcommand, ValueEnum};
use std::sync::Arc;
use std::time::Duration;

use dreamlog::config::{self, AppConfig};
use dreamlog::model::{flatten_newest_first, parse_date, DATE_FORMAT};
use dreamlog::notify::{LogNotifier, NoticeLevel, Notifier};
use dreamlog::remote::{HttpDocumentClient, RemoteBackup, TokenIdentity};
use dreamlog::{
    logger, AppContext, Entry, EntryPatch, EntryRepository, NewEntry, SyncCoordinator, SyncOutcome,
    TagCategory, UserProfile,
};

/// Prints notices to stderr and mirrors them into the log.
struct ConsoleNotifier;

impl Notifier for ConsoleNotifier {
    fn notify(&self, level: NoticeLevel, message: &str) {
        LogNotifier.notify(level, message);
        match level {
            NoticeLevel::Info => eprintln!("{message}"),
            NoticeLevel::Warning => eprintln!("Warning: {message}"),
            NoticeLevel::Error => eprintln!("Error: {message}"),
        }
    }
}

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record a dream
    Add {
        title: String,
        /// Calendar date (YYYY-MM-DD), defaults to today
        #[arg(long)]
        date: Option<String>,
        #[arg(long, short)]
        description: Option<String>,
        /// Tag name, repeatable
        #[arg(long = "tag", short)]
        tags: Vec<String>,
        #[arg(long)]
        lucid: bool,
        #[arg(long)]
        nightmare: bool,
        /// Path to a voice recording
        #[arg(long)]
        audio: Option<String>,
    },
    /// Change fields of an existing dream
    Edit {
        id: String,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        date: Option<String>,
        #[arg(long, short)]
        description: Option<String>,
        /// Replaces the tag list, repeatable
        #[arg(long = "tag", short)]
        tags: Option<Vec<String>>,
        #[arg(long)]
        lucid: Option<bool>,
        #[arg(long)]
        nightmare: Option<bool>,
        #[arg(long)]
        audio: Option<String>,
    },
    /// Delete a dream
    Delete { id: String },
    /// List dreams, newest first
    List {
        #[arg(long)]
        date: Option<String>,
    },
    /// Show one dream in full
    Show { id: String },
    /// Manage the tag registry
    Tag {
        #[command(subcommand)]
        action: TagAction,
    },
    /// Journal statistics
    Stats,
    /// Show or change the user profile
    Profile {
        #[command(subcommand)]
        action: ProfileAction,
    },
    /// Print every dream as JSON, grouped by date
    Export,
    /// Delete all local data
    Clear {
        /// Also empty the remote backup
        #[arg(long)]
        remote: bool,
    },
    /// Run one sync pass now
    Sync,
    /// Keep syncing on the configured interval until Ctrl-C
    Watch,
    /// Store an identity token
    Login {
        #[arg(long)]
        token: String,
        #[arg(long, default_value = "")]
        refresh_token: String,
    },
    /// Forget the identity token. Local data is kept.
    Logout,
    /// Turn offline mode on or off
    Offline { state: Toggle },
}

#[derive(Subcommand)]
enum TagAction {
    Add {
        name: String,
        #[arg(long, value_enum, default_value_t = CategoryArg::Regular)]
        category: CategoryArg,
    },
    Rm {
        name: String,
    },
    List,
}

#[derive(Subcommand)]
enum ProfileAction {
    Show,
    Set {
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        dark_mode: Option<bool>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum CategoryArg {
    Regular,
    Lucid,
    Nightmare,
}

impl From<CategoryArg> for TagCategory {
    fn from(arg: CategoryArg) -> Self {
        match arg {
            CategoryArg::Regular => TagCategory::Regular,
            CategoryArg::Lucid => TagCategory::Lucid,
            CategoryArg::Nightmare => TagCategory::Nightmare,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum Toggle {
    On,
    Off,
}

fn today() -> String {
    Local::now().date_naive().format(DATE_FORMAT).to_string()
}

fn print_entry_line(entry: &Entry) {
    let mut flags = String::new();
    if entry.is_lucid {
        flags.push_str(" [lucid]");
    }
    if entry.is_nightmare {
        flags.push_str(" [nightmare]");
    }
    println!("{}  {}  {}{}", entry.date.format(DATE_FORMAT), entry.id, entry.title, flags);
}

fn print_entry(entry: &Entry) {
    println!("Id:       {}", entry.id);
    println!("Date:     {}", entry.date.format(DATE_FORMAT));
    println!("Title:    {}", entry.title);
    if let Some(description) = &entry.description {
        println!("Details:  {description}");
    }
    if !entry.tags.is_empty() {
        println!("Tags:     {}", entry.tags.join(", "));
    }
    println!("Lucid:    {}", entry.is_lucid);
    println!("Nightmare: {}", entry.is_nightmare);
    if let Some(audio) = &entry.audio_path {
        println!("Audio:    {audio}");
    }
    println!("Created:  {}", entry.created_at.with_timezone(&Local).format("%Y-%m-%d %H:%M"));
    if let Some(updated) = entry.updated_at {
        println!("Updated:  {}", updated.with_timezone(&Local).format("%Y-%m-%d %H:%M"));
    }
}

fn remote_backup(app_config: &AppConfig) -> Result<Arc<RemoteBackup>> {
    let client = HttpDocumentClient::new(&app_config.remote)?;
    Ok(Arc::new(RemoteBackup::new(Arc::new(client), Arc::new(TokenIdentity))))
}

fn sync_coordinator(app_config: &AppConfig, repo: Arc<dyn EntryRepository>) -> Result<Arc<SyncCoordinator>> {
    Ok(Arc::new(
        SyncCoordinator::new(repo, remote_backup(app_config)?)
            .with_policy(app_config.sync.conflict_policy)
            .with_offline(app_config.general.offline_mode),
    ))
}

fn report_outcome(outcome: &SyncOutcome) {
    match outcome {
        SyncOutcome::Completed(report) => println!(
            "Synced: {} pulled, {} pushed, {} conflicts, {} tags pulled, {} tags pushed.",
            report.pulled, report.pushed, report.conflicts, report.tags_pulled, report.tags_pushed
        ),
        SyncOutcome::AlreadySyncing => println!("A sync is already running."),
        SyncOutcome::Offline => println!("Offline: log in and disable offline mode to sync."),
        SyncOutcome::Failed(reason) => eprintln!("Sync failed: {reason}"),
    }
}

async fn clear_all(app_config: &AppConfig, repo: &dyn EntryRepository, remote: bool) -> Result<()> {
    if remote {
        let backup = remote_backup(app_config)?;
        if !backup.is_authenticated() {
            println!("Not logged in, remote backup left alone.");
        } else {
            // Remote first, so a later sync cannot resurrect local data.
            match backup.delete_all_entries().await {
                Err(e) => eprintln!("Failed to clear remote entries: {e:#}"),
                Ok(()) => match backup.delete_all_tags().await {
                    Err(e) => eprintln!("Failed to clear remote tags: {e:#}"),
                    Ok(()) => println!("Remote backup cleared."),
                },
            }
        }
    }

    repo.clear_all_data().await?;
    Ok(())
}

async fn watch(app_config: &AppConfig, repo: Arc<dyn EntryRepository>) -> Result<()> {
    let coordinator = sync_coordinator(app_config, repo)?;
    let mut status = coordinator.subscribe_status();
    let handle = coordinator
        .clone()
        .spawn(Duration::from_secs(app_config.sync.interval_secs.max(1)));

    println!(
        "Syncing every {}s. Press Ctrl-C to stop.",
        app_config.sync.interval_secs
    );
    loop {
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *status.borrow_and_update();
                println!("[{}] {}", Local::now().format("%H:%M:%S"), current.as_str());
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    handle.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    logger::init();
    let args = Args::parse();

    let data_dir = config::get_config_dir();
    let app_config = config::load_config_from(&data_dir);

    match &args.command {
        Commands::Login { token, refresh_token } => {
            config::get_user_id_from_token(token)
                .map_err(|e| anyhow!("Token rejected: {e}"))?;
            config::save_token_data(token, refresh_token)?;
            match config::get_user_email_from_token(token) {
                Ok(email) => println!("Logged in as: {email}"),
                Err(_) => println!("Login successful!"),
            }
            return Ok(());
        }
        Commands::Logout => {
            if config::get_token().is_empty() {
                println!("Already logged out.");
                return Ok(());
            }
            config::delete_token_data()?;
            println!("Logged out successfully. Local data preserved.");
            return Ok(());
        }
        Commands::Offline { state } => {
            let offline = matches!(state, Toggle::On);
            config::set_offline_mode(offline)?;
            println!("Offline mode {}.", if offline { "on" } else { "off" });
            return Ok(());
        }
        _ => {}
    }

    let context = AppContext::from_config(&app_config, &data_dir, Arc::new(ConsoleNotifier));
    let repo = context.repository().await?;

    match args.command {
        Commands::Add {
            title,
            date,
            description,
            tags,
            lucid,
            nightmare,
            audio,
        } => {
            let entry = repo
                .add_entry(NewEntry {
                    date: date.unwrap_or_else(today),
                    title,
                    description,
                    tags,
                    is_lucid: lucid,
                    is_nightmare: nightmare,
                    audio_path: audio,
                })
                .await?;
            println!("Added {}", entry.id);
        }
        Commands::Edit {
            id,
            title,
            date,
            description,
            tags,
            lucid,
            nightmare,
            audio,
        } => {
            let patch = EntryPatch {
                date,
                title,
                description,
                tags,
                is_lucid: lucid,
                is_nightmare: nightmare,
                audio_path: audio,
            };
            if patch.is_empty() {
                println!("Nothing to change.");
                return Ok(());
            }
            match repo.update_entry(&id, patch).await? {
                Some(entry) => println!("Updated {}", entry.id),
                None => println!("No dream with id {id}."),
            }
        }
        Commands::Delete { id } => {
            if repo.delete_entry(&id).await? {
                println!("Deleted {id}");
            } else {
                println!("No dream with id {id}.");
            }
        }
        Commands::List { date } => {
            let entries = match date {
                Some(raw) => {
                    let date = parse_date(&raw).ok_or_else(|| anyhow!("Invalid date: {raw}"))?;
                    repo.get_entries_by_date(date)
                }
                None => flatten_newest_first(&repo.snapshot()),
            };
            if entries.is_empty() {
                println!("No dreams recorded.");
            }
            for entry in &entries {
                print_entry_line(entry);
            }
        }
        Commands::Show { id } => match repo.get_entry_by_id(&id) {
            Some(entry) => print_entry(&entry),
            None => println!("No dream with id {id}."),
        },
        Commands::Tag { action } => match action {
            TagAction::Add { name, category } => {
                let tag = repo.add_tag(&name, category.into()).await?;
                println!("Added tag {} ({})", tag.name, tag.category);
            }
            TagAction::Rm { name } => {
                if repo.delete_tag(&name).await? {
                    println!("Removed tag {name}");
                } else {
                    println!("No tag named {name}.");
                }
            }
            TagAction::List => {
                for tag in repo.get_all_tags() {
                    println!("{:<20} {}", tag.name, tag.category);
                }
            }
        },
        Commands::Stats => {
            let stats = repo.get_dream_statistics();
            println!("Total dreams:  {}", stats.total_dreams);
            println!("Good dreams:   {}", stats.good_dreams);
            println!("Nightmares:    {}", stats.bad_dreams);
            println!("Lucid dreams:  {}", stats.lucid_dreams);
            println!("Streak (days): {}", stats.streak_days);
        }
        Commands::Profile { action } => match action {
            ProfileAction::Show => {
                let profile = repo.user_profile();
                println!("Name:      {}", profile.name);
                println!("Email:     {}", profile.email);
                println!("Dark mode: {}", profile.dark_mode);
            }
            ProfileAction::Set {
                name,
                email,
                dark_mode,
            } => {
                let current = repo.user_profile();
                repo.update_user_profile(UserProfile {
                    name: name.unwrap_or(current.name),
                    email: email.unwrap_or(current.email),
                    dark_mode: dark_mode.unwrap_or(current.dark_mode),
                })
                .await?;
                println!("Profile updated.");
            }
        },
        Commands::Export => {
            println!("{}", repo.export_entries()?);
        }
        Commands::Clear { remote } => {
            clear_all(&app_config, repo.as_ref(), remote).await?;
        }
        Commands::Sync => {
            let coordinator = sync_coordinator(&app_config, repo)?;
            report_outcome(&coordinator.force_sync().await);
        }
        Commands::Watch => {
            watch(&app_config, repo).await?;
        }
        Commands::Login { .. } | Commands::Logout | Commands::Offline { .. } => {}
    }

    Ok(())
}
