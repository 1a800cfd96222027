use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use uuid::Uuid;
use vigil_core::IdentityGallery;
use vigil_store::SqliteSessionStore;

#[derive(Parser)]
#[command(name = "vigil", about = "Inspect Vigil presence sessions and identity galleries")]
struct Cli {
    /// Print JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List recorded sessions for one identity
    Sessions {
        /// Identity ID
        id: Uuid,
        /// Session database (default: $XDG_DATA_HOME/vigil/sessions.db)
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// List identities with recorded sessions
    Identities {
        /// Session database (default: $XDG_DATA_HOME/vigil/sessions.db)
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// Validate a gallery snapshot and list its identities
    Gallery {
        /// Path to the gallery JSON file
        path: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Sessions { id, db } => {
            let store = open_store(db)?;
            let sessions = store.sessions(id).context("failed to read sessions")?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&sessions)?);
            } else if sessions.is_empty() {
                println!("No sessions recorded for {id}");
            } else {
                for s in &sessions {
                    println!(
                        "{}  ->  {}  ({}s)",
                        s.arrival.to_rfc3339(),
                        s.departure.to_rfc3339(),
                        s.duration_secs
                    );
                }
            }
        }
        Commands::Identities { db } => {
            let store = open_store(db)?;
            let summaries = store.identities().context("failed to read identities")?;
            if cli.json {
                let out: Vec<_> = summaries
                    .iter()
                    .map(|s| {
                        serde_json::json!({
                            "identity_id": s.identity_id,
                            "sessions": s.sessions,
                            "total_secs": s.total_secs,
                            "last_departure": s.last_departure,
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else if summaries.is_empty() {
                println!("No sessions recorded");
            } else {
                for s in &summaries {
                    println!(
                        "{}  {} session(s), {}s total, last seen {}",
                        s.identity_id,
                        s.sessions,
                        s.total_secs,
                        s.last_departure.to_rfc3339()
                    );
                }
            }
        }
        Commands::Gallery { path } => {
            let gallery = load_gallery(&path)?;
            if cli.json {
                let identities: Vec<_> = gallery.identities().collect();
                println!("{}", serde_json::to_string_pretty(&identities)?);
            } else {
                println!("{}: {} identities", path.display(), gallery.len());
                for identity in gallery.identities() {
                    println!(
                        "  {}  {}  (dim {}){}",
                        identity.id,
                        identity.name,
                        identity.embedding.dim(),
                        if identity.description.is_empty() {
                            String::new()
                        } else {
                            format!("  {}", identity.description)
                        }
                    );
                }
            }
        }
    }

    Ok(())
}

fn open_store(db: Option<PathBuf>) -> Result<SqliteSessionStore> {
    let path = db.unwrap_or_else(vigil_store::default_db_path);
    tracing::debug!(path = %path.display(), "opening session store");
    SqliteSessionStore::open(&path)
        .with_context(|| format!("failed to open session store {}", path.display()))
}

fn load_gallery(path: &Path) -> Result<IdentityGallery> {
    IdentityGallery::load_json(path)
        .with_context(|| format!("failed to load gallery {}", path.display()))
}
