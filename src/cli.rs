//! Command-line surface. Grounded on backpak's `ui/backup.rs` for the
//! per-subcommand `clap::Parser` struct shape, switched from backpak's
//! dispatch-by-hand-rolled-enum to a single derived `Subcommand` enum the
//! way `spacectl`'s CLI in the SPACE workspace does it.

use anyhow::{Context, Result, bail};
use camino::{Utf8Path, Utf8PathBuf};
use clap::{Parser, Subcommand};
use tracing::info;

use crate::blob::BlobStore;
use crate::engine;
use crate::metadata::MetadataRoot;
use crate::report;
use crate::restore;
use crate::search::SearchTree;

#[derive(Debug, Parser)]
#[command(name = "nb", about = "An incremental, content-addressed filesystem backup engine")]
pub struct Cli {
    /// Verbosity (-v, -vv, -vvv, ...); raises the floor set by
    /// `~/.config/nb.toml`'s `verbosity` key, never lowers it.
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create an empty repository at the given directory.
    Init { repository: Utf8PathBuf },
    /// Run a backup using the repository's config document.
    Backup { repository: Utf8PathBuf },
    /// Verify every stored blob still matches its recorded hash.
    Check { repository: Utf8PathBuf },
    /// Delete blobs no live path history references.
    Gc { repository: Utf8PathBuf },
    /// Restore a backup point's files into a destination directory.
    Restore {
        repository: Utf8PathBuf,
        backup_id: u32,
        destination: Utf8PathBuf,
        /// Restrict restoration to paths under this prefix.
        #[arg(long)]
        prefix: Option<Utf8PathBuf>,
    },
}

pub fn effective_verbosity(cli_verbose: u8, config_floor: u8) -> u8 {
    cli_verbose.max(config_floor)
}

pub fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Init { repository } => init(&repository),
        Command::Backup { repository } => backup(&repository),
        Command::Check { repository } => check(&repository),
        Command::Gc { repository } => gc(&repository),
        Command::Restore {
            repository,
            backup_id,
            destination,
            prefix,
        } => restore_cmd(&repository, backup_id, prefix.as_deref(), &destination),
    }
}

fn init(repository: &Utf8Path) -> Result<()> {
    std::fs::create_dir_all(repository)
        .with_context(|| format!("Couldn't create {repository}"))?;
    std::fs::write(repository.join("config"), "")
        .with_context(|| format!("Couldn't create {repository}/config"))?;
    info!("Initialized an empty repository at {repository}");
    Ok(())
}

fn load_config_document(repository: &Utf8Path) -> Result<String> {
    let config_path = repository.join("config");
    std::fs::read_to_string(&config_path).with_context(|| format!("Couldn't open {config_path}"))
}

fn backup(repository: &Utf8Path) -> Result<()> {
    let mut metadata = MetadataRoot::load(repository)?;
    let doc = load_config_document(repository)?;
    let tree = SearchTree::parse(&doc)?;
    let blobs = BlobStore::open(repository);

    engine::initiate(&mut metadata, &tree, Utf8Path::new("/"))?;
    let stats = engine::finish(&mut metadata, &blobs)?;
    engine::record_config(&mut metadata, &blobs, doc.as_bytes())?;

    let now = jiff::Timestamp::now().as_second();
    metadata.write(repository, Some(now))?;

    for warning in tree.unmatched_warnings() {
        eprintln!("nb: {warning}");
    }
    let color = crate::config::load().unwrap_or_default().color;
    report::print(&metadata, &stats, color);
    Ok(())
}

fn check(repository: &Utf8Path) -> Result<()> {
    let metadata = MetadataRoot::load(repository)?;
    let blobs = BlobStore::open(repository);
    let corrupt = blobs.check_integrity(&metadata);
    for path in &corrupt {
        eprintln!("nb: corrupt blob for {path}");
    }
    if corrupt.is_empty() {
        Ok(())
    } else {
        bail!("{} blob(s) failed integrity check", corrupt.len());
    }
}

fn gc(repository: &Utf8Path) -> Result<()> {
    let metadata = MetadataRoot::load(repository)?;
    let blobs = BlobStore::open(repository);
    let (removed, freed) = blobs.collect_garbage(&metadata)?;
    info!("Removed {removed} blob(s), freed {freed} byte(s)");
    Ok(())
}

fn restore_cmd(
    repository: &Utf8Path,
    backup_id: u32,
    prefix: Option<&Utf8Path>,
    destination: &Utf8Path,
) -> Result<()> {
    let metadata = MetadataRoot::load(repository)?;
    let blobs = BlobStore::open(repository);
    let count = restore::restore(&metadata, &blobs, backup_id, prefix, destination)?;
    info!("Restored {count} path(s) to {destination}");
    Ok(())
}
