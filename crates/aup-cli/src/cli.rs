use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "aup",
    about = "Signed release distribution and target directory reconciliation",
    version,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Raise log verbosity (repeatable)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the update agent until interrupted
    Run(ConfigArgs),
    /// Reconcile a directory with catalog roots once
    Apply(ApplyArgs),
    /// Inspect the persisted catalog
    Catalog(CatalogArgs),
    /// Inspect blob storage
    Storage(StorageArgs),
    /// Drop catalog objects and blobs no audience needs
    Gc(ConfigArgs),
    /// Show per-audience completeness
    Status(ConfigArgs),
    /// Generate an Ed25519 key pair for signing releases
    Keygen,
}

#[derive(Args)]
pub struct ConfigArgs {
    /// Instance configuration file (TOML)
    #[arg(short, long)]
    pub config: PathBuf,
}

#[derive(Args)]
pub struct ApplyArgs {
    /// State directory holding the catalog and blobs
    #[arg(long)]
    pub state: PathBuf,
    /// Directory to reconcile
    #[arg(long)]
    pub target: PathBuf,
    /// Root object Oid (repeatable)
    #[arg(long = "root", required = true)]
    pub roots: Vec<String>,
    /// Comma separated file kinds; `minimal` and `*` are accepted
    #[arg(long, default_value = "minimal")]
    pub kinds: String,
    /// Apply fixes instead of only reporting
    #[arg(long)]
    pub fix: bool,
    /// Re-hash every needed blob before applying
    #[arg(long)]
    pub check_storage: bool,
}

#[derive(Args)]
pub struct CatalogArgs {
    /// State directory holding the catalog
    #[arg(long)]
    pub state: PathBuf,
    #[command(subcommand)]
    pub action: CatalogAction,
}

#[derive(Subcommand)]
pub enum CatalogAction {
    /// List objects, optionally of one type
    List {
        #[arg(long = "type")]
        object_type: Option<String>,
    },
    /// Show one object
    Show { oid: String },
}

#[derive(Args)]
pub struct StorageArgs {
    /// State directory holding the blobs
    #[arg(long)]
    pub state: PathBuf,
    #[command(subcommand)]
    pub action: StorageAction,
}

#[derive(Subcommand)]
pub enum StorageAction {
    /// List content blobs
    List,
}
