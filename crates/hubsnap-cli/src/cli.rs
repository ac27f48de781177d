use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};
use hubsnap_core::Framework;

pub const HUBSNAP_BEFORE_HELP: &str = concat!(
    "hubsnap ",
    env!("CARGO_PKG_VERSION"),
    " – content-addressed snapshots of hub repositories\n\n",
    "\x1b[1;36mCommands\x1b[0m\n",
    "  download         Resolve a revision and fetch its files into the cache.\n",
    "  path             Print the folder a repository snapshot would use (offline).\n",
    "  list             Show the snapshots already present in the cache.\n",
);

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    propagate_version = false,
    disable_help_subcommand = true,
    before_help = HUBSNAP_BEFORE_HELP
)]
pub struct HubsnapCli {
    #[arg(
        short,
        long,
        help = "Suppress human output (errors still print to stderr)",
        global = true
    )]
    pub quiet: bool,
    #[arg(
        short,
        long,
        action = ArgAction::Count,
        help = "Increase logging (-vv reaches trace)",
        global = true
    )]
    pub verbose: u8,
    #[arg(long, help = "Force trace logging regardless of -v/-q", global = true)]
    pub trace: bool,
    #[arg(
        long,
        help = "Emit {status,message,details} JSON envelopes",
        global = true
    )]
    pub json: bool,
    #[arg(long, help = "Disable colored human output", global = true)]
    pub no_color: bool,
    #[command(subcommand)]
    pub command: CommandCli,
}

#[derive(Subcommand, Debug)]
pub enum CommandCli {
    #[command(
        about = "Resolve a revision and fetch every file into its snapshot folder.",
        override_usage = "hubsnap download <REPO_ID> [--revision REV] [--framework NAME]"
    )]
    Download(DownloadArgs),
    #[command(
        about = "Print the snapshot folder for a repository and content id without network access."
    )]
    Path(PathArgs),
    #[command(about = "List snapshot folders present under the cache root.")]
    List(CacheArgs),
}

#[derive(Args, Debug, Clone)]
pub struct CacheArgs {
    #[arg(
        long,
        value_name = "DIR",
        help = "Cache root (defaults to HUBSNAP_CACHE or the hub cache)"
    )]
    pub cache_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct DownloadArgs {
    #[arg(value_name = "REPO_ID", help = "Repository id, `owner/name` or `name`")]
    pub repo_id: String,
    #[arg(long, value_name = "REV", help = "Branch, tag, or commit (defaults to main)")]
    pub revision: Option<String>,
    #[arg(
        long,
        value_name = "NAME",
        help = "Only fetch this framework's weights plus shared config (pytorch, tensorflow, tensorflow1, flax)"
    )]
    pub framework: Option<Framework>,
    #[arg(
        long,
        value_name = "N",
        help = "Files fetched in parallel (defaults to HUBSNAP_JOBS or 1)"
    )]
    pub jobs: Option<usize>,
    #[arg(long, value_name = "SECS", help = "Give up if the snapshot is not done in time")]
    pub timeout: Option<u64>,
    #[arg(long, help = "Download files again even when cached")]
    pub force: bool,
    #[command(flatten)]
    pub cache: CacheArgs,
}

#[derive(Args, Debug)]
pub struct PathArgs {
    #[arg(value_name = "REPO_ID")]
    pub repo_id: String,
    #[arg(value_name = "CONTENT_ID", help = "Resolved commit hash")]
    pub content_id: String,
    #[command(flatten)]
    pub cache: CacheArgs,
}
