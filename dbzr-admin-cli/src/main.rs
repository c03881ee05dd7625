//! DBzr Administration CLI

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use dbzr_core::key::display_id;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser, Debug)]
#[command(name = "dbzr-admin")]
#[command(author = "DBzr Contributors")]
#[command(version = "0.1.0")]
#[command(about = "DBzr branch and repository administration tool")]
struct Cli {
    /// Log at debug level
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a repository and branch (local path or dbzr:// URL)
    Init {
        location: String,
        #[arg(long, default_value = "bincode-v1")]
        serializer: String,
        #[arg(long)]
        stacked_on: Option<String>,
    },

    /// Show a branch's tip, format and stacking
    Info { location: String },

    /// Record the files under a directory as a new revision
    Commit {
        location: String,
        #[arg(long)]
        from: PathBuf,
        #[arg(short, long)]
        message: String,
        #[arg(long, default_value = "dbzr-admin")]
        committer: String,
    },

    /// Show the left-hand history of a branch
    Log {
        location: String,
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Combine all packs into one
    Pack {
        location: String,
        #[arg(long)]
        clean_obsolete: bool,
    },

    /// Combine packs if there are too many (local repositories only)
    Autopack { location: String },

    /// Verify stored hashes and parents
    Check { location: String },

    /// Rewrite texts whose stored parents disagree with the revision graph
    Reconcile { location: String },

    /// Copy a branch's history into another branch
    Push {
        source: String,
        target: String,
        #[arg(long)]
        overwrite: bool,
    },

    /// Update a branch from another branch
    Pull {
        target: String,
        source: String,
        #[arg(long)]
        overwrite: bool,
    },

    /// Stack a branch on another branch
    Stack { location: String, url: String },

    /// Copy the history a branch relies on into its own repository and stop stacking
    Unstack { location: String },
}

fn init_logging(debug: bool) {
    let default = if debug { "debug" } else { "dbzr=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);
    dbzr_smart::open::register();

    match cli.command {
        Commands::Init { location, serializer, stacked_on } => {
            let base = commands::init(&location, &serializer, stacked_on.as_deref())?;
            println!("Created branch at {}", base);
        }

        Commands::Info { location } => {
            let info = commands::info(&location)?;
            println!("Branch:      {}", info.base);
            println!("Format:      {}", info.format);
            println!("Last revno:  {}", info.revno);
            println!("Tip:         {}", display_id(&info.tip));
            if let Some(url) = info.stacked_on {
                println!("Stacked on:  {}", url);
            }
            if let Some(packs) = info.packs {
                println!("Packs:       {}", packs);
            }
        }

        Commands::Commit { location, from, message, committer } => {
            let (revno, revision_id) = commands::commit(&location, &from, &message, &committer)?;
            println!("Committed revision {} ({})", revno, display_id(&revision_id));
        }

        Commands::Log { location, limit } => {
            for entry in commands::log(&location, limit)? {
                println!("revno: {}", entry.revno);
                println!("revision-id: {}", display_id(&entry.revision_id));
                println!("committer: {}", entry.committer);
                println!("timestamp: {}", entry.timestamp.format("%a %Y-%m-%d %H:%M:%S %z"));
                println!("message:");
                for line in entry.message.lines() {
                    println!("  {}", line);
                }
                println!("------------------------------------------------------------");
            }
        }

        Commands::Pack { location, clean_obsolete } => {
            commands::pack(&location, clean_obsolete)?;
            println!("Packed {}", location);
        }

        Commands::Autopack { location } => match commands::autopack(&location)? {
            Some(packs) => println!("Combined into {}", packs.join(", ")),
            None => println!("Nothing to combine"),
        },

        Commands::Check { location } => {
            let report = commands::check(&location)?;
            print!("{}", report);
            if !report.is_clean() {
                anyhow::bail!("{} failed its check", location);
            }
        }

        Commands::Reconcile { location } => {
            let result = commands::reconcile(&location)?;
            println!(
                "Reconciled {}: {} texts fixed, {} packs rewritten",
                location, result.fixed_texts, result.packs_rewritten
            );
        }

        Commands::Push { source, target, overwrite } | Commands::Pull { target, source, overwrite } => {
            let result = commands::transfer(&source, &target, overwrite)?;
            if result.old_revid == result.new_revid {
                println!("No revisions to transfer");
            } else {
                println!(
                    "Now on revision {} ({} revisions copied)",
                    result.new_revno, result.fetch.revisions
                );
            }
        }

        Commands::Stack { location, url } => {
            commands::stack(&location, &url)?;
            println!("{} is now stacked on {}", location, url);
        }

        Commands::Unstack { location } => {
            commands::unstack(&location)?;
            println!("{} is no longer stacked", location);
        }
    }

    Ok(())
}
