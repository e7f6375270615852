use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use gitdepot::areas::gateway::Gateway;
use gitdepot::artifacts::environment;
use std::io::Write;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "gitdepot",
    version = "0.1.0",
    about = "A Git gateway for a centralized depot",
    long_about = "gitdepot translates Git pushes into numbered depot changelists and \
    reconstructs branch history back out of them. Pushes are atomic: \
    a failure anywhere rolls back every changelist the push created.",
    help_template = r"
{name} {version} - {about}

USAGE:
    {usage}

OPTIONS:
    {all-args}
",
)]
struct Cli {
    #[arg(
        short,
        long,
        global = true,
        default_value = ".",
        help = "Path to the depot root"
    )]
    depot: PathBuf,

    #[arg(
        short,
        long,
        global = true,
        default_value = "default",
        help = "Repository name"
    )]
    repo: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(
        name = "init",
        about = "Initialize the depot layout and a default repository config",
        long_about = "This command creates the depot directory layout, records the trigger \
        protocol version and writes a default repository config. Re-running it keeps an \
        existing config untouched."
    )]
    Init {
        #[arg(
            long,
            default_value = "imported repository",
            help = "Description stored in the new config"
        )]
        description: String,
    },
    #[command(
        name = "validate-config",
        about = "Parse and cross-validate the repository config",
        long_about = "This command loads the repository's branch-mapping config and reports \
        conflicts between mapping entries without touching the store."
    )]
    ValidateConfig,
    #[command(
        name = "push",
        about = "Land a push bundle on a branch",
        long_about = "This command reads a push bundle, translates its commits into depot \
        changelists under the repository lock, and lands them atomically."
    )]
    Push {
        #[arg(short, long, help = "Target branch name")]
        branch: String,
        #[arg(long, help = "Path to the push bundle file")]
        bundle: PathBuf,
        #[arg(long, help = "Identity of the pushing user")]
        pusher: String,
    },
    #[command(
        name = "fetch",
        about = "Reconstruct a branch from the depot as a bundle stream",
        long_about = "This command walks the branch's submitted changelists and writes the \
        reconstructed commit sequence as a bundle stream to stdout or a file."
    )]
    Fetch {
        #[arg(short, long, help = "Branch name to reconstruct")]
        branch: String,
        #[arg(short, long, help = "Write the bundle here instead of stdout")]
        output: Option<PathBuf>,
    },
    #[command(
        name = "reap",
        about = "Clear the repository lock if its holder is dead",
        long_about = "This command checks the repository lock holder for liveness and \
        force-releases the lock when the holder is confirmed dead. Live holders are \
        left alone."
    )]
    Reap,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // overrides apply before anything reads the environment
    environment::apply_overrides(&cli.depot.join("environment"))?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let gateway = Gateway::new(cli.depot.clone(), &cli.repo);

    match &cli.command {
        Commands::Init { description } => {
            gateway.init(description)?;
            println!(
                "{}",
                format!("Initialized repository '{}'", cli.repo).green()
            );
        }
        Commands::ValidateConfig => {
            let mapping = gateway.validate_config()?;
            println!(
                "{}",
                format!(
                    "Config is valid: {} branch mapping(s)",
                    mapping.entries().len()
                )
                .green()
            );
            for entry in mapping.entries() {
                println!("  [{}] -> {}", entry.section, entry.git_branch_name);
            }
        }
        Commands::Push {
            branch,
            bundle,
            pusher,
        } => {
            let raw = std::fs::read(bundle)?;
            let report = gateway.push(branch, &raw, pusher)?;
            if report.lock_stolen {
                println!("{}", "Cleared a lock left by a dead holder".yellow());
            }
            println!(
                "{}",
                format!(
                    "Pushed {} commit(s) to '{}' as changelist(s) {:?}",
                    report.commits, report.branch, report.changes
                )
                .green()
            );
        }
        Commands::Fetch { branch, output } => {
            let bundle = gateway.fetch(branch)?;
            match output {
                Some(path) => std::fs::write(path, &bundle)?,
                None => std::io::stdout().write_all(&bundle)?,
            }
        }
        Commands::Reap => {
            if gateway.reap()? {
                println!("{}", "Reaped an abandoned repository lock".yellow());
            } else {
                println!("{}", "No abandoned lock to reap".green());
            }
        }
    }

    Ok(())
}
