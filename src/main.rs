use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use intakeflow::IntakeError;
use intakeflow::cli::commands::{config, document, init, session, stage};
use intakeflow::types::Stage;

#[derive(Parser)]
#[command(name = "intakeflow")]
#[command(
    version,
    about = "Turn project intake documents into AI-generated feasibility reports"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long)]
    verbose: bool,

    #[arg(long, short)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize intakeflow in the current directory
    Init {
        #[arg(long, short, help = "Overwrite existing configuration")]
        force: bool,
    },

    /// Manage intake sessions
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },

    /// Manage session documents
    Document {
        #[command(subcommand)]
        action: DocumentAction,
    },

    /// Analyze uploaded documents
    Analyze {
        session: String,
        #[arg(long, short, help = "Analyze a single document")]
        document: Option<String>,
    },

    /// Generate clarifying questions from the document analyses
    Questions {
        session: String,
        #[arg(short = 'f', long, default_value = "text", help = "Output format: text, json")]
        format: String,
    },

    /// Generate the feasibility report
    Report {
        session: String,
        #[arg(short = 'f', long, default_value = "markdown", help = "Output format: markdown, json")]
        format: String,
        #[arg(long, short, help = "Write the report to a file")]
        output: Option<PathBuf>,
    },

    /// Run every stage in order
    Run {
        session: String,
        #[arg(short = 'f', long, default_value = "markdown", help = "Output format: markdown, json")]
        format: String,
        #[arg(long, short, help = "Write the report to a file")]
        output: Option<PathBuf>,
    },

    /// Show stage progress
    Progress {
        session: String,
        #[arg(short = 'f', long, default_value = "text", help = "Output format: text, json")]
        format: String,
    },

    /// Clear failed attempts of a stage so it can run again
    Reset {
        session: String,
        #[arg(help = "document_analysis, question_generation or report_generation")]
        stage: Stage,
        #[arg(long, short, help = "Only reset one document's analysis")]
        document: Option<String>,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum SessionAction {
    /// Create a new session
    Create {
        #[arg(long, help = "Session id (default: random UUID)")]
        id: Option<String>,
    },
    /// Show session status, documents and stage records
    Show {
        session: String,
        #[arg(short = 'f', long, default_value = "text", help = "Output format: text, json")]
        format: String,
    },
}

#[derive(Subcommand)]
enum DocumentAction {
    /// Add text documents to a session
    Add {
        session: String,
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration (merged from all sources)
    Show {
        #[arg(short = 'f', long, default_value = "text", help = "Output format: text, json")]
        format: String,
    },
    /// Show configuration file paths
    Path,
}

/// Set up panic handler for graceful error reporting
fn setup_panic_handler() {
    let default_hook = std::panic::take_hook();

    std::panic::set_hook(Box::new(move |panic_info| {
        let message = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "Unknown panic".to_string()
        };

        eprintln!("\n\x1b[1;31m━━━ PANIC ━━━\x1b[0m");
        eprintln!("\x1b[31mintakeflow encountered an unexpected error:\x1b[0m");
        eprintln!("  {}", message);

        if let Some(location) = panic_info.location() {
            eprintln!(
                "\x1b[90mLocation: {}:{}:{}\x1b[0m",
                location.file(),
                location.line(),
                location.column()
            );
        }
        eprintln!();

        // Backtrace when RUST_BACKTRACE=1
        default_hook(panic_info);
    }));
}

fn main() -> ExitCode {
    setup_panic_handler();

    match run_cli() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            match e.downcast_ref::<IntakeError>() {
                Some(err) => {
                    eprintln!("\x1b[31mError:\x1b[0m {}", err);
                    eprintln!("  {}", err.user_message());
                }
                None => eprintln!("\x1b[31mError:\x1b[0m {}", e),
            }
            ExitCode::FAILURE
        }
    }
}

fn run_cli() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match cli.command {
        Commands::Init { force } => init::run(force)?,
        Commands::Session { action } => match action {
            SessionAction::Create { id } => session::create(id)?,
            SessionAction::Show { session, format } => session::show(&session, &format)?,
        },
        Commands::Document { action } => match action {
            DocumentAction::Add { session, files } => document::add(&session, &files)?,
        },
        Commands::Analyze { session, document } => stage::analyze(&session, document.as_deref())?,
        Commands::Questions { session, format } => stage::questions(&session, &format)?,
        Commands::Report {
            session,
            format,
            output,
        } => stage::report(&session, &format, output.as_deref())?,
        Commands::Run {
            session,
            format,
            output,
        } => stage::run(&session, &format, output.as_deref())?,
        Commands::Progress { session, format } => stage::progress(&session, &format)?,
        Commands::Reset {
            session,
            stage: target,
            document,
        } => stage::reset(&session, target, document.as_deref())?,
        Commands::Config { action } => match action {
            ConfigAction::Show { format } => config::show(&format)?,
            ConfigAction::Path => config::path()?,
        },
    }

    Ok(())
}
