use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use revpool::config::{
    parse_duration, ArtifactConfig, Isolation, RetryPolicy, RunConfig, WorkspaceConfig,
    DEFAULT_MAX_ATTEMPTS,
};
use revpool::error::RevpoolError;
use revpool::orchestrator::{Orchestrator, RunReport};
use revpool::results::{RunResult, RunSummary};
use revpool::scheduler::parse_id_list;
use revpool::shutdown::install_shutdown_handler;
use revpool::worker::CommandTemplate;

#[derive(Parser, Debug)]
#[command(name = "revpool")]
#[command(version)]
#[command(about = "Run a long-running analysis command once per revision, in parallel")]
#[command(after_help = "\
Examples:
  # One review per SHA listed in shas.txt, 4 at a time
  revpool -n 4 -c './review_one.sh' -f shas.txt

  # With a per-attempt timeout and a series base
  revpool -c 'claude -p \"Review commit {id}\"' -f shas.txt --timeout 30m --series abc123")]
struct Args {
    /// Command template. `{id}` and `{workspace}` are bound as quoted shell
    /// parameters (`"${1}"`, `"${2}"`), so ids are never word-split or
    /// globbed; without `{id}` the id is appended as the last argument.
    #[arg(short = 'c', long)]
    command: String,

    /// File with one identifier per line (blank lines and `#` comments ignored)
    #[arg(short = 'f', long = "id-file", alias = "sha-file")]
    id_file: PathBuf,

    /// Number of jobs to run concurrently
    #[arg(short = 'n', long, env = "REVPOOL_PARALLEL", default_value_t = revpool::config::DEFAULT_PARALLELISM)]
    parallel: usize,

    /// Per-attempt timeout (e.g. 300, 90s, 30m, 1h)
    #[arg(long, value_parser = parse_duration)]
    timeout: Option<Duration>,

    /// Attempts per job before it is marked failed
    #[arg(long, default_value_t = DEFAULT_MAX_ATTEMPTS)]
    max_attempts: u32,

    /// Delay before a failed attempt is retried
    #[arg(long, value_parser = parse_duration, default_value = "0")]
    retry_backoff: Duration,

    /// Time in-flight commands get to exit after Ctrl-C before being killed
    #[arg(long, value_parser = parse_duration, default_value = "5s")]
    grace: Duration,

    /// Time a timed-out command gets between SIGTERM and SIGKILL
    #[arg(long, value_parser = parse_duration, default_value = "1s")]
    kill_grace: Duration,

    /// Last commit of the series, forwarded as `--series <ID>`
    #[arg(long)]
    series: Option<String>,

    /// Text forwarded as `--append <TEXT>`
    #[arg(long)]
    append: Option<String>,

    /// Directory under which job workspaces are created
    #[arg(long, env = "REVPOOL_WORKDIR", default_value = ".")]
    workdir: PathBuf,

    /// Create each workspace as a detached git worktree of this repository
    #[arg(long)]
    git_repo: Option<PathBuf>,

    /// Shared read-only database linked into every workspace
    #[arg(long)]
    side_db: Option<PathBuf>,

    /// Name of the side database link inside a workspace
    #[arg(long, default_value = ".side-db")]
    side_db_name: String,

    /// Report file the command writes into its workspace
    #[arg(long, default_value = "review-inline.txt")]
    report_name: String,

    /// Print captured stderr of failed and retried jobs
    #[arg(short, long)]
    verbose: bool,

    /// Print a per-job listing after the summary
    #[arg(long)]
    details: bool,

    /// Output format for the summary
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Serialize)]
struct JsonReport<'a> {
    summary: &'a RunSummary,
    cancelled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    jobs: Option<Vec<RunResult>>,
}

impl Args {
    fn run_config(&self) -> RunConfig {
        let isolation = match &self.git_repo {
            Some(repo) => Isolation::GitWorktree { repo: repo.clone() },
            None => Isolation::Directory,
        };

        RunConfig {
            parallelism: self.parallel,
            retry: RetryPolicy {
                max_attempts: self.max_attempts,
                timeout: self.timeout,
                backoff: self.retry_backoff,
                kill_grace: self.kill_grace,
            },
            cancel_grace: self.grace,
            workspace: WorkspaceConfig {
                root: self.workdir.clone(),
                isolation,
                side_db: self.side_db.clone(),
                side_db_name: self.side_db_name.clone(),
                ..WorkspaceConfig::default()
            },
            artifacts: ArtifactConfig {
                report_file: self.report_name.clone(),
                ..ArtifactConfig::default()
            },
            verbose: self.verbose,
        }
    }

    fn command_template(&self) -> Result<CommandTemplate, RevpoolError> {
        let mut template = CommandTemplate::new(self.command.clone())?;
        if let Some(series) = &self.series {
            template = template.with_flag("--series", series.clone());
        }
        if let Some(append) = &self.append {
            template = template.with_flag("--append", append.clone());
        }
        Ok(template)
    }
}

async fn run(args: Args) -> Result<RunReport, RevpoolError> {
    let text = tokio::fs::read_to_string(&args.id_file).await.map_err(|e| {
        RevpoolError::Configuration(format!("cannot read {}: {}", args.id_file.display(), e))
    })?;
    let ids = parse_id_list(&text);
    if ids.is_empty() {
        return Err(RevpoolError::Configuration(format!(
            "no identifiers found in {}",
            args.id_file.display()
        )));
    }
    tracing::info!(count = ids.len(), file = %args.id_file.display(), "Loaded identifiers");

    let orchestrator = Orchestrator::new(args.run_config(), args.command_template()?);
    let _signals = install_shutdown_handler(orchestrator.cancellation())?;

    orchestrator.run(&ids).await
}

fn print_report(report: &RunReport, output: &OutputFormat, details: bool, verbose: bool) {
    match output {
        OutputFormat::Json => {
            let json = JsonReport {
                summary: &report.summary,
                cancelled: report.cancelled,
                jobs: details.then(|| report.aggregator.results()),
            };
            match serde_json::to_string_pretty(&json) {
                Ok(text) => println!("{}", text),
                Err(e) => eprintln!("Error: cannot serialize report: {}", e),
            }
        }
        OutputFormat::Table => {
            if details || verbose {
                print!("{}", report.aggregator.render_details(verbose));
                println!();
            }
            println!("{}", report.summary);
            if report.cancelled {
                println!("Run was interrupted.");
            }
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let output = args.output.clone();
    let details = args.details;
    let verbose = args.verbose;

    match run(args).await {
        Ok(report) => {
            print_report(&report, &output, details, verbose);
            ExitCode::from(report.exit_code())
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            if e.is_fatal() {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}
