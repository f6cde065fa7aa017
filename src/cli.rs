//! Command-line interface definitions using clap.

use clap::Parser;

/// Run a shell command once per item, in parallel.
///
/// Items come from `-a/--arg`, or else from the lines of stdin. `{}` in
/// the command is replaced by the (quoted) item; without `{}` the item is
/// appended. Use `--` before a command that starts with a dash.
#[derive(Parser, Debug)]
#[command(name = "parx")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Command template, run through the shell for every item.
    #[arg(required = true, value_name = "TEMPLATE")]
    pub template: Vec<String>,

    /// Item to run the command for (repeatable). Reads stdin when absent.
    #[arg(short = 'a', long = "arg", value_name = "ARG")]
    pub args: Vec<String>,

    /// Number of parallel jobs (0 runs the items one by one, in place).
    #[arg(short, long, env = "PARX_JOBS", default_value_t = num_cpus())]
    pub jobs: usize,

    /// Run jobs inside worker processes instead of threads.
    #[arg(long)]
    pub processes: bool,

    /// Start a fresh worker process for every item.
    #[arg(long, requires = "processes")]
    pub isolation: bool,

    /// Print job output in input order.
    #[arg(short = 'k', long)]
    pub keep_order: bool,

    /// Print all results as a JSON array once every job is done.
    #[arg(long, conflicts_with = "keep_order")]
    pub json: bool,

    /// A job exiting with this code stops dispatching new jobs.
    #[arg(long, value_name = "CODE")]
    pub halt_on_exit: Option<i32>,

    /// A job exiting with this code kills every running job.
    #[arg(long, value_name = "CODE")]
    pub kill_on_exit: Option<i32>,

    /// Show a progress bar (needs `-a` items).
    #[arg(long)]
    pub progress: bool,

    /// Shell used to run the command.
    #[arg(long, env = "PARX_SHELL", default_value = "sh")]
    pub shell: String,

    /// Enable verbose output (-v for info, -vv for debug, -vvv for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress all output except errors.
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Disable colored output.
    #[arg(long, env = "NO_COLOR")]
    pub no_color: bool,
}

impl Cli {
    /// Whether job stdout must be captured rather than passed through.
    pub fn captures(&self) -> bool {
        self.keep_order || self.json
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_template_and_args() {
        let cli =
            Cli::try_parse_from(["parx", "-j", "3", "-a", "x", "-a", "y z", "echo", "{}"]).unwrap();
        assert_eq!(cli.template, vec!["echo", "{}"]);
        assert_eq!(cli.args, vec!["x", "y z"]);
        assert_eq!(cli.jobs, 3);
        assert_eq!(cli.shell, "sh");
        assert!(!cli.captures());
    }

    #[test]
    fn test_template_with_dashes_after_separator() {
        let cli = Cli::try_parse_from(["parx", "-a", "1", "--", "echo", "-n", "{}"]).unwrap();
        assert_eq!(cli.template, vec!["echo", "-n", "{}"]);
    }

    #[test]
    fn test_template_is_required() {
        assert!(Cli::try_parse_from(["parx", "-a", "1"]).is_err());
    }

    #[test]
    fn test_exit_code_options() {
        let cli = Cli::try_parse_from([
            "parx",
            "--halt-on-exit",
            "3",
            "--kill-on-exit",
            "4",
            "exit",
        ])
        .unwrap();
        assert_eq!(cli.halt_on_exit, Some(3));
        assert_eq!(cli.kill_on_exit, Some(4));
    }

    #[test]
    fn test_isolation_requires_processes() {
        assert!(Cli::try_parse_from(["parx", "--isolation", "true"]).is_err());
        let cli = Cli::try_parse_from(["parx", "--processes", "--isolation", "true"]).unwrap();
        assert!(cli.isolation);
    }

    #[test]
    fn test_json_conflicts_with_keep_order() {
        assert!(Cli::try_parse_from(["parx", "--json", "-k", "true"]).is_err());
        let cli = Cli::try_parse_from(["parx", "-k", "true"]).unwrap();
        assert!(cli.captures());
    }

    #[test]
    fn test_quiet_conflicts_with_verbose() {
        assert!(Cli::try_parse_from(["parx", "-v", "-q", "true"]).is_err());
        let cli = Cli::try_parse_from(["parx", "-vv", "true"]).unwrap();
        assert_eq!(cli.verbose, 2);
    }
}
