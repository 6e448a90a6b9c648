use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tracing::instrument;

#[derive(Parser, Clone)]
#[command(
    name = "fmirror",
    version,
    about = "Mirror a file tree from one HTTP storage endpoint to another",
    long_about = "`fmirror` copies a directory tree between storage servers speaking WebDAV (under \
`{base}/dav`) or a JSON file API (under `{base}/api`).

In the default incremental mode files are skipped when they are unchanged since the previous \
run of the same job, or when they already exist on the target. The per-job sync state is kept \
as a JSON file in --state-dir.

EXAMPLE:
    # Mirror /photos into /backup/photos, logging in on both sides
    fmirror https://src.example.com https://dst.example.com \\
        --source-path /photos --target-path /backup/photos \\
        --source-user alice --target-user backup --progress --summary"
)]
struct Args {
    // Source
    /// Protocol spoken by the source, `auto` probes WebDAV first and then the JSON API
    #[arg(long, value_enum, default_value_t, value_name = "PROTOCOL", help_heading = "Source")]
    source_protocol: remote::ProtocolChoice,

    /// Directory on the source to mirror
    #[arg(long, default_value = "/", value_name = "PATH", help_heading = "Source")]
    source_path: String,

    #[arg(long, env = "FMIRROR_SOURCE_USER", value_name = "USER", help_heading = "Source")]
    source_user: Option<String>,

    #[arg(
        long,
        env = "FMIRROR_SOURCE_PASSWORD",
        hide_env_values = true,
        value_name = "PASSWORD",
        help_heading = "Source"
    )]
    source_password: Option<String>,

    /// Pre-issued JSON API token, used instead of logging in
    #[arg(
        long,
        env = "FMIRROR_SOURCE_TOKEN",
        hide_env_values = true,
        value_name = "TOKEN",
        help_heading = "Source"
    )]
    source_token: Option<String>,

    // Target
    /// Protocol spoken by the target, `auto` writes through WebDAV and switches to the JSON API
    /// when WebDAV turns out to be unusable
    #[arg(long, value_enum, default_value_t, value_name = "PROTOCOL", help_heading = "Target")]
    target_protocol: remote::ProtocolChoice,

    /// Directory on the target receiving the tree
    #[arg(long, default_value = "/", value_name = "PATH", help_heading = "Target")]
    target_path: String,

    #[arg(long, env = "FMIRROR_TARGET_USER", value_name = "USER", help_heading = "Target")]
    target_user: Option<String>,

    #[arg(
        long,
        env = "FMIRROR_TARGET_PASSWORD",
        hide_env_values = true,
        value_name = "PASSWORD",
        help_heading = "Target"
    )]
    target_password: Option<String>,

    /// Pre-issued JSON API token, used instead of logging in
    #[arg(
        long,
        env = "FMIRROR_TARGET_TOKEN",
        hide_env_values = true,
        value_name = "TOKEN",
        help_heading = "Target"
    )]
    target_token: Option<String>,

    /// Place the tree under a directory named after the source host
    #[arg(long, help_heading = "Target")]
    nest_by_host: bool,

    // Sync options
    #[arg(long, value_enum, default_value_t, value_name = "MODE", help_heading = "Sync options")]
    mode: common::SyncMode,

    /// Name of the job, used for locking and to find the previous run's state
    ///
    /// Defaults to a key derived from the source and target locations.
    #[arg(long, value_name = "KEY", help_heading = "Sync options")]
    job_key: Option<String>,

    /// Directory holding the per-job sync state
    #[arg(long, default_value = ".fmirror", value_name = "PATH", help_heading = "Sync options")]
    state_dir: std::path::PathBuf,

    /// Stop scanning after this many files, 0 means no limit
    #[arg(long, default_value = "0", value_name = "N", help_heading = "Sync options")]
    max_files: usize,

    /// Number of retries per file after the first attempt
    #[arg(long, default_value_t = common::mirror::DEFAULT_RETRIES, value_name = "N", help_heading = "Sync options")]
    retries: usize,

    /// Base delay between retries, doubled on every attempt
    ///
    /// This option accepts a human readable duration, e.g. "500ms", "1s", "2min" etc.
    #[arg(long, default_value = "1s", value_parser = humantime::parse_duration, value_name = "DELAY", help_heading = "Sync options")]
    retry_delay: std::time::Duration,

    // Progress & output
    /// Show progress
    #[arg(long, help_heading = "Progress & output")]
    progress: bool,

    /// Sets the delay between progress updates, default is 10s
    ///
    /// If specified, --progress flag is implied.
    ///
    /// This option accepts a human readable duration, e.g. "200ms", "10s", "5min" etc.
    #[arg(long, value_parser = humantime::parse_duration, value_name = "DELAY", help_heading = "Progress & output")]
    progress_delay: Option<std::time::Duration>,

    /// Verbose level (implies "summary"): -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Progress & output")]
    verbose: u8,

    /// Print summary at the end
    #[arg(long, help_heading = "Progress & output")]
    summary: bool,

    /// Quiet mode, don't report errors
    #[arg(short = 'q', long = "quiet", help_heading = "Progress & output")]
    quiet: bool,

    // Performance & throttling
    /// Number of files transferred in parallel when the job starts
    #[arg(long, default_value_t = common::mirror::DEFAULT_INITIAL_CONCURRENCY, value_name = "N", help_heading = "Performance & throttling")]
    concurrency: usize,

    /// Upper bound for the adaptive number of parallel transfers
    #[arg(long, default_value_t = common::mirror::DEFAULT_MAX_CONCURRENCY, value_name = "N", help_heading = "Performance & throttling")]
    max_concurrency: usize,

    /// Number of directory listings in flight while scanning
    #[arg(long, default_value_t = common::scan::DEFAULT_LIST_CONCURRENCY, value_name = "N", help_heading = "Performance & throttling")]
    list_concurrency: usize,

    /// Maximum number of transfers running at once across all jobs, 0 means no limit
    #[arg(long, default_value_t = throttle::DEFAULT_MAX_TRANSFERS, value_name = "N", help_heading = "Performance & throttling")]
    max_transfers: i64,

    /// Bandwidth cap per transfer, e.g. "2MiB" (per second); disables adaptive concurrency
    #[arg(long, value_name = "SIZE", help_heading = "Performance & throttling")]
    rate_limit: Option<bytesize::ByteSize>,

    /// Files of at least this size are downloaded to a local temporary file before uploading,
    /// 0 disables spooling
    #[arg(long, default_value = "200MiB", value_name = "SIZE", help_heading = "Performance & throttling")]
    spool_threshold: bytesize::ByteSize,

    /// Directory for spooled files, defaults to the system temporary directory
    #[arg(long, value_name = "PATH", help_heading = "Performance & throttling")]
    spool_dir: Option<std::path::PathBuf>,

    /// Timeout of metadata requests (listing, directory creation, existence checks)
    #[arg(long, default_value = "2min", value_parser = humantime::parse_duration, value_name = "DELAY", help_heading = "Performance & throttling")]
    timeout: std::time::Duration,

    /// Timeout of a single download or upload
    #[arg(long, default_value = "30min", value_parser = humantime::parse_duration, value_name = "DELAY", help_heading = "Performance & throttling")]
    transfer_timeout: std::time::Duration,

    // Advanced settings
    /// Number of worker threads, 0 means number of cores
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_workers: usize,

    /// Number of blocking worker threads, 0 means Tokio runtime default (512)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_blocking_threads: usize,

    // ARGUMENTS
    /// Base URL of the source server
    #[arg()]
    source_url: String,

    /// Base URL of the target server
    #[arg()]
    target_url: String,
}

impl Args {
    fn client_settings(
        &self,
        base_url: &str,
        user: &Option<String>,
        password: &Option<String>,
        token: &Option<String>,
    ) -> remote::ClientSettings {
        remote::ClientSettings {
            username: user.clone(),
            password: password.clone(),
            token: token.clone(),
            timeout: self.timeout,
            transfer_timeout: self.transfer_timeout,
            ..remote::ClientSettings::new(base_url)
        }
    }

    fn job_key(&self) -> String {
        self.job_key.clone().unwrap_or_else(|| {
            format!(
                "{}{} -> {}{}",
                self.source_url.trim_end_matches('/'),
                common::path::normalize(&self.source_path),
                self.target_url.trim_end_matches('/'),
                common::path::normalize(&self.target_path),
            )
        })
    }

    fn settings(&self) -> common::mirror::Settings {
        common::mirror::Settings {
            retries: self.retries,
            retry_base_delay: self.retry_delay,
            initial_concurrency: self.concurrency.max(1),
            max_concurrency: self.max_concurrency.max(self.concurrency).max(1),
            rate_limit: self
                .rate_limit
                .and_then(|rate| throttle::rate::ByteRate::new(rate.as_u64())),
            spool: common::spool::SpoolSettings {
                threshold: self.spool_threshold.as_u64(),
                dir: self.spool_dir.clone(),
            },
            scan: common::scan::Settings {
                list_concurrency: self.list_concurrency.max(1),
                max_files: self.max_files,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

#[instrument(skip_all)]
async fn async_main(args: Args) -> Result<common::JobReport> {
    let source_settings = args.client_settings(
        &args.source_url,
        &args.source_user,
        &args.source_password,
        &args.source_token,
    );
    let target_settings = args.client_settings(
        &args.target_url,
        &args.target_user,
        &args.target_password,
        &args.target_token,
    );
    let source = remote::select_source(args.source_protocol, &source_settings, &args.source_path)
        .await
        .with_context(|| format!("failed connecting to source {}", &args.source_url))?;
    let transports = remote::target_selection(args.target_protocol, &target_settings, source)
        .with_context(|| format!("failed connecting to target {}", &args.target_url))?;
    let host = if args.nest_by_host {
        Some(
            remote::host_of(&args.source_url)
                .ok_or_else(|| anyhow!("source URL {:?} has no host", &args.source_url))?,
        )
    } else {
        None
    };
    let job = common::JobSpec {
        key: args.job_key(),
        mode: args.mode,
        plan: common::scan::Plan::new(&args.source_path, &args.target_path).nested_under(host),
        transports,
    };
    let replicator = common::Replicator::new(
        std::sync::Arc::new(common::lock::JobLocks::new()),
        throttle::global_transfers(),
        common::state::StateStore::new(&args.state_dir),
        args.settings(),
        common::get_progress(),
    );
    let report = replicator.run(&job, None).await?;
    if report.fail > 0 {
        if args.summary {
            return Err(anyhow!("fmirror encountered errors\n\n{}", &report));
        }
        return Err(anyhow!("fmirror encountered errors"));
    }
    Ok(report)
}

fn main() -> Result<()> {
    let args = Args::parse();
    let func = {
        let args = args.clone();
        || async_main(args)
    };
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
        print_summary: args.summary,
    };
    let runtime = common::RuntimeConfig {
        max_workers: args.max_workers,
        max_blocking_threads: args.max_blocking_threads,
    };
    let throttle = common::ThrottleConfig {
        max_transfers: args.max_transfers,
    };
    let res = common::run(
        if args.progress || args.progress_delay.is_some() {
            Some(common::ProgressSettings {
                progress_delay: args.progress_delay,
            })
        } else {
            None
        },
        output,
        runtime,
        throttle,
        func,
    );
    if res.is_none() {
        std::process::exit(1);
    }
    Ok(())
}
