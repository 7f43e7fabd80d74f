use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use docker_pull::oci::{BlobCache, Credentials, Platform};
use docker_pull::{import_tar, Error, PullOptions, PullReport, Puller, DEFAULT_CACHE_DIR};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// Pull a container image from a registry into a `docker load` archive.
#[derive(Parser, Debug)]
#[command(name = "docker-pull", version, about)]
struct Cli {
    /// Image reference, e.g. `alpine:3.20` or `ghcr.io/org/app@sha256:...`
    #[arg(required_unless_present = "import_tar")]
    image: Option<String>,

    /// Platform to pull from a multi-platform image (`os/arch[/variant]`)
    #[arg(long)]
    platform: Option<Platform>,

    /// Number of layers downloaded in parallel
    #[arg(long, default_value_t = 3, value_parser = clap::value_parser!(u16).range(1..))]
    max_concurrent_downloads: u16,

    /// Registry username
    #[arg(long, env = "DOCKER_PULL_USERNAME", requires = "password")]
    username: Option<String>,

    /// Registry password
    #[arg(long, env = "DOCKER_PULL_PASSWORD", hide_env_values = true, requires = "username")]
    password: Option<String>,

    /// Layer cache directory; must be on the same filesystem as the output
    #[arg(long, env = "DOCKER_PULL_CACHE_DIR", default_value = DEFAULT_CACHE_DIR)]
    cache_dir: PathBuf,

    /// Neither read nor populate the layer cache
    #[arg(long)]
    no_cache: bool,

    /// Import the layers of an existing archive into the cache and exit
    #[arg(long, value_name = "PATH", conflicts_with = "image")]
    import_tar: Option<PathBuf>,

    /// Directory the archive is written to
    #[arg(long, default_value = ".")]
    output_dir: PathBuf,

    /// Accept invalid TLS certificates from the registry
    #[arg(long)]
    insecure: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping");
            on_signal.cancel();
        }
    });

    if let Some(archive) = &cli.import_tar {
        return cmd_import(archive, &cli.cache_dir).await;
    }
    cmd_pull(cli, cancel).await
}

async fn cmd_import(archive: &std::path::Path, cache_dir: &std::path::Path) -> ExitCode {
    let cache = BlobCache::new(cache_dir.to_path_buf());
    match import_tar(archive, &cache).await {
        Ok(report) => {
            println!(
                "imported {} layer(s) ({}), skipped {} already cached",
                report.imported,
                format_bytes(report.bytes),
                report.skipped
            );
            if report.missing > 0 || report.failed > 0 {
                println!(
                    "{} layer(s) missing from the archive, {} failed to import",
                    report.missing, report.failed
                );
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn cmd_pull(cli: Cli, cancel: CancellationToken) -> ExitCode {
    let Some(image) = cli.image else {
        error!("an image reference is required");
        return ExitCode::FAILURE;
    };

    let credentials = match (cli.username, cli.password) {
        (Some(user), Some(pass)) => Some(Credentials::new(user, pass)),
        _ => None,
    };
    let options = PullOptions {
        platform: cli.platform,
        max_concurrent_downloads: usize::from(cli.max_concurrent_downloads),
        credentials,
        cache_dir: cli.cache_dir,
        use_cache: !cli.no_cache,
        output_dir: cli.output_dir,
        insecure_tls: cli.insecure,
        show_progress: std::io::stderr().is_terminal(),
        ..PullOptions::default()
    };

    let puller = Puller::new(options, cancel);
    match puller.pull(&image).await {
        Ok(report) => {
            print_summary(&report);
            ExitCode::SUCCESS
        }
        Err(e) if e.is_cancelled() => {
            println!("pull cancelled, nothing written");
            ExitCode::SUCCESS
        }
        Err(Error::PlatformRequired { available }) => {
            println!("Multi-platform image; choose one with --platform:");
            for desc in &available {
                println!("    Platform: {}, digest: {}", desc.effective_platform(), desc.digest);
            }
            ExitCode::FAILURE
        }
        Err(Error::Oci(docker_pull::oci::OciError::PlatformNotFound { requested, available })) => {
            error!("no manifest found for platform {}", requested);
            println!("Available platforms:");
            for p in &available {
                println!("    - {}", p);
            }
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn print_summary(report: &PullReport) {
    let stats = &report.stats;
    println!("Docker image pulled: {}", report.archive.display());
    println!(
        "  {} ({} manifest), {} layer(s)",
        report.image.repo_tag(),
        report.manifest_kind,
        stats.layers
    );
    if let Some(id) = report.image_id() {
        println!("  image id: {}", id);
    }
    println!(
        "  cache: {} hit(s), {} miss(es), {} stored",
        stats.cache_hits, stats.cache_misses, stats.cache_stored
    );
    println!(
        "  downloaded {}, reused {} in {}",
        format_bytes(stats.bytes_downloaded),
        format_bytes(stats.bytes_from_cache),
        humantime::format_duration(std::time::Duration::from_millis(
            report.elapsed.as_millis() as u64
        ))
    );
}

fn format_bytes(bytes: u64) -> String {
    indicatif::BinaryBytes(bytes).to_string()
}
