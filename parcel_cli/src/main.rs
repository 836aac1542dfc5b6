use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;

use parcel_core::client::HttpClient;

mod terminal_observer;
use terminal_observer::TerminalProgressObserver;

#[derive(Parser)]
#[command(name = "parcel", about = "Parallel resumable downloader for authenticated data servers")]
struct Args {
    /// Identifiers of the files to download
    #[arg(required = true)]
    file_ids: Vec<String>,

    /// Data server base URI
    #[arg(short = 'u', long)]
    uri: String,

    /// Authentication token string
    #[arg(short, long)]
    token: Option<String>,

    /// Read the authentication token from a file
    #[arg(long, conflicts_with = "token")]
    token_file: Option<PathBuf>,

    /// Number of concurrent download workers per file
    #[arg(short = 'n', long, default_value_t = 8)]
    n_processes: usize,

    /// Directory to download files to
    #[arg(short, long, default_value = ".")]
    dir: PathBuf,

    /// Record and verify per-segment md5 checksums
    #[arg(long)]
    segment_md5sums: bool,

    /// Also download files related to each given id
    #[arg(long)]
    related_files: bool,

    /// Also download annotations for each given id
    #[arg(long)]
    annotations: bool,

    /// Bytes streamed per HTTP chunk
    #[arg(long, default_value_t = 1024 * 1024)]
    http_chunk_size: usize,

    /// Bytes of completed work between state saves
    #[arg(long, default_value_t = 1_000_000)]
    save_interval: u64,

    /// Abort the whole batch on the first error
    #[arg(long)]
    debug: bool,
}

fn resolve_token(args: &Args) -> Result<String, String> {
    if let Some(token) = &args.token {
        return Ok(token.clone());
    }
    if let Some(path) = &args.token_file {
        return std::fs::read_to_string(path)
            .map(|s| s.trim().to_string())
            .map_err(|e| format!("unable to read token file {}: {}", path.display(), e));
    }
    Err("no token given; pass --token or --token-file".to_string())
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let args = Args::parse();

    let token = match resolve_token(&args) {
        Ok(token) => token,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(2);
        }
    };

    let built = HttpClient::builder(args.uri.clone(), token)
        .with_worker_count(args.n_processes)
        .with_directory(args.dir.clone())
        .with_debug(args.debug)
        .with_http_chunk_size(args.http_chunk_size)
        .with_save_interval(args.save_interval)
        .with_segment_md5sums(args.segment_md5sums)
        .with_download_related_files(args.related_files)
        .with_download_annotations(args.annotations)
        .build();
    let mut client = match built {
        Ok(client) => client,
        Err(e) => {
            eprintln!("unable to construct client: {}", e);
            std::process::exit(2);
        }
    };

    client.add_observer(Arc::new(TerminalProgressObserver::new()));

    // ctrl-c flips the cancellation token; the engine saves its state on
    // the way out so the download resumes where it stopped
    let cancel = client.cancel_token().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let started = Instant::now();
    let report = client.download(args.file_ids).await;
    println!(
        "{} downloaded, {} failed in {:.2}s",
        report.downloaded.len(),
        report.errors.len(),
        started.elapsed().as_secs_f64()
    );
    for (file_id, reason) in &report.errors {
        eprintln!("{}: {}", file_id, reason);
    }
    if !report.errors.is_empty() {
        std::process::exit(1);
    }
}
