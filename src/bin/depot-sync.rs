use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};

use depot::client::walker::TRACKING_DIR;
use depot::client::{upload_project_tree, Backoff, LocalProject, ProjectDb, ServerApi};
use depot::config::ClientConfig;

/// Upload a project tree to the depot server.
#[derive(Debug, Parser)]
#[command(name = "depot-sync")]
struct Options {
    /// Project name (the first segment of every server-side path)
    #[arg(long)]
    project: String,

    /// Project id on the server
    #[arg(long)]
    project_id: String,

    /// Root of the local tree to upload
    #[arg(long)]
    dir: String,

    /// Number of parallel upload workers
    #[arg(long, default_value_t = 4)]
    threads: usize,

    /// Cap on network retries per request (unbounded when omitted)
    #[arg(long)]
    max_retries: Option<u32>,
}

#[tokio::main]
async fn main() {
    let opts = match Options::try_parse() {
        Ok(opts) => opts,
        Err(err) => {
            let _ = err.print();
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
                .parse_lossy("depot=info,sqlx=warn,hyper=warn"),
        )
        .init();

    let mut config = match ClientConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!("bad configuration: {}", err);
            std::process::exit(1);
        }
    };
    config.num_threads = opts.threads;
    config.max_retries = opts.max_retries;

    if let Err(err) = run(opts, config).await {
        error!("sync failed: {}", err);
        std::process::exit(1);
    }
}

async fn run(opts: Options, config: ClientConfig) -> Result<(), Box<dyn std::error::Error>> {
    let root = std::path::Path::new(&opts.dir).canonicalize()?;

    let tracking_dir = root.join(TRACKING_DIR);
    std::fs::create_dir_all(&tracking_dir)?;
    let db = ProjectDb::new(&tracking_dir.join("project.db").to_string_lossy()).await?;
    db.set_project(&LocalProject {
        project_id: opts.project_id.clone(),
        name: opts.project.clone(),
        path: root.to_string_lossy().to_string(),
    })
    .await?;

    let api = ServerApi::new(&config);
    let backoff = Backoff::from_config(&config);

    // Ctrl-C flips the done signal; workers stop after their current
    // entry instead of mid-chunk.
    let (done_tx, done_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, finishing current entries");
            let _ = done_tx.send(true);
        }
    });

    let summary =
        upload_project_tree(db, api, backoff, config.num_threads, done_rx).await?;
    info!(
        uploaded = summary.files_uploaded,
        skipped = summary.files_skipped,
        directories = summary.dirs_registered,
        "sync finished"
    );

    Ok(())
}
