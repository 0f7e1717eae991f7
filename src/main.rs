use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};

use depot::catalog::Catalog;
use depot::config::ServerConfig;
use depot::server::{self, AppState};
use depot::uploads::RequestPath;

/// Storage daemon for chunked, resumable uploads.
#[derive(Debug, Parser)]
#[command(name = "depot", disable_help_subcommand = true)]
struct Options {
    /// Directory path to the file storage root
    #[arg(long)]
    mcdir: Option<String>,

    /// Prints the server pid to stdout
    #[arg(long)]
    print_pid: bool,

    /// Port the webserver listens on
    #[arg(long, default_value_t = 5010)]
    http_port: u16,

    /// The database connection string
    #[arg(long)]
    db_connect: Option<String>,

    /// Database to use
    #[arg(long)]
    db: Option<String>,

    /// The type of database to connect to
    #[arg(long)]
    db_type: Option<String>,
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
                .parse_lossy("depot=info,sqlx=warn,hyper=warn,tower_http=warn"),
        )
        .init();

    if opts.print_pid {
        println!("{}", std::process::id());
    }

    setup_config(&opts);

    let config = match ServerConfig::from_env() {
        Ok(mut config) => {
            config.http_port = opts.http_port;
            config
        }
        Err(err) => {
            error!("bad configuration: {}", err);
            std::process::exit(1);
        }
    };

    if let Err(err) = serve(config).await {
        error!("server failed: {}", err);
        std::process::exit(1);
    }
}

/// Push command-line overrides into the environment so configuration has
/// a single source of truth.
fn setup_config(opts: &Options) {
    if let Some(connect) = &opts.db_connect {
        std::env::set_var("MCDB_CONNECTION", connect);
    }
    if let Some(name) = &opts.db {
        std::env::set_var("MCDB_NAME", name);
    }
    if let Some(db_type) = &opts.db_type {
        std::env::set_var("MCDB_TYPE", db_type);
    }
    if let Some(mcdir) = &opts.mcdir {
        std::env::set_var("MCDIR", mcdir);
    }
}

async fn serve(config: ServerConfig) -> depot::Result<()> {
    tokio::fs::create_dir_all(config.mcdir.join("upload")).await?;

    let db_path = config.database_path();
    if let Some(parent) = db_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let catalog = Catalog::new(&db_path.to_string_lossy()).await?;

    let state = AppState::new(catalog.clone(), RequestPath::new(config.mcdir.clone()));

    if config.monitor_users {
        let cache: Arc<server::ApiKeyCache> = state.key_cache.clone();
        tokio::spawn(server::monitor_users(
            catalog,
            cache,
            Duration::from_secs(30),
        ));
    }

    let app = server::router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    info!("listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
