use anyhow::{Result, bail};
use chunked_upload::{
    client::{HttpTransport, TaskStatus, UploadSequencer, UploadTask},
    config::{AppConfig, RunMode, UploadArgs},
    db, routes,
    services::{reaper::run_reaper_loop, receiver_service::ReceiverService},
};
use std::{fs, io::ErrorKind, net::SocketAddr, path::Path, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + run mode ---
    let (cfg, mode) = AppConfig::from_env_and_args()?;

    match mode {
        RunMode::Upload(args) => upload(args).await,
        RunMode::Migrate => {
            let db = db::connect(&cfg.database_url).await?;
            db::run_migrations(&db).await?;
            tracing::info!("Database migration complete.");
            Ok(())
        }
        RunMode::Serve => serve(cfg).await,
    }
}

async fn serve(cfg: AppConfig) -> Result<()> {
    tracing::info!("Starting chunked-upload receiver with config: {:?}", cfg);

    // --- Ensure upload directory exists ---
    if !Path::new(&cfg.upload_dir).exists() {
        fs::create_dir_all(&cfg.upload_dir)?;
        tracing::info!("Created upload directory at {}", cfg.upload_dir);
    }

    // --- Initialize SQLite connection ---
    let db = Arc::new(db::connect(&cfg.database_url).await?);
    db::run_migrations(&db).await?;

    // --- Initialize core service + reaper ---
    let service = ReceiverService::new(db, cfg.upload_dir.clone());
    tokio::spawn(run_reaper_loop(
        service.clone(),
        cfg.reap_interval,
        cfg.staging_ttl,
    ));

    // --- Build router ---
    let app = routes::routes::app(service, cfg.body_limit, cfg.allowed_origin.as_deref());

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

async fn upload(args: UploadArgs) -> Result<()> {
    let transport = HttpTransport::new(args.server.clone());
    let mut sequencer = UploadSequencer::new(transport, args.sequencer_config());

    for path in &args.files {
        let task = UploadTask::from_path(path).await?;
        tracing::info!(file = %task.name, bytes = task.size, "queued");
        sequencer.enqueue(task);
    }
    sequencer.run().await;

    let mut failed = 0;
    for task in sequencer.tasks() {
        match &task.status {
            TaskStatus::Completed => println!(
                "{}\t{}",
                task.name,
                task.final_filename.as_deref().unwrap_or_default()
            ),
            TaskStatus::Failed {
                chunk_index,
                reason,
            } => {
                failed += 1;
                eprintln!("{}\tfailed at chunk {}: {}", task.name, chunk_index, reason);
            }
            other => eprintln!("{}\tunfinished: {:?}", task.name, other),
        }
    }

    if failed > 0 {
        bail!("{} of {} uploads failed", failed, args.files.len());
    }
    Ok(())
}
