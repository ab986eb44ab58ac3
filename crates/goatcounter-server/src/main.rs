use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use goatcounter_core::config::{Database, DbConn};
use goatcounter_core::site::{Access, Permissions, SiteSettings};
use goatcounter_server::{
    app::build_app,
    auth::{generate_secret, hash_token, BUFFER_SECRET_KEY},
    buffer::{self, BufferState},
    config::{open_store, BufferArgs, Cli, Command, ServeArgs, TokenArgs},
    cron,
    geo::Geo,
    state::AppState,
};

/// `goatcounter health`: liveness check for containers.
///
/// Exits 0 if `/status` answers 200, 1 otherwise.
fn run_health_check(url: &str) -> ! {
    let url = format!("{}/status", url.trim_end_matches('/'));
    match ureq::get(&url).call() {
        Ok(resp) if resp.status() == 200 => std::process::exit(0),
        _ => std::process::exit(1),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    // Handled before logging is set up so health checks stay quiet.
    if let Some(Command::Health { url }) = &cli.command {
        run_health_check(url);
    }

    // Structured JSON logging; RUST_LOG overrides the level.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("goatcounter=info".parse()?)
                .add_directive("goatcounter_server=info".parse()?)
                .add_directive("goatcounter_store=info".parse()?),
        )
        .json()
        .init();

    match cli.command {
        None => serve(cli.serve).await,
        Some(Command::Serve(args)) => serve(args).await,
        Some(Command::Buffer(args)) => run_buffer(args).await,
        Some(Command::Token(args)) => create_token(args).await,
        Some(Command::Health { .. }) => Ok(()),
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let cfg = args.into_config()?;
    let store = open_store(&cfg.db, cfg.db_conn).await?;
    info!(db = %cfg.db, kind = store.kind(), "database ready");

    // Seed a site so a fresh install can count on localhost right away.
    if store.list_sites().await?.is_empty() {
        let site = store
            .create_site("default", Some("localhost"), &SiteSettings::default())
            .await?;
        info!(site_id = site.id, "created site 'default' (localhost)");
    }

    let geo = Geo::open(cfg.geodb.as_deref())?;
    let listen = cfg.listen.clone();
    let state = Arc::new(AppState::new(store, cfg, geo));

    let cancel = CancellationToken::new();
    let cron_task = tokio::spawn(cron::run(Arc::clone(&state), cancel.clone()));

    let app = build_app(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("listening on {listen}"))?;
    info!(listen = %listen, version = env!("CARGO_PKG_VERSION"), "goatcounter listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        tokio::signal::ctrl_c().await.ok();
    })
    .await?;

    cancel.cancel();
    cron_task.await.ok();
    cron::shutdown(&state).await;
    info!("shutdown complete");
    Ok(())
}

async fn run_buffer(args: BufferArgs) -> Result<()> {
    if args.generate_key {
        let db = Database::parse(&args.db)?;
        let store = open_store(&db, DbConn::default()).await?;
        let secret = generate_secret();
        store.set_value(BUFFER_SECRET_KEY, &secret).await?;
        println!("{secret}");
        return Ok(());
    }

    let config = args.into_config()?;
    let listen = config.listen.clone();
    let state = Arc::new(BufferState::new(config)?);

    let cancel = CancellationToken::new();
    let runner = tokio::spawn(buffer::run(Arc::clone(&state), cancel.clone()));

    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("listening on {listen}"))?;
    info!(listen = %listen, backend = %state.config.backend, "buffer listening");

    axum::serve(
        listener,
        buffer::build_buffer_app(Arc::clone(&state))
            .into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        tokio::signal::ctrl_c().await.ok();
    })
    .await?;

    cancel.cancel();
    runner.await.ok();
    // One last attempt; whatever is left is lost.
    while !state.is_empty() && state.send_once().await > 0 {}
    if !state.is_empty() {
        tracing::warn!(queued = state.len(), "exiting with unsent hits");
    }
    Ok(())
}

async fn create_token(args: TokenArgs) -> Result<()> {
    let permissions = Permissions::parse_list(&args.perm).map_err(anyhow::Error::msg)?;
    let db = Database::parse(&args.db)?;
    let store = open_store(&db, DbConn::default()).await?;

    let site = store
        .site_by_code(&args.site)
        .await?
        .with_context(|| format!("no site with code {:?}", args.site))?;
    let user = match store.first_user(site.id).await? {
        Some(user) => user,
        None => {
            store
                .create_user(site.id, &format!("admin@{}", site.code), Access::Admin)
                .await?
        }
    };

    let secret = generate_secret();
    let token = store
        .create_api_token(site.id, user.id, &args.name, &hash_token(&secret), permissions)
        .await?;
    info!(
        token_id = token.id,
        site_id = site.id,
        permissions = %permissions,
        "API token created"
    );
    println!("{secret}");
    Ok(())
}
