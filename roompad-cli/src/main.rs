//! roompad: terminal front end for shared text rooms.
//!
//! `serve` hosts rooms, `create` makes a new one, `join` opens one and turns
//! every stdin line into an edit while printing what everyone else sees.

mod cli;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::sync::{mpsc, watch};

use roompad_sync::{
    ClientConfig, RemoteBackend, RoomView, ServerConfig, SyncConfig, SyncController, SyncNotice,
    SyncServer,
};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = cli::Cli::parse();

    match cli.command {
        cli::Commands::Serve { bind, data } => serve(bind, data).await,
        cli::Commands::Create { url } => create(url).await,
        cli::Commands::Join {
            code,
            url,
            debounce_ms,
            timeout_secs,
        } => {
            let client = ClientConfig {
                request_timeout: Duration::from_secs(timeout_secs),
                ..ClientConfig::new(url)
            };
            let sync = SyncConfig {
                debounce_delay: Duration::from_millis(debounce_ms),
            };
            join(code, client, sync).await
        }
    }
}

async fn serve(bind: String, data: Option<std::path::PathBuf>) -> Result<()> {
    let config = ServerConfig {
        bind_addr: bind,
        storage_path: data,
        ..ServerConfig::default()
    };
    let server = SyncServer::new(config).context("failed to open room storage")?;
    info!("Starting roompad server on {}", server.bind_addr());
    server.run().await.context("server stopped")?;
    Ok(())
}

async fn connect(config: ClientConfig) -> Result<Arc<RemoteBackend>> {
    let url = config.url.clone();
    let backend = RemoteBackend::connect(config)
        .await
        .with_context(|| format!("could not reach {url}"))?;
    Ok(Arc::new(backend))
}

async fn create(url: String) -> Result<()> {
    let backend = connect(ClientConfig::new(url)).await?;
    let mut controller = SyncController::new(backend, SyncConfig::default());
    let room = controller.create_room().await?;
    println!("{}", room.room_code);
    Ok(())
}

async fn join(code: String, client: ClientConfig, sync: SyncConfig) -> Result<()> {
    let backend = connect(client).await?;
    let mut controller = SyncController::new(backend, sync);
    let notices = controller
        .take_notices()
        .context("notice channel already taken")?;
    let mut views = controller.watch();

    let view = controller.enter_room(&code).await?;
    print_view(&view);
    views.borrow_and_update();

    let lines = BufReader::new(tokio::io::stdin()).lines();
    run_session(&mut controller, lines, views, notices).await
}

/// Turn input lines into edits until `/quit`, EOF or an error, then leave the room.
async fn run_session<R>(
    controller: &mut SyncController,
    mut lines: Lines<R>,
    mut views: watch::Receiver<RoomView>,
    mut notices: mpsc::UnboundedReceiver<SyncNotice>,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let result = edit_loop(controller, &mut lines, &mut views, &mut notices).await;
    controller.leave_room().await;
    result
}

async fn edit_loop<R>(
    controller: &mut SyncController,
    lines: &mut Lines<R>,
    views: &mut watch::Receiver<RoomView>,
    notices: &mut mpsc::UnboundedReceiver<SyncNotice>,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line.context("failed to read stdin")? {
                    Some(line) if line.trim() == "/quit" => return Ok(()),
                    Some(line) => controller.on_user_edited(line)?,
                    None => return Ok(()),
                }
            }
            changed = views.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                let view = views.borrow_and_update().clone();
                print_view(&view);
            }
            Some(notice) = notices.recv() => {
                eprintln!("! {notice}");
            }
        }
    }
}

fn print_view(view: &RoomView) {
    let code = view
        .room_code
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_default();
    let live = if view.live { "live" } else { "offline" };
    println!(
        "[{code} | {:?} | {} online | {:?} | {live}] {}",
        view.phase, view.participant_count, view.sync_status, view.content
    );
}
