use anyhow::{Context, Result};
use clap::Parser;
use courtside::call::{CallSession, NetworkStatus};
use courtside::cli::{Cli, Command, JoinArgs};
use courtside::session::SessionManager;
use courtside::telemetry::logging;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.logging.to_config()).context("failed to initialise logging")?;
    match cli.command {
        Command::Join(args) => join(&cli.origin, args).await,
    }
}

async fn join(origin: &str, args: JoinArgs) -> Result<()> {
    let config = args.call_config(origin)?;
    let sessions = SessionManager::new(config.origin(), args.token.clone())?;
    let joined = sessions
        .join(&args.session)
        .await
        .with_context(|| format!("failed to join video session {}", args.session))?;
    println!(
        "joined session {} as user {} ({})",
        joined.session_id, joined.user_id, joined.user_role
    );

    let call = CallSession::with_rtc(&config, NetworkStatus::default())?;
    let _tracks = call.on_track(|stream| {
        let kinds: Vec<&str> = stream.tracks().iter().map(|t| t.kind.as_str()).collect();
        println!("user {} is sending {}", stream.user(), kinds.join("+"));
    });
    let _leaves = call.on_user_disconnect(|user| println!("user {user} left the call"));

    if !(args.no_video && args.no_audio) {
        call.start_local_stream(!args.no_video, !args.no_audio)
            .await
            .context("failed to start local media")?;
    }
    call.connect(&joined.session_id, joined.user_id)
        .await
        .context("failed to connect to the call")?;
    println!("in call; press Ctrl-C to hang up");

    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for Ctrl-C")?;
    call.close_all().await;
    println!("left the call");
    Ok(())
}
