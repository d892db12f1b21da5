use anyhow::Context;
use blockchat::{
    format_time, short_address, ChatApp, ChatConfig, ChatServices, Route, StderrNotifier,
};
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

/// Terminal client for BlockChat.
#[derive(Debug, Parser)]
#[command(name = "blockchat", version)]
struct Args {
    /// Page to open on start (`/` or `/chat`).
    #[arg(long, default_value = "/")]
    route: String,

    /// Use the local database emulator and development node instead of the
    /// environment.
    #[arg(long)]
    emulator: bool,
}

const LANDING: &str = "\
BlockChat
Secure, private, and censorship-resistant messaging powered by blockchain technology.

  /connect      connect your wallet
  /go /chat     launch the chat
  /quit         leave";

const CHAT_HELP: &str = "\
  /connect              connect your wallet
  /disconnect           mark yourself offline and forget the wallet
  /users                list contacts
  /search <text>        filter contacts by name or address
  /to <address>         open a conversation
  /name <username>      change your username (then /save)
  /save                 save settings
  /avatar <file>        upload a profile picture
  /balance              refresh your balance
  /go <path>            switch page
  /quit                 leave
  anything else is sent as a message";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(Level::INFO.into())
                .add_directive("reqwest=warn".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = if args.emulator {
        ChatConfig::emulator()
    } else {
        ChatConfig::from_env().context("loading configuration")?
    };
    info!(
        database = %config.database_url,
        wallet = config.wallet_rpc_url.is_some(),
        mirror = config.mirror_url.is_some(),
        "configuration loaded"
    );

    let services = ChatServices::from_config(&config, Arc::new(StderrNotifier));
    let mut app = ChatApp::new(services);
    if Route::from_path(&args.route).is_none() {
        warn!(route = %args.route, "unknown route, opening the landing page");
    }
    app.navigate(&args.route);
    let mut arrivals = app.feed().watch();
    app.start().await.context("subscribing to the realtime database")?;

    tokio::spawn(async move {
        loop {
            match arrivals.recv().await {
                Ok(message) => println!(
                    "[{}] {}: {}",
                    format_time(message.timestamp),
                    short_address(&message.sender),
                    message.message
                ),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "feed display fell behind"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    render(&app).await;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if !handle(&mut app, line.trim_end()).await {
            break;
        }
    }

    app.disconnect().await;
    Ok(())
}

async fn render(app: &ChatApp) {
    match app.route() {
        Route::Landing => println!("{LANDING}"),
        Route::Chat => match app.address() {
            Some(address) => {
                println!(
                    "Connected as {} ({} ETH)",
                    short_address(&address),
                    app.session().balance_display()
                );
                println!("{CHAT_HELP}");
            }
            None => println!("Connect your wallet to start chatting: /connect"),
        },
    }
}

/// Runs one shell line. Returns `false` when the shell should exit.
async fn handle(app: &mut ChatApp, line: &str) -> bool {
    let (command, rest) = match line.split_once(' ') {
        Some((command, rest)) => (command, rest.trim()),
        None => (line, ""),
    };

    match command {
        "/quit" => return false,
        "/connect" => {
            if let Some(address) = app.connect().await {
                println!("Connected as {}", short_address(&address));
            }
        }
        "/go" => {
            if Route::from_path(rest).is_none() {
                println!("No page at {rest}");
            }
            app.navigate(rest);
            render(app).await;
        }
        _ if app.route() == Route::Landing => println!("{LANDING}"),
        "/disconnect" => {
            if app.disconnect().await {
                println!("Wallet disconnected");
            }
        }
        "/users" | "/search" => {
            let contacts = app.search_contacts(rest).await;
            if contacts.is_empty() {
                println!("No contacts yet");
            }
            for user in contacts {
                let status = if user.is_online {
                    "online".to_string()
                } else {
                    format!("last seen {}", format_time(user.last_seen))
                };
                println!("{}  {}  ({status})", user.display_name(), user.address);
            }
        }
        "/to" if rest.is_empty() => println!("/to needs an address"),
        "/to" => {
            app.select_contact(rest);
            println!("Chatting with {}", app.presence().display_name(rest).await);
        }
        "/name" => {
            app.open_settings();
            if app.set_username(rest) {
                println!("Username set to {rest}; /save to keep it");
            } else {
                println!("/name needs a username");
            }
        }
        "/save" => {
            if app.save_settings().await {
                println!("Settings saved");
            }
        }
        "/avatar" => match tokio::fs::read(rest).await {
            Ok(bytes) => {
                let file_name = Path::new(rest)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "avatar".to_string());
                if let Some(url) = app.upload_avatar(&file_name, bytes).await {
                    println!("Profile picture: {url}");
                }
            }
            Err(e) => warn!(file = rest, error = %e, "could not read image"),
        },
        "/balance" => match app.refresh_balance().await {
            Some(balance) => println!("{balance} ETH"),
            None => println!("Balance unavailable"),
        },
        "/help" => println!("{CHAT_HELP}"),
        _ => {
            app.send(line).await;
        }
    }
    true
}
