use std::error::Error;

use clap::Parser;
use dotenvy::dotenv;
use echos_chat::config::{self, load_config};
use echos_chat::{ChatService, ConnectionState, Libp2pTransport, SendOutcome};
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(
    name = "echos",
    version,
    about = "Chat with nearby devices on the local network"
)]
struct Cli {
    /// Path to JSON config file
    #[arg(long, default_value = config::DEFAULT_CONFIG_PATH, value_name = "FILE")]
    config: String,
    /// Name shown to other devices
    #[arg(long, value_name = "NAME")]
    name: Option<String>,
    /// Discovery service identifier
    #[arg(long, value_name = "TYPE")]
    service: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenv().ok();
    env_logger::init();

    let cli = Cli::parse();
    let mut chat_config = load_config(&cli.config);
    if let Some(name) = cli.name {
        chat_config.display_name = Some(name);
    }
    if let Some(service) = cli.service {
        chat_config.service_type = service;
    }

    let transport = Libp2pTransport::new(&chat_config)?;
    let service = ChatService::spawn(&chat_config, transport)?;
    spawn_printers(&service);

    service.start_discovery().await?;
    println!(
        "Joined '{}' as '{}'. Type a message and press enter; /peers lists devices, /quit leaves.",
        chat_config.service_type,
        service.display_name()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let text = line.trim();
                if text == "/quit" {
                    break;
                }
                if text == "/peers" {
                    print_peers(&service).await?;
                    continue;
                }
                report(service.send_message(text).await?);
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    service.shutdown().await;
    Ok(())
}

fn spawn_printers(service: &ChatService) {
    let mut messages = service.messages();
    tokio::spawn(async move {
        while let Some(message) = messages.next().await {
            println!("< {}", message.text);
        }
    });

    let mut peers = service.peers();
    tokio::spawn(async move {
        let mut connected = 0;
        while let Some(snapshot) = peers.next().await {
            let now = snapshot
                .iter()
                .filter(|peer| peer.connection_state == ConnectionState::Connected)
                .count();
            if now != connected {
                println!("* {now} device(s) connected");
                connected = now;
            }
        }
    });

    let mut indicator = service.typing_indicator();
    tokio::spawn(async move {
        while indicator.changed().await.is_ok() {
            if let Some(name) = indicator.borrow_and_update().clone() {
                println!("* {name} is typing...");
            }
        }
    });
}

async fn print_peers(service: &ChatService) -> Result<(), Box<dyn Error>> {
    let peers = service.peer_snapshot().await?;
    if peers.is_empty() {
        println!("* nobody nearby yet");
    }
    for peer in peers {
        println!(
            "* {} ({}), last seen {}",
            peer.display_name,
            peer.connection_state,
            peer.last_seen.format("%H:%M:%S")
        );
    }
    Ok(())
}

fn report(outcome: SendOutcome) {
    match outcome {
        SendOutcome::Skipped | SendOutcome::Sent(_) => {}
        SendOutcome::Failed { error, .. } => println!("! not delivered: {error}"),
    }
}
