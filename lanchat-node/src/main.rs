// lanchat: LAN presence and messaging node with a line console.

use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use lanchat_core::MessageType;
use lanchat_node::{config, Node, NodeEvent};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "lanchat", version, about = "Discover peers on the LAN and exchange messages")]
struct Cli {
    /// Name shown to peers (default: config file, then host name).
    #[arg(long)]
    username: Option<String>,
    /// Config file to use instead of the standard locations.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Debug, PartialEq)]
enum Command {
    Peers,
    Msg(IpAddr, String),
    Offer(IpAddr, PathBuf),
    Help,
    Quit,
}

const HELP: &str = "commands: /peers | /msg <ip> <text> | /offer <ip> <path> | /quit";

fn parse_command(line: &str) -> Result<Command, String> {
    let (cmd, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();
    match cmd {
        "/peers" => Ok(Command::Peers),
        "/quit" | "/exit" => Ok(Command::Quit),
        "/help" => Ok(Command::Help),
        "/msg" | "/offer" => {
            let (ip, arg) = rest.split_once(' ').unwrap_or((rest, ""));
            let ip: IpAddr = ip.parse().map_err(|_| format!("invalid address {:?}", ip))?;
            let arg = arg.trim();
            if arg.is_empty() {
                return Err(HELP.to_string());
            }
            if cmd == "/msg" {
                Ok(Command::Msg(ip, arg.to_string()))
            } else {
                Ok(Command::Offer(ip, PathBuf::from(arg)))
            }
        }
        _ => Err(HELP.to_string()),
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let mut cfg = config::load(cli.config.as_deref());
    if let Some(name) = cli.username {
        cfg.username = name;
    }

    let rt = tokio::runtime::Runtime::new().context("starting runtime")?;
    rt.block_on(run(cfg))
}

async fn run(cfg: config::Config) -> anyhow::Result<()> {
    let username = cfg.username.clone();
    let (mut node, mut events) = Node::start(cfg).await;
    if !node.presence_running() && !node.transport_running() {
        anyhow::bail!("neither presence nor transport could start");
    }
    println!("lanchat as {:?}. {}", username, HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            Some(event) = events.recv() => print_event(&event),
            line = lines.next_line(), if stdin_open => match line? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => match parse_command(line.trim()) {
                    Ok(Command::Quit) => break,
                    Ok(cmd) => execute(&node, cmd).await,
                    Err(usage) => println!("{}", usage),
                },
                None => stdin_open = false,
            },
            res = &mut shutdown => {
                res?;
                break;
            }
        }
    }
    node.stop().await;
    Ok(())
}

async fn execute(node: &Node, cmd: Command) {
    match cmd {
        Command::Peers => {
            let peers = node.peers().await;
            if peers.is_empty() {
                println!("no peers");
            }
            for p in peers {
                println!("{} ({})", p.display_name, p.ip);
            }
        }
        Command::Msg(ip, text) => match node.outbound().send_text(ip, &text).await {
            Ok(()) => println!("[{}]: {}", node.outbound().sender_name(), text),
            Err(e) => println!("failed to send: {}", e),
        },
        Command::Offer(ip, path) => match node.outbound().send_file_offer(ip, &path).await {
            Ok(()) => println!("sent file offer: {}", path.display()),
            Err(e) => println!("failed to send file offer: {}", e),
        },
        Command::Help => println!("{}", HELP),
        Command::Quit => {}
    }
}

fn print_event(event: &NodeEvent) {
    match event {
        NodeEvent::PeerDiscovered { ip, name } => println!("* {} ({}) is here", name, ip),
        NodeEvent::PeerLost { ip } => println!("* {} left", ip),
        NodeEvent::Message(m) => match m.kind() {
            MessageType::Text => println!(
                "[{}@{}]: {}",
                m.sender_name(),
                m.sender_ip(),
                m.text_body().unwrap_or_default()
            ),
            MessageType::FileOffer => match m.file_offer_body() {
                Some(offer) => println!(
                    "* {} ({}) offers {} ({} bytes)",
                    m.sender_name(),
                    m.sender_ip(),
                    offer.filename,
                    offer.filesize
                ),
                None => println!("* malformed file offer from {}", m.sender_ip()),
            },
            other => println!("* {} from {} ({})", other, m.sender_name(), m.sender_ip()),
        },
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_msg_with_spaces() {
        assert_eq!(
            parse_command("/msg 10.0.0.5 hello there").unwrap(),
            Command::Msg("10.0.0.5".parse().unwrap(), "hello there".into())
        );
    }

    #[test]
    fn parses_offer() {
        assert_eq!(
            parse_command("/offer 10.0.0.5 /tmp/a b.txt").unwrap(),
            Command::Offer("10.0.0.5".parse().unwrap(), PathBuf::from("/tmp/a b.txt"))
        );
    }

    #[test]
    fn rejects_bad_address_and_missing_text() {
        assert!(parse_command("/msg alice hi").is_err());
        assert!(parse_command("/msg 10.0.0.5").is_err());
        assert!(parse_command("hello").is_err());
    }

    #[test]
    fn simple_commands() {
        assert_eq!(parse_command("/peers").unwrap(), Command::Peers);
        assert_eq!(parse_command("/quit").unwrap(), Command::Quit);
        assert_eq!(parse_command("/help").unwrap(), Command::Help);
    }
}
