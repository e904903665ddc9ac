//! TCP command server
//!
//! Line-oriented control protocol: each connection gets a banner, then sends
//! ASCII commands. Lines are trimmed, upper-cased and marshalled onto a
//! server-wide channel; a single dispatcher task maps tokens to handlers and
//! answers on the originating connection. Replies are framed between dash
//! rules sized to the message.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tracing::{debug, error, info};

use crate::engine::EngineCore;

/// Sliding per-line read deadline
const READLINE_DEADLINE: Duration = Duration::from_secs(30);
const COMMAND_BUFFER: usize = 32;

type ConnHandle = Arc<Mutex<OwnedWriteHalf>>;

struct Command {
    line: String,
    conn: ConnHandle,
}

/// Accept loop plus the dispatcher task
pub(crate) async fn serve(address: String, core: Arc<EngineCore>) {
    let listener = match TcpListener::bind(&address).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("Cannot start TCP server at: {}: {}", address, err);
            return;
        }
    };
    info!("Started TCP server at: {}", address);

    let (tx_command, mut rx_command) = mpsc::channel::<Command>(COMMAND_BUFFER);

    let dispatcher_core = Arc::clone(&core);
    tokio::spawn(async move {
        while let Some(command) = rx_command.recv().await {
            dispatch(&dispatcher_core, command).await;
        }
    });

    let banner = format!(
        "Connected to {}. Type HELP for available commands.",
        core.config.project
    );

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!("Got new TCP connection: {}", peer);
                let tx_command = tx_command.clone();
                let banner = banner.clone();
                tokio::spawn(handle_connection(stream, banner, tx_command));
            }
            Err(err) => {
                error!("TCP accept failed: {}", err);
            }
        }
    }
}

/// Per-connection read loop with a 30 s deadline refreshed after every line
async fn handle_connection(stream: TcpStream, banner: String, tx_command: mpsc::Sender<Command>) {
    let peer = stream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    let (read_half, write_half) = stream.into_split();
    let conn: ConnHandle = Arc::new(Mutex::new(write_half));

    {
        let mut writer = conn.lock().await;
        if write_message(&mut *writer, &banner).await.is_err() {
            return;
        }
    }

    let mut lines = BufReader::new(read_half).lines();
    loop {
        match timeout(READLINE_DEADLINE, lines.next_line()).await {
            Ok(Ok(Some(line))) => {
                let line = line.trim().to_uppercase();
                if line.is_empty() {
                    continue;
                }
                let command = Command {
                    line,
                    conn: Arc::clone(&conn),
                };
                if tx_command.send(command).await.is_err() {
                    break;
                }
            }
            Ok(Ok(None)) | Ok(Err(_)) => break,
            Err(_) => {
                debug!("Read deadline expired for {}", peer);
                break;
            }
        }
    }

    debug!("Connection from {} closed", peer);
}

/// Map one command token to its reply and write it back
async fn dispatch(core: &Arc<EngineCore>, command: Command) {
    debug!("Dispatching command: {}", command.line);

    let reply = match command.line.as_str() {
        "HELP" => Some(help_text()),
        "LIST" => Some(list_text(core)),
        "STATS" => Some(stats_text(core)),
        "EXTENSIONS" => Some(extensions_text(core)),
        "MIDDLEWARE" => Some(middleware_text(core)),
        "ITEMS" => None,
        "STOP" => {
            core.request_stop();
            Some("Stopping the engine...".to_string())
        }
        _ => Some("No such command".to_string()),
    };

    if let Some(message) = reply {
        let mut writer = command.conn.lock().await;
        if let Err(err) = write_message(&mut *writer, &message).await {
            debug!("Dropping reply, connection went away: {}", err);
        }
    }
}

fn help_text() -> String {
    "Available commands: HELP, LIST, STATS, EXTENSIONS, MIDDLEWARE, ITEMS, STOP".to_string()
}

fn list_text(core: &EngineCore) -> String {
    core.scrapers
        .iter()
        .map(|scraper| scraper.name().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn stats_text(core: &EngineCore) -> String {
    let totals = core.stats.totals();
    let mut lines = vec![format!(
        "Requests total: {}. Started: {}",
        totals.requests_total,
        totals.started.format("%Y-%m-%d %H:%M:%S UTC")
    )];

    for scraper in &core.scrapers {
        let stats = core.stats.get(scraper.name());
        lines.push(format!(
            "{} Current URL: {}",
            scraper.summary(&stats),
            scraper.current_url()
        ));
    }
    lines.join("\n")
}

fn extensions_text(core: &EngineCore) -> String {
    if core.extensions.is_empty() {
        return "No extensions registered".to_string();
    }
    core.extensions
        .iter()
        .map(|extension| extension.name().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn middleware_text(core: &EngineCore) -> String {
    if core.middleware.is_empty() {
        return "No middleware registered".to_string();
    }
    core.middleware
        .iter()
        .map(|middleware| middleware.name().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Frame `message` between dash rules sized to its character count
async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, message: &str) -> std::io::Result<()> {
    let rule = "-".repeat(message.chars().count());
    writer.write_all(rule.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.write_all(message.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.write_all(rule.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    use crate::config::ScraperConfig;
    use crate::scraper::Scraper;

    fn test_core(names: &[&str]) -> Arc<EngineCore> {
        let scrapers = names
            .iter()
            .map(|name| {
                Arc::new(
                    Scraper::new(*name, format!("https://{}.example.com/", name), 0, None)
                        .unwrap(),
                )
            })
            .collect();
        EngineCore::for_tests(
            ScraperConfig {
                project: "testbed".to_string(),
                ..ScraperConfig::default()
            },
            scrapers,
            vec![std::sync::Arc::new(crate::extensions::Display)],
            vec![
                crate::middleware::strip_accept_encoding(),
                crate::middleware::random_user_agent(),
            ],
        )
    }

    #[test]
    fn test_list_is_comma_joined() {
        let core = test_core(&["alpha", "beta"]);
        assert_eq!(list_text(&core), "alpha, beta");
    }

    #[test]
    fn test_stats_covers_totals_and_every_scraper() {
        let core = test_core(&["alpha", "beta"]);
        let text = stats_text(&core);
        assert!(text.starts_with("Requests total: 0."));
        assert!(text.contains("<Scraper: alpha.example.com>"));
        assert!(text.contains("<Scraper: beta.example.com>"));
        assert!(text.contains("Current URL:"));
    }

    #[test]
    fn test_extensions_and_middleware_listings() {
        let core = test_core(&["alpha"]);
        assert_eq!(extensions_text(&core), "Display");
        assert_eq!(
            middleware_text(&core),
            "strip_accept_encoding, random_user_agent"
        );
    }

    #[tokio::test]
    async fn test_write_message_framing() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        write_message(&mut server, "hello").await.unwrap();
        drop(server);

        let mut output = String::new();
        client.read_to_string(&mut output).await.unwrap();
        assert_eq!(output, "-----\nhello\n-----\n");
    }

    #[tokio::test]
    async fn test_rule_counts_characters_not_bytes() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        write_message(&mut server, "żółw").await.unwrap();
        drop(server);

        let mut output = String::new();
        client.read_to_string(&mut output).await.unwrap();
        let rule = output.lines().next().unwrap();
        assert_eq!(rule, "----");
    }

    #[test]
    fn test_help_lists_every_command() {
        let help = help_text();
        for token in ["HELP", "LIST", "STATS", "EXTENSIONS", "MIDDLEWARE", "ITEMS", "STOP"] {
            assert!(help.contains(token));
        }
    }
}
