use portfolio_agent::{
    config::agent_ws_url,
    session::{SessionChannel, SessionConfig, WebSocketTransport},
    ConnectionStatus, Sender,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let mut config = SessionConfig::default().with_connect_timeout(CONNECT_TIMEOUT);
    if let Some(session_id) = std::env::args().nth(1) {
        config.session_id = session_id;
    }

    let mut url = agent_ws_url();
    url.push_str(if url.contains('?') { "&" } else { "?" });
    url.push_str(&format!("session_id={}", config.session_id));

    info!(%url, "Opening chat session");
    let channel = SessionChannel::open(Arc::new(WebSocketTransport), url, config);

    let mut state = channel.subscribe();
    let connected = state
        .wait_for(|s| s.connection_status != ConnectionStatus::Connecting)
        .await
        .map(|s| s.is_open())
        .unwrap_or(false);
    if !connected {
        eprintln!("Could not connect to the agent");
        return Ok(());
    }
    println!("Connected as session {}. Type /quit to leave.", channel.session_id());

    // Printer: shows every agent turn as it lands in the transcript
    let mut printer_state = channel.subscribe();
    let printer = tokio::spawn(async move {
        let mut printed = 0;
        while printer_state.changed().await.is_ok() {
            let snapshot = printer_state.borrow_and_update().clone();
            for message in snapshot.transcript.iter().skip(printed) {
                if message.sender == Sender::Agent {
                    println!("agent> {}", message.text);
                }
            }
            printed = snapshot.transcript.len();
            if snapshot.connection_status == ConnectionStatus::Closed {
                println!("Session closed.");
                break;
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();
                if line == "/quit" {
                    break;
                }
                if line.is_empty() {
                    continue;
                }
                if channel.is_agent_thinking() {
                    println!("(agent is still thinking)");
                }
                channel.send_message(line).await;
            }
            _ = channel.closed() => break,
        }
    }

    channel.close().await;
    let _ = printer.await;
    Ok(())
}
