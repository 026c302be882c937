use anyhow::Context;
use chrono::Local;
use clap::Parser;
use log::{error, info};
use serde_json::{Map, Value, json};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use verto_bridge::bridge::CallBridge;
use verto_bridge::config::{BridgeConfig, DEFAULT_USER_PREFIX};
use verto_bridge::events::InboundEvent;
use verto_bridge::messaging::{InMemoryDirectory, MessagingApi, MessagingError};
use verto_bridge::verto::{Credentials, VertoEndpoint};

// The application-service transport stays outside this process: normalized
// events arrive as JSON lines on stdin, outbound protocol sends leave as
// JSON lines on stdout, and logs go to stderr.
//
// Usage:
//   verto-bridge --url ws://127.0.0.1:8081 --login 1008 --passwd 1234
//   verto-bridge --url ... --login ... --passwd ... --dialog-params dialog.json

#[derive(Parser, Debug)]
#[command(name = "verto-bridge", about = "Bridges messaging-network calls onto a verto media server")]
struct Args {
    /// WebSocket URL of the media server, e.g. ws://127.0.0.1:8081
    #[arg(long)]
    url: String,
    /// Media-server login.
    #[arg(long)]
    login: String,
    /// Media-server password.
    #[arg(long)]
    passwd: String,
    /// Localpart prefix marking bridge-managed identities.
    #[arg(long, default_value = DEFAULT_USER_PREFIX)]
    user_prefix: String,
    /// JSON file of base dialog parameters merged into every invite.
    #[arg(long)]
    dialog_params: Option<PathBuf>,
}

fn main() {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to build tokio runtime");

    if let Err(e) = rt.block_on(run(args)) {
        error!("{e:#}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let dialog_params = load_dialog_params(args.dialog_params.as_deref()).await?;
    let config = BridgeConfig {
        verto_url: args.url,
        login: args.login,
        passwd: args.passwd,
        user_prefix: args.user_prefix,
        dialog_params,
    };

    let (endpoint, requests_rx) = VertoEndpoint::new(config.verto_url.clone());
    // A failed first login means we must not keep serving; later connection
    // losses are recovered inside the endpoint.
    endpoint
        .connect(Credentials {
            login: config.login.clone(),
            passwd: config.passwd.clone(),
        })
        .await
        .context("Failed to login to verto")?;

    let messaging = Arc::new(StdoutMessaging);
    let directory = Arc::new(InMemoryDirectory::new());
    let bridge = CallBridge::new(config, endpoint, messaging, directory);

    tokio::spawn(bridge.clone().run(requests_rx));
    tokio::spawn(feed_loop(bridge));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutting down");
    Ok(())
}

async fn load_dialog_params(path: Option<&Path>) -> anyhow::Result<Map<String, Value>> {
    let Some(path) = path else {
        return Ok(Map::new());
    };
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Consumes the normalized event feed, one JSON event per line. Each
/// event's outcome (or failure) is reported in the log; a bad event never
/// takes the loop down.
async fn feed_loop(bridge: Arc<CallBridge>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<InboundEvent>(line) {
                    Ok(event) => match bridge.handle_event(event).await {
                        Ok(outcome) => info!(target: "Bridge/Feed", "Event handled: {outcome:?}"),
                        Err(e) => error!(target: "Bridge/Feed", "Event failed: {e}"),
                    },
                    Err(e) => error!(target: "Bridge/Feed", "Rejected malformed event: {e}"),
                }
            }
            Ok(None) => {
                info!(target: "Bridge/Feed", "Event feed closed");
                return;
            }
            Err(e) => {
                error!(target: "Bridge/Feed", "Failed to read event feed: {e}");
                return;
            }
        }
    }
}

/// Emits outbound protocol sends as JSON lines on stdout, leaving delivery
/// to the transport supervising this process.
struct StdoutMessaging;

impl StdoutMessaging {
    fn emit(&self, value: Value) {
        println!("{value}");
    }
}

#[async_trait::async_trait]
impl MessagingApi for StdoutMessaging {
    async fn join_room(&self, identity: &str, room_id: &str) -> Result<(), MessagingError> {
        self.emit(json!({
            "action": "join_room",
            "identity": identity,
            "room_id": room_id,
        }));
        Ok(())
    }

    async fn send_answer(
        &self,
        identity: &str,
        room_id: &str,
        call_id: &str,
        sdp: &str,
    ) -> Result<(), MessagingError> {
        self.emit(json!({
            "action": "send_event",
            "identity": identity,
            "room_id": room_id,
            "event_type": "call_answer",
            "content": {
                "call_id": call_id,
                "version": 0,
                "answer": {"sdp": sdp, "type": "answer"},
            },
        }));
        Ok(())
    }

    async fn send_hangup(
        &self,
        identity: &str,
        room_id: &str,
        call_id: &str,
    ) -> Result<(), MessagingError> {
        self.emit(json!({
            "action": "send_event",
            "identity": identity,
            "room_id": room_id,
            "event_type": "call_hangup",
            "content": {"call_id": call_id, "version": 0},
        }));
        Ok(())
    }
}
