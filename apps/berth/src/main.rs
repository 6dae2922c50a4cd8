//! Operator console for the wallet peer-session hub.
//!
//! Stands in for the wallet UI: drives connects, account/chain switches and
//! request resolutions against a hub wired to the loopback transport and a
//! JSON-file store. The `peer-*` commands play the remote dApp side.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use berth_hub::loopback::LoopbackFactory;
use berth_hub::{
    Hub, HubConfig, HubHandle, JsonFileStore, Notice, Outcome, PeerUri, RequestKey,
};

#[derive(Parser, Debug)]
#[command(name = "berth", about = "Wallet peer-session console")]
struct Cli {
    /// Active wallet account exposed to peers.
    #[arg(long, env = "BERTH_ACCOUNT")]
    account: String,

    /// Active chain id exposed to peers.
    #[arg(long, env = "BERTH_CHAIN", default_value_t = 1)]
    chain: u64,

    /// Directory holding the persisted connection and request records.
    #[arg(long, env = "BERTH_STATE_DIR", default_value = ".berth")]
    state_dir: PathBuf,

    /// Peer uri to connect at startup; may be repeated.
    #[arg(long = "connect")]
    connect: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    tracing::info!(
        target = "berth",
        account = %cli.account,
        chain = cli.chain,
        state_dir = %cli.state_dir.display(),
        "starting hub"
    );
    let factory = Arc::new(LoopbackFactory::auto_negotiating("loopback-peer"));
    let store = Arc::new(JsonFileStore::new(&cli.state_dir));
    let (hub, handle) = Hub::new(
        factory.clone(),
        store,
        HubConfig::new(cli.account, cli.chain),
    );
    let hub_task = tokio::spawn(hub.run());

    let mut notices = handle.notices();
    tokio::spawn(async move {
        while let Ok(notice) = notices.recv().await {
            print_notice(&notice);
        }
    });

    for uri in &cli.connect {
        match handle.connect(uri).await {
            Ok(status) => println!("connect {uri}: {status:?}"),
            Err(err) => eprintln!("connect {uri} failed: {err}"),
        }
    }

    println!("berth console ready; type `help`");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if !dispatch(&handle, factory.as_ref(), line.trim()).await {
            break;
        }
    }

    handle.shutdown();
    hub_task.await.context("hub task panicked")?;
    Ok(())
}

fn print_notice(notice: &Notice) {
    match notice {
        Notice::SessionConnected { uri, peer } => println!("* connected to {peer} ({uri})"),
        Notice::ConnectFailed { uri, reason } => println!("* connection to {uri} failed: {reason}"),
        Notice::ChannelDisconnected { uri } => println!("* {uri} disconnected"),
        Notice::UnsupportedMethod { uri, method } => {
            println!("* {uri} asked for unsupported method {method}")
        }
        Notice::RequestQueued { key, method } => {
            println!("* request {} from {} ({method})", key.id, key.uri)
        }
        Notice::NegotiationPending { uri } => {
            println!("* still waiting for {uri} to negotiate a session")
        }
    }
}

/// Handle one console line; false means quit.
async fn dispatch(handle: &HubHandle, factory: &LoopbackFactory, line: &str) -> bool {
    let mut words = line.split_whitespace();
    let Some(command) = words.next() else {
        return true;
    };
    let args: Vec<&str> = words.collect();

    match (command, args.as_slice()) {
        ("help", _) => print_help(),
        ("quit", _) | ("exit", _) => return false,
        ("connect", [uri]) => match handle.connect(uri).await {
            Ok(status) => println!("connect {uri}: {status:?}"),
            Err(err) => eprintln!("connect failed: {err}"),
        },
        ("disconnect", [uri]) => handle.disconnect(uri),
        ("account", [account]) => handle.set_account(*account),
        ("chain", [chain]) => match chain.parse() {
            Ok(chain_id) => handle.set_chain(chain_id),
            Err(_) => eprintln!("chain id must be a number"),
        },
        ("list", _) => {
            for view in handle.snapshot().connections {
                let peer = view
                    .session
                    .as_ref()
                    .map(|s| s.peer_meta.name.clone())
                    .unwrap_or_else(|| "<negotiating>".into());
                println!("{} {} {}", view.uri, view.state, peer);
            }
        }
        ("requests", _) => {
            for request in handle.snapshot().requests {
                println!(
                    "{} #{} {} account={} chain={}",
                    request.uri, request.id, request.method, request.account, request.chain_id
                );
            }
        }
        ("approve", [uri, id, rest @ ..]) => {
            resolve(handle, uri, id, Outcome::Approved(parse_result(rest)))
        }
        ("reject", [uri, id, rest @ ..]) => {
            let message = if rest.is_empty() {
                "rejected by user".to_string()
            } else {
                rest.join(" ")
            };
            resolve(handle, uri, id, Outcome::Rejected(message))
        }
        ("peer-request", [uri, id, method, rest @ ..]) => {
            let Some(peer) = factory.peer(uri) else {
                eprintln!("no loopback peer for {uri}; connect it first");
                return true;
            };
            let Ok(id) = id.parse() else {
                eprintln!("request id must be a number");
                return true;
            };
            let params = parse_result(rest);
            if let Err(err) = peer.request(id, method, params) {
                eprintln!("peer request failed: {err}");
            }
        }
        ("peer-drop", [uri]) => {
            let Some(peer) = factory.peer(uri) else {
                eprintln!("no loopback peer for {uri}");
                return true;
            };
            if let Err(err) = peer.drop_channel(Some("dropped from console")) {
                eprintln!("peer drop failed: {err}");
            }
        }
        _ => eprintln!("unrecognized command; type `help`"),
    }
    true
}

fn resolve(handle: &HubHandle, uri: &str, id: &str, outcome: Outcome) {
    let uri = match PeerUri::parse(uri) {
        Ok(uri) => uri,
        Err(err) => {
            eprintln!("{err}");
            return;
        }
    };
    let Ok(id) = id.parse() else {
        eprintln!("request id must be a number");
        return;
    };
    handle.resolve_many(vec![RequestKey { uri, id }], outcome);
}

/// Trailing console words as a JSON value: valid JSON passes through, bare
/// words become a string, nothing becomes null.
fn parse_result(rest: &[&str]) -> Value {
    if rest.is_empty() {
        return Value::Null;
    }
    let joined = rest.join(" ");
    serde_json::from_str(&joined).unwrap_or_else(|_| json!(joined))
}

fn print_help() {
    println!(
        "commands:\n  \
         connect <uri>                        open a channel to a peer\n  \
         disconnect <uri>                     drop a channel\n  \
         account <address>                    switch the active account\n  \
         chain <id>                           switch the active chain\n  \
         list                                 show connections\n  \
         requests                             show pending requests\n  \
         approve <uri> <id> [result-json]     approve queued requests\n  \
         reject <uri> <id> [message]          reject queued requests\n  \
         peer-request <uri> <id> <method> [params-json]\n  \
         peer-drop <uri>                      simulate the peer side\n  \
         quit"
    );
}
