//! zkstream command-line tool.
//!
//! Connects to a ZooKeeper ensemble, runs one command and closes the
//! session. `watch` keeps streaming node events until interrupted.

use anyhow::Context;
use chrono::{DateTime, Local, Utc};
use clap::{Parser, Subcommand};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use zk_session::{Client, ClientEvent, CreateFlags, CreateOptions, NodeEvent, Stat, WatchKind};

mod config;
mod logging;

use config::ZkCliConfig;
use logging::ZkLogFormatter;

/// Streaming ZooKeeper client
#[derive(Parser, Debug)]
#[command(name = "zkstream", version, about = "ZooKeeper client with session migration and watch resumption")]
struct Args {
    /// Path to the YAML configuration file
    #[arg(long, default_value = "zkstream.yaml")]
    config: PathBuf,

    /// Ensemble members, e.g. zk1:2181,zk2:2181
    #[arg(long)]
    servers: Option<String>,

    /// Requested session timeout, e.g. 30s
    #[arg(long)]
    session_timeout: Option<humantime::Duration>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the children of a node
    Ls { path: String },
    /// Print a node's data
    Get { path: String },
    /// Print a node's stat as JSON
    Stat { path: String },
    /// Create a node
    Create {
        path: String,
        #[arg(default_value = "")]
        data: String,
        /// Remove the node when the session ends
        #[arg(long)]
        ephemeral: bool,
        /// Append a monotonically increasing suffix
        #[arg(long)]
        sequential: bool,
        /// Create missing parents
        #[arg(long)]
        parents: bool,
    },
    /// Overwrite a node's data
    Set {
        path: String,
        data: String,
        /// Expected version
        #[arg(long)]
        version: Option<i32>,
    },
    /// Delete a node
    Rm {
        path: String,
        /// Expected version
        #[arg(long)]
        version: Option<i32>,
    },
    /// Sync a path with the leader
    Sync { path: String },
    /// Print a node's ACL as JSON
    Getacl { path: String },
    /// Measure the round-trip time to the connected server
    Ping,
    /// Stream events for a node until interrupted (all kinds if none given)
    Watch {
        path: String,
        #[arg(long)]
        created: bool,
        #[arg(long)]
        deleted: bool,
        #[arg(long)]
        data: bool,
        #[arg(long)]
        children: bool,
    },
}

/// Stat with readable zxids and timestamps
#[derive(Serialize)]
struct StatView {
    czxid: String,
    mzxid: String,
    pzxid: String,
    ctime: String,
    mtime: String,
    version: i32,
    cversion: i32,
    aversion: i32,
    ephemeral_owner: String,
    data_length: i32,
    num_children: i32,
}

fn render_time(ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .map(|t| t.with_timezone(&Local).to_rfc3339())
        .unwrap_or_else(|| ms.to_string())
}

impl From<&Stat> for StatView {
    fn from(stat: &Stat) -> Self {
        Self {
            czxid: format!("0x{:x}", stat.czxid),
            mzxid: format!("0x{:x}", stat.mzxid),
            pzxid: format!("0x{:x}", stat.pzxid),
            ctime: render_time(stat.ctime),
            mtime: render_time(stat.mtime),
            version: stat.version,
            cversion: stat.cversion,
            aversion: stat.aversion,
            ephemeral_owner: format!("0x{:x}", stat.ephemeral_owner),
            data_length: stat.data_length,
            num_children: stat.num_children,
        }
    }
}

fn print_json(value: &impl Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(logging::env_filter(&args.log_level)?)
        .with_target(false)
        .with_writer(std::io::stderr)
        .event_format(ZkLogFormatter::new("zkstream"))
        .init();

    let mut config = ZkCliConfig::load_from_file(&args.config)?;
    if let Some(servers) = &args.servers {
        config.set_servers(servers);
    }
    if let Some(timeout) = args.session_timeout {
        config.session_timeout_ms = Duration::from(timeout).as_millis() as u64;
    }

    let client = Client::connect(config.to_client_config()?)?;
    client
        .wait_connected(Duration::from_millis(config.session_timeout_ms))
        .await
        .with_context(|| format!("connecting to {}", config.servers.join(",")))?;
    info!(
        "connected with session {:016x}, timeout {:?}",
        client.session_id(),
        client.session_timeout()
    );

    let result = run(&client, args.command).await;
    client.close().await;
    result
}

async fn run(client: &Client, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Ls { path } => {
            let (mut children, _) = client
                .list(&path)
                .await
                .with_context(|| format!("listing {}", path))?;
            children.sort();
            for child in children {
                println!("{}", child);
            }
        }
        Command::Get { path } => {
            let (data, _) = client
                .get(&path)
                .await
                .with_context(|| format!("reading {}", path))?;
            println!("{}", String::from_utf8_lossy(&data));
        }
        Command::Stat { path } => {
            let stat = client
                .stat(&path)
                .await
                .with_context(|| format!("stat {}", path))?;
            print_json(&StatView::from(&stat))?;
        }
        Command::Create {
            path,
            data,
            ephemeral,
            sequential,
            parents,
        } => {
            let mut flags = CreateFlags::empty();
            flags.set(CreateFlags::EPHEMERAL, ephemeral);
            flags.set(CreateFlags::SEQUENTIAL, sequential);
            let options = CreateOptions::with_flags(flags);
            let created = if parents {
                client.create_with_empty_parents(&path, data, options).await
            } else {
                client.create(&path, data, options).await
            }
            .with_context(|| format!("creating {}", path))?;
            println!("{}", created);
            if ephemeral {
                warn!("{} is ephemeral and goes away with this session", created);
            }
        }
        Command::Set {
            path,
            data,
            version,
        } => {
            let stat = client
                .set(&path, data, version)
                .await
                .with_context(|| format!("writing {}", path))?;
            print_json(&StatView::from(&stat))?;
        }
        Command::Rm { path, version } => {
            client
                .delete(&path, version)
                .await
                .with_context(|| format!("deleting {}", path))?;
        }
        Command::Sync { path } => {
            client
                .sync(&path)
                .await
                .with_context(|| format!("syncing {}", path))?;
        }
        Command::Getacl { path } => {
            let (acl, _) = client
                .get_acl(&path)
                .await
                .with_context(|| format!("reading ACL of {}", path))?;
            print_json(&acl)?;
        }
        Command::Ping => {
            let rtt = client.ping().await?;
            println!("{}", humantime::format_duration(rtt));
        }
        Command::Watch {
            path,
            created,
            deleted,
            data,
            children,
        } => {
            let selected: Vec<WatchKind> = [
                (created, WatchKind::Created),
                (deleted, WatchKind::Deleted),
                (data, WatchKind::DataChanged),
                (children, WatchKind::ChildrenChanged),
            ]
            .into_iter()
            .filter_map(|(on, kind)| on.then_some(kind))
            .collect();
            let kinds = if selected.is_empty() {
                WatchKind::ALL.to_vec()
            } else {
                selected
            };
            watch(client, &path, kinds).await?;
        }
    }
    Ok(())
}

#[derive(Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum EventView {
    Created { path: String, stat: StatView },
    Deleted { path: String },
    DataChanged { path: String, data: String, stat: StatView },
    ChildrenChanged { path: String, children: Vec<String>, stat: StatView },
}

async fn watch(client: &Client, path: &str, kinds: Vec<WatchKind>) -> anyhow::Result<()> {
    let watcher = client.watcher(path)?;
    let mut events = stream::select_all(kinds.into_iter().map(|kind| watcher.subscribe(kind)));
    let mut client_events = client.events();

    loop {
        tokio::select! {
            event = events.next() => {
                let Some(event) = event else {
                    anyhow::bail!("session ended while watching {}", path);
                };
                let path = path.to_string();
                let view = match event {
                    NodeEvent::Created { stat } => EventView::Created { path, stat: (&stat).into() },
                    NodeEvent::Deleted => EventView::Deleted { path },
                    NodeEvent::DataChanged { data, stat } => EventView::DataChanged {
                        path,
                        data: String::from_utf8_lossy(&data).into_owned(),
                        stat: (&stat).into(),
                    },
                    NodeEvent::ChildrenChanged { children, stat } => EventView::ChildrenChanged {
                        path,
                        children,
                        stat: (&stat).into(),
                    },
                };
                println!("{}", serde_json::to_string(&view)?);
            }
            Ok(event) = client_events.recv() => match event {
                ClientEvent::Disconnect => warn!("disconnected, watches resume on reconnect"),
                ClientEvent::Connect => info!("reconnected"),
                ClientEvent::Expire => anyhow::bail!("session expired while watching {}", path),
                other => debug!("client event {:?}", other),
            },
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, closing session");
                return Ok(());
            }
        }
    }
}
