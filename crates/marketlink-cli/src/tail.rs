use std::{sync::Arc, time::Duration};

use chrono::Local;
use clap::Args;
use marketlink::{
    Category, ConnectionRegistry, DispatchKey, MarketFeed, MarketRestClient, Message, SyncConfig,
};
use tokio::{runtime, signal};
use url::Url;

/// Follow one market and print what arrives.
#[derive(Args)]
#[command(alias = "t")]
pub struct Cmd {
    /// Site base URL. Channel URLs are derived from it (http -> ws, https -> wss).
    #[arg(short, long, env = "MLINK_BASE", default_value = "http://localhost:8080")]
    base: Url,

    /// REST API base URL. Defaults to `<base>/api`.
    #[arg(long)]
    api: Option<Url>,

    /// Also follow the user channel for this public key.
    #[arg(short, long)]
    user: Option<String>,

    /// Interval between heartbeat pings.
    /// Accepts human-readable formats like "30s", "1m".
    #[arg(long, value_parser = humantime::parse_duration, default_value = "30s")]
    heartbeat: Duration,

    /// Interval between REST refreshes once the channel gives up.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "10s")]
    poll_interval: Duration,

    /// Timeout for each REST request.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "10s")]
    http_timeout: Duration,

    /// Unclean closes tolerated before falling back to polling.
    #[arg(long, default_value_t = 5)]
    max_retries: u32,

    /// Prefix each line with the local receive time.
    #[arg(long)]
    include_time: bool,

    /// Pretty-print message payloads.
    #[arg(long)]
    pretty: bool,

    /// Market (news) id to follow.
    market_id: String,
}

pub fn run(cmd: Cmd) -> eyre::Result<()> {
    let runtime = runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(tail(cmd))
}

fn api_base(cmd: &Cmd) -> eyre::Result<Url> {
    if let Some(api) = &cmd.api {
        return Ok(api.clone());
    }
    let mut api = cmd.base.clone();
    api.path_segments_mut()
        .map_err(|_| eyre::eyre!("base URL {} cannot carry a path", cmd.base))?
        .pop_if_empty()
        .push("api");
    Ok(api)
}

fn print_message(message: &Message, include_time: bool, pretty: bool) {
    let payload = if pretty {
        serde_json::to_string_pretty(&message.payload)
    } else {
        serde_json::to_string(&message.payload)
    }
    .unwrap_or_else(|_| message.payload.to_string());

    if include_time {
        print!("{} ", Local::now().format("%H:%M:%S%.3f"));
    }
    println!("[{}] {} {}", message.category, message.message_type, payload);
}

async fn tail(cmd: Cmd) -> eyre::Result<()> {
    let config = SyncConfig::new()
        .heartbeat_interval(cmd.heartbeat)
        .poll_interval(cmd.poll_interval)
        .max_retries(cmd.max_retries);
    let registry = ConnectionRegistry::new(config)?;
    let rest = MarketRestClient::new(api_base(&cmd)?.as_str(), cmd.http_timeout)?;

    let mut builder = MarketFeed::builder(
        registry.clone(),
        Arc::new(rest),
        cmd.market_id.clone(),
        cmd.base.as_str(),
    );
    if let Some(user) = &cmd.user {
        builder = builder.user(user.clone());
    }
    let feed = builder.connect()?;

    let (include_time, pretty) = (cmd.include_time, cmd.pretty);
    let _subscriptions: Vec<_> = [Category::Market, Category::User, Category::System]
        .into_iter()
        .map(|category| {
            feed.dispatcher()
                .on(DispatchKey::Category(category), move |message| {
                    print_message(message, include_time, pretty);
                    Ok(())
                })
        })
        .collect();

    let mut status = feed.subscribe_status();
    let mut snapshot = feed.subscribe_snapshot();
    println!("status: {}", *status.borrow_and_update());

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => break,
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                println!("status: {}", *status.borrow_and_update());
            }
            changed = snapshot.changed() => {
                if changed.is_err() {
                    break;
                }
                let price = snapshot.borrow_and_update().current_price();
                if feed.is_polling()
                    && let Some(price) = price
                {
                    println!("price: {price:.3} (rest)");
                }
            }
        }
    }

    feed.shutdown();
    registry.close_all();
    Ok(())
}
