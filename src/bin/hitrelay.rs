//! Command-line driver for the hit relay
//!
//! Records hits into the local SQLite store and delivers them.
//!
//! Usage:
//!   hitrelay view <screen>
//!   hitrelay event <category> <action> [label] [value]
//!   hitrelay exception <description> [--fatal]
//!   hitrelay timing <category> <milliseconds> <name> [label]
//!   hitrelay social <network> <action> [target]
//!   hitrelay flush [timeout-seconds]
//!   hitrelay status
//!
//! Settings come from `HITRELAY_*` variables (or `.env`), or from the YAML file
//! named by `HITRELAY_CONFIG`.

use anyhow::{anyhow, Context, Result};
use dotenvy::dotenv;
use hitrelay::core::Config;
use hitrelay::dispatcher::Dispatcher;
use hitrelay::hit::{AppInfo, Hit};
use hitrelay::store::SqliteHitStore;
use hitrelay::transport::{create_user_agent_string, HttpTransport};
use log::{info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};

const USAGE: &str = "usage: hitrelay <view|event|exception|timing|social|flush|status> [args...]";

const DEFAULT_FLUSH_TIMEOUT: f64 = 30.0;

enum Action {
    Record(Hit),
    Flush(Duration),
    Status,
}

fn arg<'a>(args: &'a [String], index: usize, name: &str) -> Result<&'a str> {
    args.get(index)
        .map(String::as_str)
        .ok_or_else(|| anyhow!("missing <{name}>\n{USAGE}"))
}

fn parse_action(args: &[String], app: AppInfo) -> Result<Action> {
    let command = arg(args, 0, "command")?;
    let optional = |index: usize| args.get(index).map(String::as_str);

    let action = match command {
        "view" => Action::Record(Hit::screen_view(app, arg(args, 1, "screen")?)),
        "event" => {
            let value = optional(4)
                .map(|raw| raw.parse::<i64>().with_context(|| format!("invalid value '{raw}'")))
                .transpose()?;
            Action::Record(Hit::event(
                app,
                arg(args, 1, "category")?,
                arg(args, 2, "action")?,
                optional(3),
                value,
            ))
        }
        "exception" => {
            let fatal = args.iter().skip(2).any(|a| a == "--fatal");
            Action::Record(Hit::exception(app, arg(args, 1, "description")?, fatal))
        }
        "timing" => {
            let raw = arg(args, 2, "milliseconds")?;
            let interval_ms = raw
                .parse::<u64>()
                .with_context(|| format!("invalid milliseconds '{raw}'"))?;
            Action::Record(Hit::timing(
                app,
                arg(args, 1, "category")?,
                interval_ms,
                arg(args, 3, "name")?,
                optional(4),
            ))
        }
        "social" => Action::Record(Hit::social(
            app,
            arg(args, 1, "network")?,
            arg(args, 2, "action")?,
            optional(3),
        )),
        "flush" => {
            let seconds = optional(1)
                .map(|raw| raw.parse::<f64>().with_context(|| format!("invalid timeout '{raw}'")))
                .transpose()?
                .unwrap_or(DEFAULT_FLUSH_TIMEOUT);
            let timeout = Duration::try_from_secs_f64(seconds)
                .with_context(|| format!("timeout must be a non-negative number of seconds: {seconds}"))?;
            Action::Flush(timeout)
        }
        "status" => Action::Status,
        other => return Err(anyhow!("unknown command '{other}'\n{USAGE}")),
    };

    Ok(action)
}

/// Wait until the flush cycle has run and all its sends have settled
fn wait_for_flush(dispatcher: &Dispatcher, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        let stats = dispatcher.stats();
        if stats.cycles > 0 && stats.submitted == stats.delivered + stats.failed {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv().ok();

    let config = match std::env::var("HITRELAY_CONFIG") {
        Ok(path) => Config::load(&path)?,
        Err(_) => Config::from_env()?,
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&config.log_level))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let action = parse_action(&args, config.tracker.app_info())?;

    let user_agent = create_user_agent_string(&config.tracker.app_name, &config.tracker.app_version);
    let transport = HttpTransport::new(
        config.dispatcher.address(config.dispatcher.use_https),
        user_agent,
        config.request_timeout()?,
    )?;
    let store = Arc::new(SqliteHitStore::new(&config.store_path));

    // Delivery only happens on explicit flush from the command line
    let mut dispatcher_config = config.dispatcher.clone();
    dispatcher_config.dispatch_interval = 0.0;
    let dispatcher = Dispatcher::new(store.clone(), Arc::new(transport), dispatcher_config)?;

    match action {
        Action::Record(hit) => {
            let kind = hit.kind.to_string();
            if !dispatcher.store_hit(&hit) {
                return Err(anyhow!(
                    "failed to record {kind} hit in {}",
                    store.path().display()
                ));
            }
            if dispatcher.is_opt_out() {
                println!("opted out, {kind} hit dropped");
            } else {
                println!("recorded {kind} hit");
            }
        }
        Action::Flush(timeout) => {
            let pending = dispatcher.pending_hits()?;
            info!("Flushing {pending} pending hit(s) to {}", config.dispatcher.host);
            dispatcher.queue_dispatch();
            if !wait_for_flush(&dispatcher, timeout) {
                warn!("Flush did not finish within {timeout:?}");
            }
            let stats = dispatcher.stats();
            println!(
                "delivered {} hit(s), {} failed, {} pending",
                stats.delivered,
                stats.failed,
                dispatcher.pending_hits()?
            );
        }
        Action::Status => {
            let status = serde_json::json!({
                "store": store.path().display().to_string(),
                "pending": dispatcher.pending_hits()?,
                "endpoint": config.dispatcher.address(dispatcher.is_use_https()).base_url(),
                "opt_out": dispatcher.is_opt_out(),
                "user_agent": dispatcher.user_agent(),
            });
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }

    dispatcher.shutdown();
    Ok(())
}
