//! Subcommand execution against an open store

use std::io::Read;

use anyhow::Context;
use runstash_store::{ListQuery, RunStore};
use serde_json::{Value, json};
use tracing::info;

use crate::config::Command;

/// Parse a payload argument; "-" reads the whole of stdin
pub fn read_payload(raw: &str) -> anyhow::Result<Value> {
    let text = if raw == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("reading payload from stdin")?;
        buf
    } else {
        raw.to_string()
    };
    serde_json::from_str(&text).context("payload is not valid JSON")
}

/// Execute one subcommand, returning the JSON to print
pub async fn run(store: &RunStore, command: Command) -> anyhow::Result<Value> {
    let output = match command {
        Command::Append { run_key, payload } => {
            let outcome = store.create_or_append(&run_key, read_payload(&payload)?)?;
            serde_json::to_value(outcome)?
        }
        Command::Replace { run_key, payload } => {
            serde_json::to_value(store.replace(&run_key, read_payload(&payload)?)?)?
        }
        Command::Get { run_key } => serde_json::to_value(store.get(&run_key)?)?,
        Command::Delete { run_key } => json!({ "deleted": store.remove(&run_key)? }),
        Command::List {
            run_key,
            start,
            end,
            limit,
            offset,
        } => {
            let query = ListQuery {
                run_key,
                start,
                end,
                limit,
                offset,
            };
            serde_json::to_value(store.list(&query)?)?
        }
        Command::Stats => serde_json::to_value(store.stats()?)?,
        Command::Cleanup => serde_json::to_value(store.run_cleanup_now()?)?,
        Command::Serve => {
            info!(db_path = %store.config().db_path.display(), "Serving; ctrl-c to stop");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for ctrl-c")?;

            let counters = store.sweep_counters();
            json!({
                "sweeps": counters.sweeps(),
                "deleted": counters.deleted(),
                "failures": counters.failures(),
            })
        }
    };
    Ok(output)
}
