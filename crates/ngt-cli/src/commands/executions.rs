//! `ngt executions ...`
//!
//! Execution files are JSON: one object or an array of objects.
//! ```json
//! {"account": "DU1", "exec_id": "0000e0d5.65e1.01.01", "perm_id": 9001001,
//!  "order_ref": "ngt-...", "instrument": "AAPL", "side": "BOT",
//!  "quantity": 3, "price": "100.25", "executed_at": "2026-01-05T14:31:00Z"}
//! ```
//! The original object is kept as `raw_payload`.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::Subcommand;
use ngt_execution::{format_micros, parse_price_micros};
use ngt_schemas::{RawExecution, Side};
use serde::Deserialize;
use serde_json::Value;

use super::{load_settings, opt_dt, opt_num, opt_str};

#[derive(Subcommand)]
pub enum ExecutionsCmd {
    /// Ingest executions from a JSON file. Replays are no-ops.
    Ingest {
        #[arg(long)]
        file: String,

        /// Layered config paths (for `executions.*` parser settings).
        #[arg(long = "config")]
        config_paths: Vec<String>,
    },

    /// List trades, newest first.
    Trades {
        #[arg(long)]
        account: Option<String>,

        #[arg(long, default_value_t = 50)]
        limit: i64,
    },

    /// One trade with all of its executions.
    Trade {
        #[arg(long)]
        id: i64,
    },
}

#[derive(Debug, Deserialize)]
struct ExecutionRecord {
    account: String,
    exec_id: String,
    #[serde(default)]
    perm_id: Option<i64>,
    #[serde(default)]
    order_ref: Option<String>,
    #[serde(default)]
    client_id: Option<i64>,
    #[serde(default)]
    venue_order_id: Option<String>,
    instrument: String,
    side: String,
    quantity: i64,
    /// Decimal text; floats lose precision.
    price: String,
    executed_at: DateTime<Utc>,
}

fn to_raw(v: Value) -> Result<RawExecution> {
    let rec: ExecutionRecord =
        serde_json::from_value(v.clone()).context("execution record has the wrong shape")?;
    let Some(side) = Side::parse(&rec.side) else {
        bail!("exec_id {}: invalid side '{}'", rec.exec_id, rec.side);
    };
    let price_micros = parse_price_micros(&rec.price)
        .with_context(|| format!("exec_id {}: invalid price", rec.exec_id))?;
    Ok(RawExecution {
        account: rec.account,
        exec_id: rec.exec_id,
        perm_id: rec.perm_id,
        order_ref: rec.order_ref,
        client_id: rec.client_id,
        venue_order_id: rec.venue_order_id,
        instrument: rec.instrument,
        side,
        quantity: rec.quantity,
        price_micros,
        executed_at: rec.executed_at,
        raw_payload: v,
    })
}

pub fn parse_execution_file(raw: &str) -> Result<Vec<RawExecution>> {
    let v: Value = serde_json::from_str(raw.trim()).context("execution file must be valid JSON")?;
    match v {
        Value::Array(items) => items.into_iter().map(to_raw).collect(),
        obj @ Value::Object(_) => Ok(vec![to_raw(obj)?]),
        _ => bail!("execution file must hold an object or an array of objects"),
    }
}

pub async fn run(cmd: ExecutionsCmd) -> Result<()> {
    match cmd {
        ExecutionsCmd::Ingest { file, config_paths } => {
            let settings = load_settings(&config_paths, ngt_schemas::WorkerKind::Jobs)?;
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("read execution file failed: {file}"))?;
            let executions = parse_execution_file(&raw)?;
            let parser = settings.executions.parser();

            let pool = ngt_db::connect_from_env().await?;
            let mut duplicates = 0usize;
            for exec in &executions {
                let out = ngt_db::execution_ingest(&pool, exec, &parser).await?;
                if out.duplicate {
                    duplicates += 1;
                }
                println!(
                    "exec_id={} execution_id={} base={} revision={} canonical={} duplicate={} trade_id={}",
                    exec.exec_id,
                    out.execution_id,
                    out.exec_id_base,
                    out.exec_revision,
                    out.canonical,
                    out.duplicate,
                    opt_num(&out.trade_id)
                );
            }
            println!(
                "ingested={} duplicates={}",
                executions.len() - duplicates,
                duplicates
            );
        }

        ExecutionsCmd::Trades { account, limit } => {
            let pool = ngt_db::connect_from_env().await?;
            for t in ngt_db::trade_list(&pool, account.as_deref(), Some(limit)).await? {
                println!(
                    "trade_id={} account={} instrument={} side={} date={} quantity={} avg_px={} executions={} status={} order_ref={}",
                    t.id,
                    t.account,
                    t.instrument,
                    t.side.as_str(),
                    t.execution_date,
                    t.total_quantity,
                    t.avg_price_micros.map(format_micros).unwrap_or_default(),
                    t.execution_count,
                    t.status,
                    opt_str(&t.order_ref)
                );
            }
        }

        ExecutionsCmd::Trade { id } => {
            let pool = ngt_db::connect_from_env().await?;
            let Some(t) = ngt_db::trade_fetch(&pool, id).await? else {
                bail!("trade {id} not found");
            };
            println!("trade_id={} resolution_key={}", t.id, t.resolution_key);
            println!(
                "quantity={} avg_px={} status={} first_at={} last_at={}",
                t.total_quantity,
                t.avg_price_micros.map(format_micros).unwrap_or_default(),
                t.status,
                opt_dt(&t.first_execution_at),
                opt_dt(&t.last_execution_at)
            );
            for e in ngt_db::trade_executions(&pool, id).await? {
                println!(
                    "  exec_id={} revision={} canonical={} quantity={} px={} at={}",
                    e.exec_id,
                    e.exec_revision,
                    e.is_canonical,
                    e.quantity,
                    format_micros(e.price_micros),
                    e.executed_at.to_rfc3339()
                );
            }
        }
    }
    Ok(())
}
