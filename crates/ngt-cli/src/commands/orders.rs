//! `ngt orders ...`

use anyhow::{anyhow, bail, Result};
use clap::Subcommand;
use ngt_db::{CancelOutcome, EnqueueOutcome, NewOrder, OrderFilter, OrderRow, Resolution};
use ngt_execution::format_micros;
use ngt_schemas::{OrderStatus, Side};

use super::{opt_dt, opt_num, opt_str};

#[derive(Subcommand)]
pub enum OrdersCmd {
    /// Enqueue an order. Idempotent on (account, order_ref).
    Enqueue {
        #[arg(long)]
        account: String,

        #[arg(long)]
        instrument: String,

        /// BUY | SELL
        #[arg(long)]
        side: String,

        #[arg(long)]
        quantity: i64,

        /// Idempotency token; generated when omitted.
        #[arg(long)]
        order_ref: Option<String>,

        #[arg(long, default_value = "STK")]
        sec_type: String,

        #[arg(long, default_value = "SMART")]
        exchange: String,

        #[arg(long, default_value = "USD")]
        currency: String,

        #[arg(long, default_value = "MKT")]
        order_type: String,

        #[arg(long, default_value = "DAY")]
        tif: String,

        #[arg(long, default_value_t = 1)]
        max_retries: i32,

        #[arg(long, default_value = "cli")]
        source: String,

        #[arg(long)]
        request_text: Option<String>,
    },

    List {
        #[arg(long)]
        status: Option<String>,

        #[arg(long)]
        account: Option<String>,

        #[arg(long, default_value_t = 50)]
        limit: i64,
    },

    /// By `--id`, or by `--ref` with `--account`.
    Show {
        #[arg(long, conflicts_with = "order_ref", required_unless_present = "order_ref")]
        id: Option<i64>,

        #[arg(long = "ref", requires = "account")]
        order_ref: Option<String>,

        #[arg(long)]
        account: Option<String>,
    },

    /// Event history in sequence order.
    Events {
        #[arg(long)]
        id: i64,
    },

    Cancel {
        #[arg(long)]
        id: i64,
    },

    /// Operator clearance of a `reconcile_required` order.
    Resolve {
        #[arg(long)]
        id: i64,

        /// requeue | fail | cancel
        #[arg(long)]
        action: String,

        /// Required with `--action fail`.
        #[arg(long)]
        reason: Option<String>,
    },
}

pub fn parse_side(s: &str) -> Result<Side> {
    match Side::parse(s) {
        Some(side) => Ok(side),
        None => bail!("invalid --side '{s}'. expected one of: BUY | SELL"),
    }
}

pub fn parse_order_status(s: &str) -> Result<OrderStatus> {
    match OrderStatus::parse(s.trim()) {
        Some(st) => Ok(st),
        None => {
            let all: Vec<&str> = OrderStatus::ALL.iter().map(|s| s.as_str()).collect();
            bail!("invalid --status '{s}'. expected one of: {}", all.join(" | "))
        }
    }
}

pub fn parse_resolution(action: &str, reason: Option<String>) -> Result<Resolution> {
    match action.trim().to_ascii_lowercase().as_str() {
        "requeue" => Ok(Resolution::Requeue),
        "cancel" => Ok(Resolution::Cancel),
        "fail" => match reason.map(|r| r.trim().to_string()).filter(|r| !r.is_empty()) {
            Some(r) => Ok(Resolution::Fail(r)),
            None => bail!("--reason is required with --action fail"),
        },
        other => bail!("invalid --action '{other}'. expected one of: requeue | fail | cancel"),
    }
}

fn px(micros: Option<i64>) -> String {
    micros.map(format_micros).unwrap_or_default()
}

fn print_order_line(o: &OrderRow) {
    println!(
        "order_id={} account={} order_ref={} instrument={} side={} quantity={} filled={} avg_px={} status={}",
        o.id,
        o.account,
        o.order_ref,
        o.instrument,
        o.side.as_str(),
        o.quantity,
        o.filled_quantity,
        px(o.avg_fill_price_micros),
        o.status.as_str()
    );
}

pub async fn run(cmd: OrdersCmd) -> Result<()> {
    match cmd {
        OrdersCmd::Enqueue {
            account,
            instrument,
            side,
            quantity,
            order_ref,
            sec_type,
            exchange,
            currency,
            order_type,
            tif,
            max_retries,
            source,
            request_text,
        } => {
            let side = parse_side(&side)?;
            if quantity <= 0 {
                bail!("--quantity must be > 0");
            }
            if max_retries < 0 {
                bail!("--max-retries must be >= 0");
            }
            let order = NewOrder {
                sec_type,
                exchange,
                currency,
                order_type,
                tif,
                max_retries,
                source: Some(source),
                request_text,
                ..NewOrder::market(
                    account,
                    instrument,
                    side,
                    quantity,
                    order_ref.unwrap_or_else(ngt_db::new_order_ref),
                )
            };

            let pool = ngt_db::connect_from_env().await?;
            match ngt_db::order_enqueue(&pool, &order).await? {
                EnqueueOutcome::Created(id) => {
                    println!("order_id={id} order_ref={} created=true", order.order_ref)
                }
                EnqueueOutcome::Existing(id) => {
                    println!("order_id={id} order_ref={} created=false", order.order_ref)
                }
            }
        }

        OrdersCmd::List {
            status,
            account,
            limit,
        } => {
            let filter = OrderFilter {
                status: status.as_deref().map(parse_order_status).transpose()?,
                account,
                limit: Some(limit),
            };
            let pool = ngt_db::connect_from_env().await?;
            for o in ngt_db::order_list(&pool, &filter).await? {
                print_order_line(&o);
            }
        }

        OrdersCmd::Show {
            id,
            order_ref,
            account,
        } => {
            let pool = ngt_db::connect_from_env().await?;
            let o = match (id, order_ref, account) {
                (Some(id), _, _) => ngt_db::order_fetch(&pool, id)
                    .await?
                    .ok_or_else(|| anyhow!("order {id} not found"))?,
                (None, Some(order_ref), Some(account)) => {
                    ngt_db::order_fetch_by_ref(&pool, &account, &order_ref)
                        .await?
                        .ok_or_else(|| anyhow!("order {order_ref} not found for account {account}"))?
                }
                _ => bail!("--id or --ref with --account is required"),
            };
            print_order_line(&o);
            println!("venue_order_id={}", opt_str(&o.venue_order_id));
            println!("venue_perm_id={}", opt_num(&o.venue_perm_id));
            println!("retries={}/{}", o.retry_count, o.max_retries);
            println!("cancel_requested={}", o.cancel_requested);
            println!("lease_owner={}", opt_str(&o.lease_owner));
            println!("lease_expires_at={}", opt_dt(&o.lease_expires_at));
            println!("last_fill_at={}", opt_dt(&o.last_fill_at));
            println!("submitted_at={}", opt_dt(&o.submitted_at));
            println!("completed_at={}", opt_dt(&o.completed_at));
            println!("last_error={}", opt_str(&o.last_error));
        }

        OrdersCmd::Events { id } => {
            let pool = ngt_db::connect_from_env().await?;
            for e in ngt_db::order_events(&pool, id).await? {
                println!(
                    "seq={} at={} event={} from={} to={} fill_delta={} filled={} avg_px={} message={}",
                    e.seq,
                    e.created_at.to_rfc3339(),
                    e.event_type,
                    opt_str(&e.from_status),
                    e.status,
                    e.fill_delta,
                    e.filled_quantity,
                    px(e.avg_fill_price_micros),
                    opt_str(&e.message)
                );
            }
        }

        OrdersCmd::Cancel { id } => {
            let pool = ngt_db::connect_from_env().await?;
            match ngt_db::order_request_cancel(&pool, id).await? {
                CancelOutcome::Cancelled => println!("order_id={id} cancelled=true"),
                CancelOutcome::Requested => println!("order_id={id} cancel_requested=true"),
                CancelOutcome::AlreadyRequested => {
                    println!("order_id={id} cancel_requested=true already=true")
                }
                CancelOutcome::AlreadyTerminal(st) => {
                    println!("order_id={id} cancelled=false status={st}")
                }
            }
        }

        OrdersCmd::Resolve { id, action, reason } => {
            let resolution = parse_resolution(&action, reason)?;
            let pool = ngt_db::connect_from_env().await?;
            let t = ngt_db::order_resolve(&pool, id, &resolution).await?;
            println!(
                "order_id={id} resolved=true from={} to={} event={}",
                t.from, t.to, t.event_type
            );
        }
    }
    Ok(())
}
