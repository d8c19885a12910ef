//! Execution ingestion and trade aggregation.
//!
//! Raw executions are inserted once per `(account, exec_id)` and never
//! deleted. Among rows sharing an `exec_id_base` exactly one is canonical:
//! the highest revision, earliest row on ties. Trade aggregates are rebuilt
//! from canonical rows after every change, so arrival order does not matter.

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use ngt_execution::{aggregate, CanonicalExecution, ExecIdParser, TradeKey, TradeStatus};
use ngt_schemas::{RawExecution, Side};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestOutcome {
    pub execution_id: i64,
    pub trade_id: Option<i64>,
    /// `exec_id` was already stored; nothing changed.
    pub duplicate: bool,
    pub exec_id_base: String,
    pub exec_revision: i32,
    pub canonical: bool,
}

#[derive(Debug, Clone)]
pub struct TradeRow {
    pub id: i64,
    pub account: String,
    pub resolution_key: String,
    pub perm_id: Option<i64>,
    pub order_ref: Option<String>,
    pub client_id: Option<i64>,
    pub venue_order_id: Option<String>,
    pub instrument: String,
    pub side: Side,
    pub execution_date: NaiveDate,
    pub total_quantity: i64,
    pub avg_price_micros: Option<i64>,
    pub first_execution_at: Option<DateTime<Utc>>,
    pub last_execution_at: Option<DateTime<Utc>>,
    pub execution_count: i32,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct TradeExecutionRow {
    pub id: i64,
    pub account: String,
    pub exec_id: String,
    pub exec_id_base: String,
    pub exec_revision: i32,
    pub trade_id: Option<i64>,
    pub perm_id: Option<i64>,
    pub order_ref: Option<String>,
    pub instrument: String,
    pub side: Side,
    pub quantity: i64,
    pub price_micros: i64,
    pub executed_at: DateTime<Utc>,
    pub is_canonical: bool,
    pub raw_payload: Value,
    pub ingested_at: DateTime<Utc>,
}

fn side_from(row: &PgRow) -> Result<Side> {
    let s: String = row.try_get("side")?;
    Side::parse(&s).ok_or_else(|| anyhow!("invalid side: {s}"))
}

fn trade_from_row(row: &PgRow) -> Result<TradeRow> {
    Ok(TradeRow {
        id: row.try_get("id")?,
        account: row.try_get("account")?,
        resolution_key: row.try_get("resolution_key")?,
        perm_id: row.try_get("perm_id")?,
        order_ref: row.try_get("order_ref")?,
        client_id: row.try_get("client_id")?,
        venue_order_id: row.try_get("venue_order_id")?,
        instrument: row.try_get("instrument")?,
        side: side_from(row)?,
        execution_date: row.try_get("execution_date")?,
        total_quantity: row.try_get("total_quantity")?,
        avg_price_micros: row.try_get("avg_price_micros")?,
        first_execution_at: row.try_get("first_execution_at")?,
        last_execution_at: row.try_get("last_execution_at")?,
        execution_count: row.try_get("execution_count")?,
        status: row.try_get("status")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn execution_from_row(row: &PgRow) -> Result<TradeExecutionRow> {
    Ok(TradeExecutionRow {
        id: row.try_get("id")?,
        account: row.try_get("account")?,
        exec_id: row.try_get("exec_id")?,
        exec_id_base: row.try_get("exec_id_base")?,
        exec_revision: row.try_get("exec_revision")?,
        trade_id: row.try_get("trade_id")?,
        perm_id: row.try_get("perm_id")?,
        order_ref: row.try_get("order_ref")?,
        instrument: row.try_get("instrument")?,
        side: side_from(row)?,
        quantity: row.try_get("quantity")?,
        price_micros: row.try_get("price_micros")?,
        executed_at: row.try_get("executed_at")?,
        is_canonical: row.try_get("is_canonical")?,
        raw_payload: row.try_get("raw_payload")?,
        ingested_at: row.try_get("ingested_at")?,
    })
}

fn validate(exec: &RawExecution) -> Result<()> {
    if exec.account.trim().is_empty() {
        bail!("execution account must not be empty");
    }
    if exec.exec_id.trim().is_empty() {
        bail!("execution exec_id must not be empty");
    }
    if exec.instrument.trim().is_empty() {
        bail!("execution {} has no instrument", exec.exec_id);
    }
    if exec.quantity <= 0 {
        bail!("execution {} quantity must be positive (got {})", exec.exec_id, exec.quantity);
    }
    if exec.price_micros < 0 {
        bail!("execution {} price must not be negative", exec.exec_id);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Ingest
// ---------------------------------------------------------------------------

/// Store one venue execution and bring canonicality + trade aggregates up to
/// date. Re-ingesting the same `exec_id` is a no-op reported as `duplicate`.
pub async fn execution_ingest(
    pool: &PgPool,
    exec: &RawExecution,
    parser: &dyn ExecIdParser,
) -> Result<IngestOutcome> {
    validate(exec)?;
    let parts = parser.parse(&exec.exec_id);

    let mut tx = pool.begin().await.context("execution_ingest begin failed")?;

    // Serialize writers of the same base.
    sqlx::query("select pg_advisory_xact_lock(hashtext($1), hashtext($2))")
        .bind(&exec.account)
        .bind(&parts.base)
        .execute(&mut *tx)
        .await
        .context("execution_ingest advisory lock failed")?;

    let inserted = sqlx::query(
        r#"
        insert into trade_executions (
          account, exec_id, exec_id_base, exec_revision, perm_id, order_ref,
          client_id, venue_order_id, instrument, side, quantity, price_micros,
          executed_at, raw_payload
        ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
        on conflict on constraint uq_trade_executions_exec_id do nothing
        returning id
        "#,
    )
    .bind(&exec.account)
    .bind(&exec.exec_id)
    .bind(&parts.base)
    .bind(parts.revision)
    .bind(exec.perm_id)
    .bind(exec.order_ref.as_deref())
    .bind(exec.client_id)
    .bind(exec.venue_order_id.as_deref())
    .bind(&exec.instrument)
    .bind(exec.side.as_str())
    .bind(exec.quantity)
    .bind(exec.price_micros)
    .bind(exec.executed_at)
    .bind(&exec.raw_payload)
    .fetch_optional(&mut *tx)
    .await
    .context("execution_ingest insert failed")?;

    let Some(inserted) = inserted else {
        let row = sqlx::query(
            r#"
            select id, trade_id, exec_id_base, exec_revision, is_canonical
            from trade_executions
            where account = $1 and exec_id = $2
            "#,
        )
        .bind(&exec.account)
        .bind(&exec.exec_id)
        .fetch_one(&mut *tx)
        .await
        .context("execution_ingest duplicate lookup failed")?;
        tx.rollback().await.ok();

        tracing::debug!(exec_id = %exec.exec_id, "duplicate execution ignored");
        return Ok(IngestOutcome {
            execution_id: row.try_get("id")?,
            trade_id: row.try_get("trade_id")?,
            duplicate: true,
            exec_id_base: row.try_get("exec_id_base")?,
            exec_revision: row.try_get("exec_revision")?,
            canonical: row.try_get("is_canonical")?,
        });
    };
    let execution_id: i64 = inserted.try_get("id")?;

    let winner = refresh_canonical(&mut tx, &exec.account, &parts.base).await?;

    let trade_id = resolve_trade(&mut tx, exec).await?;
    sqlx::query("update trade_executions set trade_id = $2 where id = $1")
        .bind(execution_id)
        .bind(trade_id)
        .execute(&mut *tx)
        .await
        .context("execution_ingest link failed")?;

    let (trade_ids,): (Vec<i64>,) = sqlx::query_as(
        r#"
        select coalesce(array_agg(distinct trade_id order by trade_id), '{}')
        from trade_executions
        where account = $1 and exec_id_base = $2 and trade_id is not null
        "#,
    )
    .bind(&exec.account)
    .bind(&parts.base)
    .fetch_one(&mut *tx)
    .await
    .context("execution_ingest touched trades failed")?;

    for id in trade_ids {
        recompute_trade(&mut tx, id).await?;
    }

    tx.commit().await.context("execution_ingest commit failed")?;

    tracing::info!(
        exec_id = %exec.exec_id,
        base = %parts.base,
        revision = parts.revision,
        trade_id,
        canonical = winner == execution_id,
        "execution ingested"
    );

    Ok(IngestOutcome {
        execution_id,
        trade_id: Some(trade_id),
        duplicate: false,
        exec_id_base: parts.base,
        exec_revision: parts.revision,
        canonical: winner == execution_id,
    })
}

/// Make exactly one row of `(account, base)` canonical. Returns its id.
async fn refresh_canonical(
    tx: &mut Transaction<'_, Postgres>,
    account: &str,
    base: &str,
) -> Result<i64> {
    let (winner,): (i64,) = sqlx::query_as(
        r#"
        select id
        from trade_executions
        where account = $1 and exec_id_base = $2
        order by exec_revision desc, id asc
        limit 1
        "#,
    )
    .bind(account)
    .bind(base)
    .fetch_one(&mut **tx)
    .await
    .context("canonical winner lookup failed")?;

    // Demote first; the partial unique index allows one canonical row.
    sqlx::query(
        r#"
        update trade_executions
        set is_canonical = false
        where account = $1 and exec_id_base = $2 and is_canonical and id <> $3
        "#,
    )
    .bind(account)
    .bind(base)
    .bind(winner)
    .execute(&mut **tx)
    .await
    .context("canonical demote failed")?;

    sqlx::query("update trade_executions set is_canonical = true where id = $1 and not is_canonical")
        .bind(winner)
        .execute(&mut **tx)
        .await
        .context("canonical promote failed")?;

    Ok(winner)
}

/// Find the parent trade by the strongest identifier, or create it.
async fn resolve_trade(tx: &mut Transaction<'_, Postgres>, exec: &RawExecution) -> Result<i64> {
    let candidates = TradeKey::candidates(exec);

    for key in &candidates {
        let found: Option<(i64,)> = match key {
            TradeKey::PermId(p) => {
                sqlx::query_as(
                    "select id from trades where account = $1 and perm_id = $2 order by id limit 1",
                )
                .bind(&exec.account)
                .bind(*p)
                .fetch_optional(&mut **tx)
                .await
            }
            TradeKey::OrderRef(r) => {
                sqlx::query_as(
                    "select id from trades where account = $1 and order_ref = $2 order by id limit 1",
                )
                .bind(&exec.account)
                .bind(r)
                .fetch_optional(&mut **tx)
                .await
            }
            TradeKey::Composite { .. } => {
                sqlx::query_as("select id from trades where account = $1 and resolution_key = $2")
                    .bind(&exec.account)
                    .bind(key.resolution_key())
                    .fetch_optional(&mut **tx)
                    .await
            }
        }
        .context("trade lookup failed")?;

        if let Some((id,)) = found {
            backfill_trade_ids(tx, id, exec).await?;
            return Ok(id);
        }
    }

    let key = candidates
        .first()
        .ok_or_else(|| anyhow!("execution {} has no trade key", exec.exec_id))?;

    let (id,): (i64,) = sqlx::query_as(
        r#"
        insert into trades (
          account, resolution_key, perm_id, order_ref, client_id, venue_order_id,
          instrument, side, execution_date
        ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        on conflict on constraint uq_trades_resolution_key
          do update set updated_at = now()
        returning id
        "#,
    )
    .bind(&exec.account)
    .bind(key.resolution_key())
    .bind(exec.perm_id.filter(|p| *p != 0))
    .bind(exec.order_ref.as_deref().filter(|r| !r.trim().is_empty()))
    .bind(exec.client_id)
    .bind(exec.venue_order_id.as_deref())
    .bind(&exec.instrument)
    .bind(exec.side.as_str())
    .bind(exec.executed_at.date_naive())
    .fetch_one(&mut **tx)
    .await
    .context("trade insert failed")?;

    Ok(id)
}

async fn backfill_trade_ids(
    tx: &mut Transaction<'_, Postgres>,
    trade_id: i64,
    exec: &RawExecution,
) -> Result<()> {
    sqlx::query(
        r#"
        update trades
        set perm_id = coalesce(perm_id, $2),
            order_ref = coalesce(order_ref, $3),
            client_id = coalesce(client_id, $4),
            venue_order_id = coalesce(venue_order_id, $5)
        where id = $1
        "#,
    )
    .bind(trade_id)
    .bind(exec.perm_id.filter(|p| *p != 0))
    .bind(exec.order_ref.as_deref().filter(|r| !r.trim().is_empty()))
    .bind(exec.client_id)
    .bind(exec.venue_order_id.as_deref())
    .execute(&mut **tx)
    .await
    .context("trade id backfill failed")?;
    Ok(())
}

/// Rebuild one trade's totals from its canonical executions.
async fn recompute_trade(tx: &mut Transaction<'_, Postgres>, trade_id: i64) -> Result<()> {
    let (account, order_ref): (String, Option<String>) =
        sqlx::query_as("select account, order_ref from trades where id = $1 for update")
            .bind(trade_id)
            .fetch_one(&mut **tx)
            .await
            .context("trade lock failed")?;

    let legs: Vec<(i64, i64, DateTime<Utc>)> = sqlx::query_as(
        r#"
        select quantity, price_micros, executed_at
        from trade_executions
        where trade_id = $1 and is_canonical
        order by executed_at, id
        "#,
    )
    .bind(trade_id)
    .fetch_all(&mut **tx)
    .await
    .context("trade canonical executions failed")?;

    let execs: Vec<CanonicalExecution> = legs
        .into_iter()
        .map(|(quantity, price_micros, executed_at)| CanonicalExecution {
            quantity,
            price_micros,
            executed_at,
        })
        .collect();
    let agg = aggregate(&execs);

    let order_quantity: Option<i64> = match order_ref {
        Some(r) => sqlx::query_as::<_, (i64,)>(
            "select quantity from orders where account = $1 and order_ref = $2",
        )
        .bind(&account)
        .bind(&r)
        .fetch_optional(&mut **tx)
        .await
        .context("trade order lookup failed")?
        .map(|(q,)| q),
        None => None,
    };
    let status = TradeStatus::classify(order_quantity, agg.total_quantity);

    sqlx::query(
        r#"
        update trades
        set total_quantity = $2,
            avg_price_micros = $3,
            first_execution_at = $4,
            last_execution_at = $5,
            execution_count = $6,
            status = $7,
            updated_at = now()
        where id = $1
        "#,
    )
    .bind(trade_id)
    .bind(agg.total_quantity)
    .bind(agg.avg_price_micros)
    .bind(agg.first_execution_at)
    .bind(agg.last_execution_at)
    .bind(i32::try_from(agg.execution_count).context("execution count overflow")?)
    .bind(status.as_str())
    .execute(&mut **tx)
    .await
    .context("trade update failed")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Read API
// ---------------------------------------------------------------------------

/// Newest first. `limit` defaults to 100.
pub async fn trade_list(pool: &PgPool, account: Option<&str>, limit: Option<i64>) -> Result<Vec<TradeRow>> {
    let rows = sqlx::query(
        r#"
        select *
        from trades
        where ($1::text is null or account = $1)
        order by id desc
        limit $2
        "#,
    )
    .bind(account)
    .bind(limit.unwrap_or(100))
    .fetch_all(pool)
    .await
    .context("trade_list failed")?;
    rows.iter().map(trade_from_row).collect()
}

pub async fn trade_fetch(pool: &PgPool, trade_id: i64) -> Result<Option<TradeRow>> {
    let row = sqlx::query("select * from trades where id = $1")
        .bind(trade_id)
        .fetch_optional(pool)
        .await
        .context("trade_fetch failed")?;
    row.as_ref().map(trade_from_row).transpose()
}

/// Every raw execution linked to the trade, canonical or not.
pub async fn trade_executions(pool: &PgPool, trade_id: i64) -> Result<Vec<TradeExecutionRow>> {
    let rows = sqlx::query(
        r#"
        select *
        from trade_executions
        where trade_id = $1
        order by executed_at, exec_id_base, exec_revision, id
        "#,
    )
    .bind(trade_id)
    .fetch_all(pool)
    .await
    .context("trade_executions failed")?;
    rows.iter().map(execution_from_row).collect()
}
