//! `ngt jobs ...`

use anyhow::{bail, Result};
use clap::Subcommand;
use ngt_db::{JobFilter, JobRow, NewJob};
use ngt_schemas::JobStatus;

use super::{load_payload, opt_dt, opt_str};

#[derive(Subcommand)]
pub enum JobsCmd {
    /// Enqueue a job.
    Enqueue {
        #[arg(long = "type")]
        job_type: String,

        #[arg(long, conflicts_with = "payload_file")]
        payload: Option<String>,

        #[arg(long = "payload-file", conflicts_with = "payload")]
        payload_file: Option<String>,

        #[arg(long, default_value_t = 3)]
        max_attempts: i32,

        /// Free-form origin tag (e.g. `cli`, `cron`).
        #[arg(long, default_value = "cli")]
        source: String,

        #[arg(long)]
        request_text: Option<String>,
    },

    List {
        #[arg(long)]
        status: Option<String>,

        #[arg(long = "type")]
        job_type: Option<String>,

        #[arg(long, default_value_t = false)]
        include_archived: bool,

        #[arg(long, default_value_t = 50)]
        limit: i64,
    },

    Show {
        #[arg(long)]
        id: i64,
    },

    /// Soft-delete; archived jobs are never claimed.
    Archive {
        #[arg(long)]
        id: i64,
    },

    /// Enqueue a copy of a failed job and archive the original.
    Rerun {
        #[arg(long)]
        id: i64,
    },
}

pub fn parse_job_status(s: &str) -> Result<JobStatus> {
    match JobStatus::parse(s.trim()) {
        Some(st) => Ok(st),
        None => bail!("invalid --status '{s}'. expected one of: queued | running | completed | failed"),
    }
}

fn print_job_line(j: &JobRow) {
    println!(
        "job_id={} type={} status={} attempts={}/{} available_at={} archived={}",
        j.id,
        j.job_type,
        j.status.as_str(),
        j.attempts,
        j.max_attempts,
        j.available_at.to_rfc3339(),
        j.archived_at.is_some()
    );
}

pub async fn run(cmd: JobsCmd) -> Result<()> {
    match cmd {
        JobsCmd::Enqueue {
            job_type,
            payload,
            payload_file,
            max_attempts,
            source,
            request_text,
        } => {
            if job_type.trim().is_empty() {
                bail!("--type must not be empty");
            }
            if max_attempts < 1 {
                bail!("--max-attempts must be >= 1");
            }
            let payload = load_payload(payload, payload_file)?;
            let mut job = NewJob::new(job_type.trim(), payload, max_attempts);
            job.source = Some(source);
            job.request_text = request_text;

            let pool = ngt_db::connect_from_env().await?;
            let id = ngt_db::job_enqueue(&pool, &job).await?;
            println!("job_id={id} type={} status=queued", job.job_type);
        }

        JobsCmd::List {
            status,
            job_type,
            include_archived,
            limit,
        } => {
            let filter = JobFilter {
                status: status.as_deref().map(parse_job_status).transpose()?,
                job_type,
                include_archived,
                limit: Some(limit),
            };
            let pool = ngt_db::connect_from_env().await?;
            for j in ngt_db::job_list(&pool, &filter).await? {
                print_job_line(&j);
            }
        }

        JobsCmd::Show { id } => {
            let pool = ngt_db::connect_from_env().await?;
            let Some(j) = ngt_db::job_fetch(&pool, id).await? else {
                bail!("job {id} not found");
            };
            print_job_line(&j);
            println!("source={}", opt_str(&j.source));
            println!("request_text={}", opt_str(&j.request_text));
            println!("lease_owner={}", opt_str(&j.lease_owner));
            println!("lease_expires_at={}", opt_dt(&j.lease_expires_at));
            println!("started_at={}", opt_dt(&j.started_at));
            println!("completed_at={}", opt_dt(&j.completed_at));
            println!("last_error={}", opt_str(&j.last_error));
            println!("payload={}", j.payload);
            println!(
                "result={}",
                j.result.as_ref().map(|r| r.to_string()).unwrap_or_default()
            );
        }

        JobsCmd::Archive { id } => {
            let pool = ngt_db::connect_from_env().await?;
            let archived = ngt_db::job_archive(&pool, id).await?;
            println!("archived={archived} job_id={id}");
        }

        JobsCmd::Rerun { id } => {
            let pool = ngt_db::connect_from_env().await?;
            let new_id = ngt_db::job_rerun(&pool, id).await?;
            println!("rerun=true job_id={new_id} original_job_id={id}");
        }
    }
    Ok(())
}
