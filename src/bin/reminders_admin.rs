use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;

use care_reminders::config::{self, Config};
use care_reminders::db::{self, Pool};
use care_reminders::intake::{self, AppointmentReminder, CheckInPlan};
use care_reminders::model::{ChannelKind, SubjectType};

#[derive(Debug, Parser)]
#[command(about = "Schedule, cancel and inspect reminder events")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create or reschedule the reminders of an appointment
    ScheduleAppointment {
        #[arg(long)]
        id: String,
        #[arg(long)]
        recipient: String,
        #[arg(long, default_value = "email")]
        channel: String,
        /// Appointment start, RFC 3339
        #[arg(long)]
        starts_at: String,
        /// Template parameters as a JSON object
        #[arg(long, default_value = "{}")]
        payload: String,
    },
    /// Create the first occurrence of a recurring check-in
    ScheduleCheckIn {
        #[arg(long)]
        plan: String,
        #[arg(long)]
        recipient: String,
        #[arg(long, default_value = "push")]
        channel: String,
        /// First occurrence, RFC 3339
        #[arg(long)]
        first_at: String,
        #[arg(long, default_value_t = 86_400)]
        every_secs: i64,
        #[arg(long, default_value = "{}")]
        payload: String,
    },
    /// Cancel every pending event of an appointment or check-in plan
    Cancel {
        /// appointment | check_in
        #[arg(long)]
        subject_type: String,
        #[arg(long)]
        subject_id: String,
    },
    /// List failed events, most recent first
    Failed {
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },
    /// Show the delivery attempts of one event
    Attempts {
        #[arg(long)]
        event_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;
    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| cfg.default_database_url());
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    run(&cfg, &pool, args.command).await
}

async fn run(cfg: &Config, pool: &Pool, command: Command) -> Result<()> {
    let now = Utc::now();
    match command {
        Command::ScheduleAppointment {
            id,
            recipient,
            channel,
            starts_at,
            payload,
        } => {
            let reminder = AppointmentReminder {
                appointment_id: id,
                recipient_id: recipient,
                channel: parse_channel(&channel)?,
                starts_at: parse_time(&starts_at)?,
                payload: parse_payload(&payload)?,
            };
            let results =
                intake::schedule_appointment(pool, &reminder, &cfg.appointments.lead_minutes, now)
                    .await?;
            for (event_id, outcome) in results {
                println!("{}\t{:?}", event_id, outcome);
            }
        }
        Command::ScheduleCheckIn {
            plan,
            recipient,
            channel,
            first_at,
            every_secs,
            payload,
        } => {
            let plan = CheckInPlan {
                plan_id: plan,
                recipient_id: recipient,
                channel: parse_channel(&channel)?,
                first_at: parse_time(&first_at)?,
                every_secs,
                payload: parse_payload(&payload)?,
            };
            let (event_id, outcome) = intake::schedule_check_in(pool, &plan, now).await?;
            println!("{}\t{:?}", event_id, outcome);
        }
        Command::Cancel {
            subject_type,
            subject_id,
        } => {
            let subject = SubjectType::parse_subject(&subject_type)
                .ok_or_else(|| anyhow!("unknown subject type '{}'", subject_type))?;
            let n = intake::cancel_subject(pool, subject, &subject_id, now).await?;
            println!("cancelled {} event(s)", n);
        }
        Command::Failed { limit } => {
            let failed = db::list_failed_events(pool, limit).await?;
            if failed.is_empty() {
                println!("no failed events");
            }
            for f in failed {
                println!(
                    "{}\t{}\t{}\tattempts={}\t{}",
                    f.event.id,
                    f.event.channel.as_str(),
                    f.event.target_at.to_rfc3339(),
                    f.attempts,
                    f.last_error.as_deref().unwrap_or("-")
                );
            }
        }
        Command::Attempts { event_id } => {
            let event = db::fetch_event(pool, &event_id)
                .await?
                .ok_or_else(|| anyhow!("event '{}' not found", event_id))?;
            println!(
                "{}\t{}\ttarget={}",
                event.id,
                event.status.as_str(),
                event.target_at.to_rfc3339()
            );
            for a in db::list_attempts(pool, &event_id).await? {
                println!(
                    "  #{}\t{}\t{}\t{}\t{}",
                    a.attempt_no,
                    a.attempted_at.to_rfc3339(),
                    a.channel.as_str(),
                    a.outcome.as_str(),
                    a.error.as_deref().unwrap_or("")
                );
            }
        }
    }
    Ok(())
}

fn parse_channel(s: &str) -> Result<ChannelKind> {
    ChannelKind::parse_channel(s).ok_or_else(|| anyhow!("unknown channel '{}'", s))
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    let t = DateTime::parse_from_rfc3339(s).with_context(|| format!("invalid timestamp '{}'", s))?;
    Ok(t.with_timezone(&Utc))
}

fn parse_payload(s: &str) -> Result<Value> {
    serde_json::from_str(s).context("payload must be valid JSON")
}
