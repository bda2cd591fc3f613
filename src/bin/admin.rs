use std::collections::VecDeque;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use trace_analyzer::domain::TraceId;
use trace_analyzer::infra::{
    FailureLog, PgAnalysisStore, PgFailureLog, RedisTraceQueue, DEFAULT_QUEUE_KEY,
};

fn print_help() {
    eprintln!(
        "\
trace-analyzer-admin

USAGE:
  trace-analyzer-admin <command> [options]

COMMANDS:
  migrate                         Run database migrations
  enqueue                         Push trace ids onto the analysis queue
  requeue-unanalyzed              Re-enqueue traces that were never analyzed
  backlog                         Show unanalyzed traces and queue length
  failures                        List traces whose analysis failed

COMMON OPTIONS:
  --database-url <postgres_url>    (defaults to env DATABASE_URL)
  --redis-url <redis_url>          (defaults to env REDIS_URL)
  --queue-key <key>                (defaults to env TRACES_QUEUE_KEY or traces_to_analyze)

enqueue OPTIONS:
  --trace-id <uuid>               (required, repeatable)

requeue-unanalyzed OPTIONS:
  --limit <n>                     (default: 1000)
  --dry-run

failures OPTIONS:
  --limit <n>                     (default: 50)
"
    );
}

/// Options shared by every command
#[derive(Debug, Default)]
struct Options {
    database_url: Option<String>,
    redis_url: Option<String>,
    queue_key: Option<String>,
    trace_ids: Vec<TraceId>,
    limit: Option<i64>,
    dry_run: bool,
}

enum Parsed {
    Run(Options),
    Help,
}

fn parse_options(args: &mut VecDeque<String>) -> anyhow::Result<Parsed> {
    let mut options = Options::default();

    while let Some(arg) = args.pop_front() {
        match arg.as_str() {
            "--database-url" => options.database_url = Some(value(args, &arg)?),
            "--redis-url" => options.redis_url = Some(value(args, &arg)?),
            "--queue-key" => options.queue_key = Some(value(args, &arg)?),
            "--trace-id" => {
                let raw = value(args, &arg)?;
                let trace_id = TraceId::parse(&raw)
                    .ok_or_else(|| anyhow::anyhow!("invalid trace id: {raw}"))?;
                options.trace_ids.push(trace_id);
            }
            "--limit" => {
                let limit: i64 = value(args, &arg)?.parse()?;
                if limit <= 0 {
                    anyhow::bail!("--limit must be positive");
                }
                options.limit = Some(limit);
            }
            "--dry-run" => options.dry_run = true,
            "-h" | "--help" => return Ok(Parsed::Help),
            other => anyhow::bail!("unexpected argument: {other}"),
        }
    }

    Ok(Parsed::Run(options))
}

fn value(args: &mut VecDeque<String>, flag: &str) -> anyhow::Result<String> {
    args.pop_front()
        .ok_or_else(|| anyhow::anyhow!("missing value for {flag}"))
}

fn require_database_url(database_url: Option<String>) -> anyhow::Result<String> {
    database_url
        .or_else(|| std::env::var("DATABASE_URL").ok())
        .ok_or_else(|| anyhow::anyhow!("DATABASE_URL is required (or pass --database-url)"))
}

fn require_redis_url(redis_url: Option<String>) -> anyhow::Result<String> {
    redis_url
        .or_else(|| std::env::var("REDIS_URL").ok())
        .ok_or_else(|| anyhow::anyhow!("REDIS_URL is required (or pass --redis-url)"))
}

fn queue_key(queue_key: Option<String>) -> String {
    queue_key
        .or_else(|| std::env::var("TRACES_QUEUE_KEY").ok())
        .unwrap_or_else(|| DEFAULT_QUEUE_KEY.to_string())
}

async fn connect_pool(database_url: Option<String>) -> anyhow::Result<PgPool> {
    let database_url = require_database_url(database_url)?;
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await?;
    Ok(pool)
}

async fn connect_queue(options: &Options) -> anyhow::Result<RedisTraceQueue> {
    let redis_url = require_redis_url(options.redis_url.clone())?;
    let queue = RedisTraceQueue::connect(&redis_url, queue_key(options.queue_key.clone())).await?;
    Ok(queue)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut args: VecDeque<String> = std::env::args().skip(1).collect();
    let Some(command) = args.pop_front() else {
        print_help();
        return Ok(());
    };

    if matches!(command.as_str(), "-h" | "--help" | "help") {
        print_help();
        return Ok(());
    }

    let options = match parse_options(&mut args)? {
        Parsed::Run(options) => options,
        Parsed::Help => {
            print_help();
            return Ok(());
        }
    };

    match command.as_str() {
        "migrate" => {
            let pool = connect_pool(options.database_url).await?;
            trace_analyzer::migrations::run_postgres(&pool).await?;
            println!("ok: migrations applied");
            Ok(())
        }
        "enqueue" => {
            if options.trace_ids.is_empty() {
                anyhow::bail!("enqueue requires at least one --trace-id");
            }
            let queue = connect_queue(&options).await?;
            queue.push_many(&options.trace_ids).await?;
            println!(
                "ok: enqueued {} trace(s) on {}",
                options.trace_ids.len(),
                queue.key()
            );
            Ok(())
        }
        "requeue-unanalyzed" => {
            let limit = options.limit.unwrap_or(1000);
            let pool = connect_pool(options.database_url.clone()).await?;
            let store = PgAnalysisStore::new(pool);
            let trace_ids = store.unanalyzed_trace_ids(limit).await?;

            if options.dry_run {
                for trace_id in &trace_ids {
                    println!("{trace_id}");
                }
                println!("dry-run: would requeue {} trace(s)", trace_ids.len());
                return Ok(());
            }

            let queue = connect_queue(&options).await?;
            queue.push_many(&trace_ids).await?;
            println!(
                "ok: requeued {} unanalyzed trace(s) on {}",
                trace_ids.len(),
                queue.key()
            );
            Ok(())
        }
        "backlog" => {
            let pool = connect_pool(options.database_url.clone()).await?;
            let store = PgAnalysisStore::new(pool.clone());
            let unanalyzed = store.count_unanalyzed().await?;
            let failed = PgFailureLog::new(pool).count().await?;

            // The queue is optional here; the database numbers stand alone.
            let queued = match require_redis_url(options.redis_url.clone()) {
                Ok(_) => Some(connect_queue(&options).await?.len().await?),
                Err(_) => None,
            };

            let report = serde_json::json!({
                "unanalyzed": unanalyzed,
                "failed": failed,
                "queued": queued,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        "failures" => {
            let limit = options.limit.unwrap_or(50);
            let pool = connect_pool(options.database_url).await?;
            let failure_log = PgFailureLog::new(pool);

            let stats = failure_log.stats().await?;
            let failures = failure_log.list(limit).await?;

            eprintln!("failures: {}", serde_json::to_string(&stats)?);
            for failure in failures {
                println!("{}", serde_json::to_string(&failure)?);
            }
            Ok(())
        }
        other => {
            print_help();
            anyhow::bail!("unknown command: {other}")
        }
    }
}
