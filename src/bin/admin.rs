use std::collections::VecDeque;
use std::io::Write;
use std::pin::Pin;
use std::sync::Arc;

use futures::{Stream, TryStreamExt};

use theras_distribution::distributor::{Distributor, MAX_PAGE_SIZE};
use theras_distribution::server::{AppState, Config, Storage, StorageBackend};
use theras_distribution::{Event, ProjectKey, RuleEngine, UserId};

type EventStream<'a> = Pin<Box<dyn Stream<Item = theras_distribution::Result<Event>> + 'a>>;

fn print_help() {
    eprintln!(
        "\
theras-admin

USAGE:
  theras-admin <command> [options]

COMMANDS:
  migrate                         Run database migrations
  export-events                   Export a user's (or project's) ledger as JSON/NDJSON
  verify-balances                 Recompute a project's wallets and report drift

COMMON OPTIONS:
  --database-url <url>            postgres://... or sqlite:... (defaults to env DATABASE_URL)

export-events OPTIONS:
  --project-key <key>             (required)
  --user-id <id>                  (optional; otherwise every user of the project)
  --after <n>                     (optional) Only events with a greater sequence
  --output <path>                 (optional) Output file path (default: stdout)
  --format <json|ndjson>          (default: ndjson)

verify-balances OPTIONS:
  --project-key <key>             (required)
  --rules <path>                  (optional; defaults to env RULES_PATH, then built-in rules)
"
    );
}

fn require_value(args: &mut VecDeque<String>, flag: &str) -> anyhow::Result<String> {
    args.pop_front()
        .ok_or_else(|| anyhow::anyhow!("missing value for {flag}"))
}

/// Server configuration with the storage taken from `--database-url`.
///
/// Migrations only run through the `migrate` command.
fn admin_config(database_url: Option<String>, migrate: bool) -> anyhow::Result<Config> {
    let mut config = Config::from_env()?;
    config.migrate_on_startup = migrate;
    if let Some(url) = database_url {
        config.backend = StorageBackend::parse(&url)?;
    }
    if config.backend == StorageBackend::Memory {
        anyhow::bail!("DATABASE_URL is required (or pass --database-url); the in-memory store has nothing to inspect");
    }
    Ok(config)
}

async fn open_distributor(config: &Config, rules: RuleEngine) -> anyhow::Result<Arc<Distributor>> {
    let storage = Storage::connect(config).await?;
    let state = AppState::new(&storage, Arc::new(rules), config.distributor_config());
    Ok(state.distributor)
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

    match command.as_str() {
        "migrate" => {
            let mut database_url: Option<String> = None;
            while let Some(arg) = args.pop_front() {
                match arg.as_str() {
                    "--database-url" => {
                        database_url = Some(require_value(&mut args, "--database-url")?);
                    }
                    "-h" | "--help" => {
                        print_help();
                        return Ok(());
                    }
                    other => anyhow::bail!("unexpected argument: {other}"),
                }
            }

            let config = admin_config(database_url, true)?;
            Storage::connect(&config).await?;
            println!("ok: migrations applied ({})", config.backend.name());
            Ok(())
        }
        "export-events" => {
            let mut database_url: Option<String> = None;
            let mut project_key: Option<ProjectKey> = None;
            let mut user_id: Option<UserId> = None;
            let mut after: Option<u64> = None;
            let mut output_path: Option<String> = None;
            let mut format = "ndjson".to_string();

            while let Some(arg) = args.pop_front() {
                match arg.as_str() {
                    "--database-url" => {
                        database_url = Some(require_value(&mut args, "--database-url")?);
                    }
                    "--project-key" => {
                        project_key = Some(require_value(&mut args, "--project-key")?.into());
                    }
                    "--user-id" => {
                        user_id = Some(require_value(&mut args, "--user-id")?.into());
                    }
                    "--after" => {
                        after = Some(require_value(&mut args, "--after")?.parse()?);
                    }
                    "--output" => {
                        output_path = Some(require_value(&mut args, "--output")?);
                    }
                    "--format" => {
                        format = require_value(&mut args, "--format")?;
                    }
                    "-h" | "--help" => {
                        print_help();
                        return Ok(());
                    }
                    other => anyhow::bail!("unexpected argument: {other}"),
                }
            }

            let project_key =
                project_key.ok_or_else(|| anyhow::anyhow!("--project-key is required"))?;
            if !matches!(format.as_str(), "json" | "ndjson") {
                anyhow::bail!("--format must be 'json' or 'ndjson'");
            }

            let config = admin_config(database_url, false)?;
            let distributor = open_distributor(&config, RuleEngine::builtin()?).await?;

            let mut events: EventStream<'_> = match user_id {
                Some(user_id) => {
                    Box::pin(distributor.replay(project_key, user_id, after, MAX_PAGE_SIZE))
                }
                None => Box::pin(distributor.replay_project(project_key, after, MAX_PAGE_SIZE)),
            };

            let mut output: Box<dyn Write> = match output_path {
                Some(path) => Box::new(std::io::BufWriter::new(std::fs::File::create(&path)?)),
                None => Box::new(std::io::stdout()),
            };

            let mut exported = 0usize;
            let mut collected = Vec::new();
            while let Some(event) = events.try_next().await? {
                exported += 1;
                if format == "ndjson" {
                    serde_json::to_writer(&mut output, &event)?;
                    writeln!(output)?;
                } else {
                    collected.push(event);
                }
            }

            if format == "json" {
                serde_json::to_writer_pretty(&mut output, &collected)?;
                writeln!(output)?;
            }
            output.flush()?;

            eprintln!("ok: exported {exported} events");
            Ok(())
        }
        "verify-balances" => {
            let mut database_url: Option<String> = None;
            let mut project_key: Option<ProjectKey> = None;
            let mut rules_path: Option<String> = None;

            while let Some(arg) = args.pop_front() {
                match arg.as_str() {
                    "--database-url" => {
                        database_url = Some(require_value(&mut args, "--database-url")?);
                    }
                    "--project-key" => {
                        project_key = Some(require_value(&mut args, "--project-key")?.into());
                    }
                    "--rules" => {
                        rules_path = Some(require_value(&mut args, "--rules")?);
                    }
                    "-h" | "--help" => {
                        print_help();
                        return Ok(());
                    }
                    other => anyhow::bail!("unexpected argument: {other}"),
                }
            }

            let project_key =
                project_key.ok_or_else(|| anyhow::anyhow!("--project-key is required"))?;

            let config = admin_config(database_url, false)?;
            let rules_path = rules_path
                .map(std::path::PathBuf::from)
                .or_else(|| config.rules_path.clone());
            let rules = RuleEngine::load(rules_path.as_deref())?;
            let distributor = open_distributor(&config, rules).await?;

            let drift = distributor.verify_balances(&project_key).await?;
            for d in &drift {
                println!(
                    "drift: user={} token={} stored={} expected={}",
                    d.key.user_id, d.key.token, d.stored, d.expected
                );
            }

            if drift.is_empty() {
                println!("ok: all balances of {project_key} match the ledger");
                Ok(())
            } else {
                anyhow::bail!("{} balance(s) of {project_key} drifted", drift.len())
            }
        }
        other => {
            print_help();
            anyhow::bail!("unknown command: {other}")
        }
    }
}
