use std::io::Write;
use std::path::PathBuf;
use std::process;

use anyhow::Context;
use ragbridge::{
    BridgeConfig, BridgeError, EngineBridge, EngineClient, IndexOptions, QueryOptions,
    StartupError, WorkerError,
};
use serde_json::{Value, json};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const USAGE: &str = "\
Usage: rag-bridge [--engine-dir <dir>] <command>

Commands:
  health                          Check the engine
  index <path> [--force]          Index a directory
  query <text> [--top-k <n>] [--stream]
                                  Ask a question
  config get [<key>]              Show one setting, or all of them
  config set <key> <json-value>   Change a setting

Options:
  --engine-dir <dir>   Engine directory containing main.py [default: .]";

#[derive(Debug, PartialEq)]
enum Command {
    Health,
    Index { path: PathBuf, force: bool },
    Query { text: String, top_k: usize, stream: bool },
    ConfigGet { key: Option<String> },
    ConfigSet { key: String, value: Value },
}

#[derive(Debug, PartialEq)]
struct Args {
    engine_dir: PathBuf,
    command: Command,
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let args = match parse_args(&args) {
        Ok(args) => args,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("{USAGE}");
            process::exit(2);
        }
    };

    init_tracing();

    let bridge = EngineBridge::new(BridgeConfig::python_engine(&args.engine_dir));
    let result = run(&bridge, args.command).await;
    bridge.stop().await;

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        if let Some(help) = remediation(&e) {
            eprintln!("hint: {help}");
        }
        process::exit(1);
    }
}

/// Initialize tracing with RAG_LOG and LOG_FORMAT support.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("RAG_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("info") => "info",
            Ok("error") => "error",
            _ => "warn",
        };
        EnvFilter::new(format!("ragbridge={level},ragbridge_cli={level}"))
    };

    if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    let mut engine_dir = PathBuf::from(".");
    let mut force = false;
    let mut stream = false;
    let mut top_k = QueryOptions::default().top_k;
    let mut positional: Vec<&str> = Vec::new();

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--engine-dir" => {
                i += 1;
                engine_dir = PathBuf::from(args.get(i).ok_or("--engine-dir requires a value")?);
            }
            "--top-k" => {
                i += 1;
                let raw = args.get(i).ok_or("--top-k requires a value")?;
                top_k = raw
                    .parse::<usize>()
                    .ok()
                    .filter(|k| *k > 0)
                    .ok_or_else(|| format!("invalid --top-k '{raw}'"))?;
            }
            "--force" => force = true,
            "--stream" => stream = true,
            "--help" | "-h" => return Err(String::new()),
            arg if arg.starts_with('-') && arg.len() > 1 => {
                return Err(format!("unknown flag: {arg}"));
            }
            arg => positional.push(arg),
        }
        i += 1;
    }

    let command = match positional.as_slice() {
        ["health"] => Command::Health,
        ["index", path] => Command::Index {
            path: PathBuf::from(path),
            force,
        },
        ["query", text] => Command::Query {
            text: text.to_string(),
            top_k,
            stream,
        },
        ["config", "get"] => Command::ConfigGet { key: None },
        ["config", "get", key] => Command::ConfigGet {
            key: Some(key.to_string()),
        },
        ["config", "set", key, raw] => Command::ConfigSet {
            key: key.to_string(),
            // Bare words are taken as strings.
            value: serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string())),
        },
        [] => return Err("missing command".to_string()),
        other => return Err(format!("unrecognised command: {}", other.join(" "))),
    };
    Ok(Args {
        engine_dir,
        command,
    })
}

async fn run(bridge: &EngineBridge, command: Command) -> anyhow::Result<()> {
    bridge.start().await.context("failed to start the engine")?;
    let client = EngineClient::new(bridge.clone());

    match command {
        Command::Health => print_json(&client.health().await?)?,
        Command::Index { path, force } => {
            let options = IndexOptions {
                force,
                ..IndexOptions::default()
            };
            print_json(&client.index(&path, options).await?)?;
        }
        Command::Query {
            text,
            top_k,
            stream: false,
        } => print_json(&client.query(&text, QueryOptions { top_k }).await?)?,
        Command::Query {
            text,
            top_k,
            stream: true,
        } => stream_answer(&client, &text, top_k).await?,
        Command::ConfigGet { key: Some(key) } => match client.config_get(&key).await? {
            Some(value) => print_json(&value)?,
            None => anyhow::bail!("`{key}` is not set"),
        },
        Command::ConfigGet { key: None } => print_json(&client.config_all().await?)?,
        Command::ConfigSet { key, value } => {
            client.config_set(&key, value.clone()).await?;
            tracing::info!(key = %key, "Setting updated");
            print_json(&updated_setting(&key, value))?;
        }
    }
    Ok(())
}

/// Print tokens as they arrive, then the cited sources.
async fn stream_answer(client: &EngineClient, text: &str, top_k: usize) -> anyhow::Result<()> {
    let mut stream = client.query_stream(text, QueryOptions { top_k }).await?;
    let mut sources = Vec::new();
    while let Some(chunk) = stream.next_chunk().await? {
        match chunk.kind.as_str() {
            "token" => {
                if let Some(content) = &chunk.content {
                    let mut stdout = std::io::stdout().lock();
                    stdout.write_all(content.as_bytes())?;
                    stdout.flush()?;
                }
            }
            "source" => {
                if let Some(source) = chunk.as_source() {
                    sources.push(source?);
                }
            }
            _ => {
                // A worker that does not stream sends the whole answer at once.
                if let Some(data) = chunk.data {
                    serde_json::to_writer_pretty(std::io::stdout().lock(), &data)?;
                }
            }
        }
    }
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout)?;
    if !sources.is_empty() {
        serde_json::to_writer_pretty(&mut stdout, &sources)?;
        writeln!(stdout)?;
    }
    Ok(())
}

/// What `config set` prints on success.
fn updated_setting(key: &str, value: Value) -> Value {
    json!({"key": key, "value": value})
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// The worker's remediation hint for a failure, if it carries one.
fn remediation(err: &anyhow::Error) -> Option<&str> {
    let worker: &WorkerError = err
        .downcast_ref::<BridgeError>()
        .and_then(BridgeError::worker_error)
        .or_else(|| match err.downcast_ref::<StartupError>() {
            Some(StartupError::Rejected(e)) => Some(e),
            _ => None,
        })?;
    worker.help()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Args, String> {
        let args: Vec<String> = std::iter::once("rag-bridge")
            .chain(args.iter().copied())
            .map(String::from)
            .collect();
        parse_args(&args)
    }

    #[test]
    fn query_with_options() {
        let args = parse(&["--engine-dir", "/opt/engine", "query", "why?", "--top-k", "3", "--stream"])
            .unwrap();
        assert_eq!(args.engine_dir, PathBuf::from("/opt/engine"));
        assert_eq!(
            args.command,
            Command::Query {
                text: "why?".to_string(),
                top_k: 3,
                stream: true
            }
        );
    }

    #[test]
    fn config_set_parses_json_values() {
        let args = parse(&["config", "set", "llm.temperature", "0.2"]).unwrap();
        assert_eq!(
            args.command,
            Command::ConfigSet {
                key: "llm.temperature".to_string(),
                value: serde_json::json!(0.2)
            }
        );

        let args = parse(&["config", "set", "llm.model", "llama3"]).unwrap();
        assert_eq!(
            args.command,
            Command::ConfigSet {
                key: "llm.model".to_string(),
                value: Value::String("llama3".to_string())
            }
        );
    }

    #[test]
    fn config_set_reports_key_and_value() {
        assert_eq!(
            updated_setting("llm.temperature", serde_json::json!(0.2)),
            serde_json::json!({"key": "llm.temperature", "value": 0.2})
        );
    }

    #[test]
    fn usage_errors() {
        assert_eq!(parse(&[]).unwrap_err(), "missing command");
        assert_eq!(parse(&["--top-k", "0", "query", "x"]).unwrap_err(), "invalid --top-k '0'");
        assert_eq!(parse(&["--verbose", "health"]).unwrap_err(), "unknown flag: --verbose");
        assert_eq!(parse(&["index"]).unwrap_err(), "unrecognised command: index");
        assert_eq!(parse(&["--help"]).unwrap_err(), "");
    }
}
