mod cli;

use clap::{CommandFactory, Parser, error::ErrorKind};
use serde_json::Value;
use tokio::sync::mpsc;

use tabrelay::bridge::{self, BridgeConfig};
use tabrelay::config;
use tabrelay::error::{AppError, ExitCode};
use tabrelay::logging;
use tabrelay::relay::{
    self, RelayConfig, RelayState, ownership, spawn_hub, spawn_recorder,
};

use cli::{
    BridgeArgs, Cli, Command, CompletionsArgs, ConfigArgs, ConfigCommand, GlobalOpts, ManArgs,
    RecordArgs, RecordCommand, RecordSessionArgs, RecordStartArgs, ServeArgs, Shell,
};

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // --help and --version are informational, not errors — print as-is
            if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) {
                e.print().expect("failed to write to stdout");
                std::process::exit(0);
            }
            // All other clap errors → JSON on stderr with exit code 1
            let msg = e.kind().to_string();
            let full = e.to_string();
            let clean = full
                .lines()
                .filter(|line| {
                    let trimmed = line.trim();
                    !trimmed.is_empty()
                        && !trimmed.starts_with("For more information")
                        && !trimmed.starts_with("Usage:")
                })
                .map(|line| line.strip_prefix("error: ").unwrap_or(line).trim())
                .collect::<Vec<_>>()
                .join(", ");
            let clean = if clean.is_empty() { msg } else { clean };
            let app_err = AppError {
                message: clean,
                code: ExitCode::GeneralError,
            };
            app_err.print_json_stderr();
            std::process::exit(app_err.code as i32);
        }
    };

    if let Err(e) = run(&cli).await {
        e.print_json_stderr();
        std::process::exit(e.code as i32);
    }
}

async fn run(cli: &Cli) -> Result<(), AppError> {
    let (config_path, config_file) = config::load_config(cli.global.config.as_deref());
    let resolved = config::resolve_config(&config_file, config_path);

    match &cli.command {
        Command::Serve(args) => execute_serve(&cli.global, args, &resolved).await,
        Command::Bridge(args) => execute_bridge(&cli.global, args, &resolved).await,
        Command::Record(args) => execute_record(&cli.global, args, &resolved).await,
        Command::Status => execute_status(&cli.global, &resolved).await,
        Command::Config(args) => execute_config(args, &resolved),
        Command::Completions(args) => execute_completions(args),
        Command::Man(args) => execute_man(args),
    }
}

/// Relay port resolution: `--port` > config file > default.
fn relay_port(global: &GlobalOpts, resolved: &config::ResolvedConfig) -> u16 {
    global.port.unwrap_or(resolved.server.port)
}

async fn execute_serve(
    global: &GlobalOpts,
    args: &ServeArgs,
    resolved: &config::ResolvedConfig,
) -> Result<(), AppError> {
    logging::init(&resolved.logging.level, &resolved.logging.dir)
        .map_err(|e| AppError::general(format!("logging setup failed: {e}")))?;

    let relay_config = RelayConfig {
        host: global.host.clone(),
        port: relay_port(global, resolved),
        token: args.token.clone().or_else(|| resolved.server.token.clone()),
        extension_origin: args
            .extension_origin
            .clone()
            .unwrap_or_else(|| resolved.server.extension_origin.clone()),
    };

    let listener = ownership::bind_or_evict(&relay_config.host, relay_config.port).await?;

    let (recorder_tx, recorder_rx) = mpsc::unbounded_channel();
    let hub = spawn_hub(recorder_tx);
    let recorder = spawn_recorder(hub.clone(), recorder_rx);
    let state = RelayState::new(hub, recorder, relay_config);

    relay::serve(listener, state)
        .await
        .map_err(|e| AppError::general(format!("relay server failed: {e}")))
}

async fn execute_bridge(
    global: &GlobalOpts,
    args: &BridgeArgs,
    resolved: &config::ResolvedConfig,
) -> Result<(), AppError> {
    logging::init(&resolved.logging.level, &resolved.logging.dir)
        .map_err(|e| AppError::general(format!("logging setup failed: {e}")))?;

    let bridge_config = BridgeConfig {
        relay_host: global.host.clone(),
        relay_port: relay_port(global, resolved),
        chrome_host: args.chrome_host.clone(),
        chrome_port: args.chrome_port,
        url_filter: args
            .url_filter
            .clone()
            .or_else(|| resolved.bridge.url_filter.clone()),
    };

    bridge::run_bridge(bridge_config).await
}

async fn execute_record(
    global: &GlobalOpts,
    args: &RecordArgs,
    resolved: &config::ResolvedConfig,
) -> Result<(), AppError> {
    let host = &global.host;
    let port = relay_port(global, resolved);

    let reply = match &args.command {
        RecordCommand::Start(start) => record_start(host, port, start).await?,
        RecordCommand::Stop(session) => {
            record_post(host, port, "/recording/stop", session).await?
        }
        RecordCommand::Status(session) => {
            let path = match &session.session {
                Some(sid) => format!("/recording/status?sessionId={}", urlencoding::encode(sid)),
                None => "/recording/status".to_string(),
            };
            ownership::http_request("GET", host, port, &path, None).await?
        }
        RecordCommand::Cancel(session) => {
            record_post(host, port, "/recording/cancel", session).await?
        }
    };

    let value: Value = serde_json::from_str(&reply)
        .map_err(|e| AppError::general(format!("unexpected relay reply: {e}")))?;
    print_value(global, &value)
}

async fn record_start(
    host: &str,
    port: u16,
    args: &RecordStartArgs,
) -> Result<String, AppError> {
    let mut body = serde_json::json!({ "outputPath": args.output });
    if let Some(session) = &args.session {
        body["sessionId"] = Value::String(session.clone());
    }
    if let Some(rate) = args.frame_rate {
        body["frameRate"] = Value::from(rate);
    }
    if let Some(bits) = args.video_bitrate {
        body["videoBitsPerSecond"] = Value::from(bits);
    }
    if let Some(bits) = args.audio_bitrate {
        body["audioBitsPerSecond"] = Value::from(bits);
    }
    if args.audio {
        body["audio"] = Value::Bool(true);
    }
    ownership::http_request("POST", host, port, "/recording/start", Some(&body.to_string()))
        .await
}

async fn record_post(
    host: &str,
    port: u16,
    path: &str,
    args: &RecordSessionArgs,
) -> Result<String, AppError> {
    let mut body = serde_json::json!({});
    if let Some(session) = &args.session {
        body["sessionId"] = Value::String(session.clone());
    }
    ownership::http_request("POST", host, port, path, Some(&body.to_string())).await
}

async fn execute_status(
    global: &GlobalOpts,
    resolved: &config::ResolvedConfig,
) -> Result<(), AppError> {
    let host = &global.host;
    let port = relay_port(global, resolved);

    if !ownership::probe(host, port).await {
        return Err(AppError::relay_unreachable(host, port));
    }
    let version_body = ownership::http_request("GET", host, port, "/version", None).await?;
    let version: Value = serde_json::from_str(&version_body).unwrap_or(Value::Null);

    let status = serde_json::json!({
        "reachable": true,
        "host": host,
        "port": port,
        "version": version.get("version").cloned().unwrap_or(Value::Null),
    });
    print_value(global, &status)
}

fn execute_config(args: &ConfigArgs, resolved: &config::ResolvedConfig) -> Result<(), AppError> {
    match &args.command {
        ConfigCommand::Show => {
            let json = serde_json::to_string_pretty(resolved).map_err(|e| {
                AppError::general(format!("serialization error: {e}"))
            })?;
            println!("{json}");
            Ok(())
        }
        ConfigCommand::Init(init) => {
            let path = config::init_config(init.path.as_deref())?;
            println!("{}", serde_json::json!({ "created": path }));
            Ok(())
        }
    }
}

fn execute_completions(args: &CompletionsArgs) -> Result<(), AppError> {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    let shell = match args.shell {
        Shell::Bash => clap_complete::Shell::Bash,
        Shell::Zsh => clap_complete::Shell::Zsh,
        Shell::Fish => clap_complete::Shell::Fish,
        Shell::Elvish => clap_complete::Shell::Elvish,
        Shell::Powershell => clap_complete::Shell::PowerShell,
    };
    clap_complete::generate(shell, &mut cmd, name, &mut std::io::stdout());
    Ok(())
}

fn execute_man(args: &ManArgs) -> Result<(), AppError> {
    std::fs::create_dir_all(&args.out_dir)
        .map_err(|e| AppError::general(format!("cannot create {}: {e}", args.out_dir.display())))?;
    let cmd = Cli::command();
    let man = clap_mangen::Man::new(cmd);
    let mut buf = Vec::new();
    man.render(&mut buf)
        .map_err(|e| AppError::general(format!("man render failed: {e}")))?;
    let path = args.out_dir.join("tabrelay.1");
    std::fs::write(&path, buf)
        .map_err(|e| AppError::general(format!("cannot write {}: {e}", path.display())))?;
    println!("{}", serde_json::json!({ "written": path }));
    Ok(())
}

fn print_value(global: &GlobalOpts, value: &Value) -> Result<(), AppError> {
    if global.output.plain {
        print!("{}", format_plain(value));
        return Ok(());
    }
    let json = if global.output.pretty {
        serde_json::to_string_pretty(value)
    } else {
        serde_json::to_string(value)
    };
    let json = json.map_err(|e| AppError::general(format!("serialization error: {e}")))?;
    println!("{json}");
    Ok(())
}

fn format_plain(value: &Value) -> String {
    use std::fmt::Write;
    let mut out = String::new();
    match value.as_object() {
        Some(map) => {
            for (key, entry) in map {
                match entry {
                    Value::String(s) => {
                        let _ = writeln!(out, "{key}: {s}");
                    }
                    other => {
                        let _ = writeln!(out, "{key}: {other}");
                    }
                }
            }
        }
        None => {
            let _ = writeln!(out, "{value}");
        }
    }
    out
}
