//! hubwire - demo hub server and tooling.

use mimalloc::MiMalloc;

/// Global allocator configured per M-MIMALLOC-APPS guideline.
/// mimalloc provides better multi-threaded performance than the system allocator.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures_util::stream::{self, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use hubwire::{HubException, HubMethods, HubOptions, HubReturn, HubServer, MethodSpec, ParamType};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "hubwire")]
#[command(version = VERSION)]
#[command(about = "Real-time hub messaging server")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the demo hub over TCP
    Serve {
        /// Listen address (overrides config)
        #[arg(long)]
        bind: Option<String>,
        /// Send error details to clients
        #[arg(long)]
        detailed_errors: bool,
    },
    /// List the hub protocols this build supports
    Protocols,
    /// Print the effective configuration
    Config,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            bind,
            detailed_errors,
        } => {
            let mut options = HubOptions::load()?;
            if let Some(bind) = bind {
                options.bind_addr = bind;
            }
            options.enable_detailed_errors |= detailed_errors;
            tokio::runtime::Runtime::new()
                .context("Failed to start tokio runtime")?
                .block_on(serve(options))?;
        }
        Commands::Protocols => {
            let options = HubOptions::default();
            for protocol in options.protocol_registry()?.iter() {
                println!(
                    "{:<6} v{} ({:?})",
                    protocol.name(),
                    protocol.version(),
                    protocol.transfer_format()
                );
            }
        }
        Commands::Config => {
            let options = HubOptions::load()?;
            println!("# {}", HubOptions::config_dir()?.join("config.json").display());
            println!("{}", serde_json::to_string_pretty(&options)?);
        }
    }

    Ok(())
}

async fn serve(options: HubOptions) -> Result<()> {
    let listener = TcpListener::bind(&options.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", options.bind_addr))?;
    let server = HubServer::builder()
        .options(options)
        .methods(demo_methods())
        .build()?;

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("[Hub] Ctrl-C received, shutting down");
        }
        on_signal.cancel();
    });

    server.serve_until(listener, shutdown).await
}

fn string_arg(args: &[Value], index: usize) -> String {
    args.get(index)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Methods of the demo chat hub.
fn demo_methods() -> HubMethods {
    HubMethods::builder()
        .method("Echo", MethodSpec::new(vec![ParamType::Any]), |_ctx, args| async move {
            Ok(HubReturn::Value(args.into_iter().next().unwrap_or(Value::Null)))
        })
        .method(
            "Broadcast",
            MethodSpec::new(vec![ParamType::String, ParamType::String]),
            |ctx, args| async move {
                ctx.clients().all().send("Broadcast", args).await?;
                Ok(HubReturn::Void)
            },
        )
        .method("JoinGroup", MethodSpec::new(vec![ParamType::String]), |ctx, args| async move {
            let group = string_arg(&args, 0);
            if group.is_empty() {
                return Err(HubException::new("Group name must not be empty.").into());
            }
            ctx.groups().add_to_group(ctx.connection_id(), &group).await?;
            ctx.clients()
                .group(group.clone())
                .send("Joined", vec![json!(group), json!(ctx.connection_id())])
                .await?;
            Ok(HubReturn::Void)
        })
        .method("LeaveGroup", MethodSpec::new(vec![ParamType::String]), |ctx, args| async move {
            let group = string_arg(&args, 0);
            ctx.groups().remove_from_group(ctx.connection_id(), &group).await?;
            ctx.clients()
                .group(group.clone())
                .send("Left", vec![json!(group), json!(ctx.connection_id())])
                .await?;
            Ok(HubReturn::Void)
        })
        .method(
            "SendToGroup",
            MethodSpec::new(vec![ParamType::String, ParamType::String]),
            |ctx, args| async move {
                let group = string_arg(&args, 0);
                let message = string_arg(&args, 1);
                ctx.clients()
                    .group(group.clone())
                    .send("GroupMessage", vec![json!(group), json!(message)])
                    .await?;
                Ok(HubReturn::Void)
            },
        )
        .method(
            "Counter",
            MethodSpec::new(vec![ParamType::Int, ParamType::Int]).streaming(),
            |_ctx, args| async move {
                let count = args.first().and_then(Value::as_i64).unwrap_or(0).max(0);
                let delay = Duration::from_millis(args.get(1).and_then(Value::as_u64).unwrap_or(0));
                Ok(HubReturn::stream(stream::iter(0..count).then(move |i| async move {
                    tokio::time::sleep(delay).await;
                    Ok::<_, anyhow::Error>(json!(i))
                })))
            },
        )
        .method(
            "Concat",
            MethodSpec::new(vec![]).with_upload_stream(ParamType::String),
            |mut ctx, _args| async move {
                let upload = ctx
                    .take_upload_stream()
                    .context("Concat expects an upload stream")?;
                let parts = upload.collect().await?;
                let joined: String = parts.iter().filter_map(Value::as_str).collect();
                Ok(HubReturn::Value(json!(joined)))
            },
        )
        .on_connected(|ctx| async move {
            log::info!("[Demo] {} joined", ctx.connection_id());
            Ok(())
        })
        .on_disconnected(|ctx, error| async move {
            match error {
                Some(error) => log::info!("[Demo] {} left: {error}", ctx.connection_id()),
                None => log::info!("[Demo] {} left", ctx.connection_id()),
            }
            Ok(())
        })
        .build()
}
