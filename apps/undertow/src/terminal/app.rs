use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::connection::ConnectionState;
use crate::effect::Effect;
use crate::events::DomEvent;
use crate::metrics;
use crate::protocol::{EventKind, decode_client_bytes, decode_server_bytes};
use crate::renderer::{self, RendererConfig, RendererHandle};
use crate::server::counter::CounterView;
use crate::server::{ServerHost, TokenIssuer, ViewFactory};
use crate::telemetry::hexdump;
use crate::terminal::cli::{self, Command, ConnectArgs, DecodeArgs, Direction, ServeArgs, TokenArgs};
use crate::terminal::error::CliError;
use crate::transport::{WebSocketConnector, WebSocketListener};

pub async fn run(cli: cli::Cli) -> Result<(), CliError> {
    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Connect(args) => connect(args).await,
        Command::Decode(args) => decode(&args),
        Command::Token(args) => token(args),
    }
}

async fn serve(args: ServeArgs) -> Result<(), CliError> {
    let config = Config::from_env()?;
    let factory: ViewFactory = Arc::new(|| Box::new(CounterView::new()));
    let host = ServerHost::new(&config, factory);
    let listener = WebSocketListener::bind(args.listen).await?;
    let addr = listener.local_addr()?;
    info!(target = "undertow::cli", %addr, "serving counter view");
    println!("listening on ws://{addr}");

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal.cancel();
        }
    });
    host.serve_websocket(listener, shutdown).await?;

    if args.print_metrics {
        print!("{}", metrics::gather_text()?);
    }
    Ok(())
}

async fn connect(args: ConnectArgs) -> Result<(), CliError> {
    let config = Config::from_env()?;
    let token = match args.token {
        Some(token) => token,
        None => TokenIssuer::new(&config.server.secret).issue()?,
    };
    let connector = WebSocketConnector::new(args.url.clone())?;
    let mut handle = renderer::spawn(RendererConfig::from_config(&config, token), Arc::new(connector));

    wait_connected(&mut handle).await?;
    println!("connected to {}", args.url);

    for node in &args.clicks {
        handle.interact(DomEvent::new(node.as_str(), EventKind::Click { x: 0, y: 0 }));
    }

    let linger = async {
        if args.follow {
            let _ = tokio::signal::ctrl_c().await;
        } else {
            tokio::time::sleep(Duration::from_millis(args.linger_ms)).await;
        }
    };
    tokio::pin!(linger);
    loop {
        tokio::select! {
            _ = &mut linger => break,
            effect = handle.next_effect() => match effect {
                Some(effect) => report(&effect),
                None => break,
            },
        }
    }

    if let Some(snapshot) = handle.snapshot().await {
        match snapshot.tree.to_json() {
            Ok(json) => println!("{json}"),
            Err(err) => warn!(target = "undertow::cli", error = %err, "failed to serialise tree"),
        }
    }
    handle.stop();
    handle.join().await;
    Ok(())
}

async fn wait_connected(handle: &mut RendererHandle) -> Result<(), CliError> {
    let mut state = handle.state_watch();
    loop {
        if *state.borrow_and_update() == ConnectionState::Connected {
            return Ok(());
        }
        tokio::select! {
            changed = state.changed() => {
                if changed.is_err() {
                    return Err(CliError::Session("renderer stopped".into()));
                }
            }
            effect = handle.next_effect() => match effect {
                Some(Effect::HandshakeRejected(reason)) => {
                    return Err(CliError::Session(format!("handshake rejected: {reason}")));
                }
                Some(Effect::GaveUp { attempts }) => {
                    return Err(CliError::Session(format!("gave up after {attempts} attempts")));
                }
                Some(effect) => report(&effect),
                None => return Err(CliError::Session("renderer stopped".into())),
            },
        }
    }
}

fn report(effect: &Effect) {
    info!(target = "undertow::cli", effect = effect.label(), "effect");
    println!("effect: {effect:?}");
}

fn decode(args: &DecodeArgs) -> Result<(), CliError> {
    let compact: String = args.hex.split_whitespace().collect();
    let bytes = hex::decode(compact)?;
    print!("{}", hexdump(&bytes));
    match args.from {
        Direction::Client => println!("{:#?}", decode_client_bytes(&bytes)?),
        Direction::Server => println!("{:#?}", decode_server_bytes(&bytes)?),
    }
    Ok(())
}

fn token(args: TokenArgs) -> Result<(), CliError> {
    let secret = match args.secret {
        Some(secret) => secret,
        None => Config::from_env()?.server.secret,
    };
    if secret.is_empty() {
        return Err(CliError::InvalidArgument("secret must not be empty".into()));
    }
    println!("{}", TokenIssuer::new(&secret).issue()?);
    Ok(())
}
