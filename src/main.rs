// Copyright 2024 All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use reverse_tunnel::local_client::LocalHttp;
use reverse_tunnel::{
    connect, BridgeConfig, ConnectOptions, Endpoint, RelayConfig, RelayMode, RequestRelay,
    ResponseMode, TcpBridge,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Expose a local service through a tunnel broker.
#[derive(Debug, Parser)]
#[command(name = "reverse-tunnel", version)]
struct Cli {
    /// Tunnel broker host:port. Defaults to DAKWAK_TUNNEL_HOST, then
    /// tunnel.dakwak.com:443.
    #[arg(long)]
    host: Option<String>,

    /// Auth token.
    #[arg(long, env = "DAKWAK_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Pin a previously issued client id.
    #[arg(long)]
    apikey: Option<String>,

    /// Override the local forwarding host, keeping the endpoint's port.
    #[arg(long)]
    local: Option<String>,

    /// Stream http responses instead of buffering them.
    #[arg(long)]
    stream: bool,

    /// Maximum number of requests handled concurrently.
    #[arg(long, default_value_t = 64)]
    max_in_flight: usize,

    /// Relay mode.
    mode: Mode,

    /// Local service as host:port.
    endpoint: Endpoint,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Mode {
    /// Replay tunnel requests against a local HTTP server.
    Http,
    /// Relay raw bytes to a local TCP server.
    Tcp,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let Some(token) = cli.token.filter(|token| !token.is_empty()) else {
        error!("missing token, provide --token or set DAKWAK_TOKEN");
        return ExitCode::FAILURE;
    };

    let local_target = match cli.local.as_deref() {
        Some(host) if !host.is_empty() => cli.endpoint.with_host(host),
        _ => cli.endpoint.clone(),
    };
    let mode = match cli.mode {
        Mode::Http if cli.stream => RelayMode::Http(ResponseMode::Streamed),
        Mode::Http => RelayMode::Http(ResponseMode::Buffered),
        Mode::Tcp => RelayMode::Tcp,
    };
    info!(local = %local_target, ?mode, "connecting to tunnel");

    let options = ConnectOptions {
        broker_host: cli.host,
        token,
        api_key: cli.apikey,
        advertised_host: Some(local_target.to_string()),
    };
    let session = match connect(&options).await {
        Ok(session) => session,
        Err(err) => {
            error!(error = %err, "failed to connect to tunnel");
            return ExitCode::FAILURE;
        }
    };
    println!("Public URL: https://{}.tunnel.dakwak.com", session.client_id());

    let (client_id, writer, inbound) = session.into_parts();
    let writer = Arc::new(writer);
    match mode {
        RelayMode::Http(response_mode) => {
            let config = RelayConfig {
                response_mode,
                max_in_flight: cli.max_in_flight,
                ..RelayConfig::default()
            };
            let relay = RequestRelay::new(client_id, writer, LocalHttp::new(local_target), config);
            if let Err(err) = relay.run(inbound).await {
                error!(error = %err, "relay ended");
                return ExitCode::FAILURE;
            }
        }
        RelayMode::Tcp => {
            let bridge = TcpBridge::new(writer, local_target, BridgeConfig::default());
            if let Err(err) = bridge.run(inbound).await {
                error!(error = %err, "bridge ended");
                return ExitCode::FAILURE;
            }
        }
    }
    info!("tunnel session ended");
    ExitCode::SUCCESS
}
