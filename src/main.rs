use std::{env, io::Error, process::exit, sync::Arc};

use args::{ArgumentsRequest, StartupArguments};
use quic_connect::{Auth, ProxyClient, TlsTrust, TransportConfig};
use tokio::{
    io::{AsyncWriteExt, BufReader},
    join,
};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod args;

fn main() {
    let arguments = match args::parse_arguments(env::args()) {
        Err(err) => {
            eprintln!("{err}\n\nType 'qconnect --help' for a help menu");
            exit(1);
        }
        Ok(arguments) => arguments,
    };

    let startup_args = match arguments {
        ArgumentsRequest::Version => {
            println!("{}", args::get_version_string());
            println!("Tunnels TCP over HTTP/3 CONNECT proxies");
            return;
        }
        ArgumentsRequest::Help => {
            println!("{}", args::get_help_string());
            return;
        }
        ArgumentsRequest::Run(startup_args) => startup_args,
    };

    init_logging(&startup_args);

    let runtime_result = tokio::runtime::Builder::new_current_thread().enable_all().build();

    let result = match runtime_result {
        Ok(runtime) => runtime.block_on(async_main(startup_args)),
        Err(err) => {
            eprintln!("Failed to start Tokio runtime: {err}");
            exit(1);
        }
    };

    if let Err(error) = result {
        eprintln!("Program finished with error: {error}");
        exit(1);
    }
}

fn init_logging(startup_args: &StartupArguments) {
    let filter = if startup_args.verbose {
        EnvFilter::new("debug")
    } else if startup_args.silent {
        EnvFilter::new("error")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

async fn async_main(startup_args: StartupArguments) -> Result<(), Error> {
    debug!(
        "Dialing {} ({}) through {}, user: {:?}",
        startup_args.destination,
        startup_args.network.as_str(),
        startup_args.proxy,
        startup_args.user
    );

    let mut config = TransportConfig::default().with_handshake_timeout(startup_args.handshake_timeout);
    if startup_args.insecure {
        warn!("Proxy certificate verification is disabled");
        config = config.with_tls(TlsTrust::InsecureSkipVerify);
    }
    if let Some(server_name) = startup_args.server_name {
        config = config.with_server_name(server_name);
    }

    let auth = startup_args
        .user
        .map(|user| Auth::new(user, startup_args.password.unwrap_or_default()));

    let client = ProxyClient::with_config("udp", &startup_args.proxy, auth, None, None, config)
        .send_proxy_authorization(startup_args.proxy_auth);
    let transport = Arc::clone(client.transport());

    let stream = client.dial(startup_args.network.as_str(), &startup_args.destination).await?;
    info!("Tunnel to {} open through {}", startup_args.destination, client.address());

    let (mut read_half, mut write_half) = tokio::io::split(stream);

    let upload = async {
        let mut stdin = BufReader::new(tokio::io::stdin());
        let copied = tokio::io::copy_buf(&mut stdin, &mut write_half).await?;
        write_half.shutdown().await?;
        Ok::<u64, Error>(copied)
    };

    let download = async {
        let mut stdout = tokio::io::stdout();
        let copied = tokio::io::copy(&mut read_half, &mut stdout).await?;
        stdout.flush().await?;
        Ok::<u64, Error>(copied)
    };

    let (sent, received) = join!(upload, download);
    let (sent, received) = (sent?, received?);
    info!("Tunnel closed after {sent} bytes sent and {received} bytes received");

    transport.close_idle_sessions();
    Ok(())
}
