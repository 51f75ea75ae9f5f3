//! Echo server binary on the tern reactor framework.

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tern_net::{Address, Buffer, ConnectionRef, EventLoop, Server};
use tern_server::config::Config;
use tern_server::{logging, signal};

#[derive(Parser)]
#[command(name = "tern-server")]
#[command(about = "Multi-reactor TCP echo server")]
struct Args {
    /// Path to configuration file (defaults apply when omitted)
    config: Option<PathBuf>,

    /// Print default configuration and exit
    #[arg(long)]
    print_config: bool,
}

fn main() {
    let args = Args::parse();

    if args.print_config {
        print_default_config();
        return;
    }

    let config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Failed to load config: {}", e);
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };

    logging::init(&config.logging);

    if let Err(e) = run(config) {
        eprintln!("Server error: {}", e);
        std::process::exit(1);
    }
}

fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let listen = config.listener.address;
    let address = Address::new(listen.ip().to_string(), listen.port());

    let main_loop = EventLoop::new()?;
    let server = Server::new(main_loop.clone(), &address)?;
    server.set_thread_count(config.threads())?;
    server.set_high_water_mark(config.connection.high_water_mark);

    server.set_connection_callback(Arc::new(|conn: &ConnectionRef| {
        tracing::info!(fd = conn.fd(), peer = ?conn.peer_addr().ok(), "client connected");
    }));
    server.set_message_callback(Arc::new(
        |conn: &ConnectionRef, input: &mut Buffer, _now| {
            let payload = input.take();
            conn.send(&payload);
        },
    ));
    server.set_high_water_mark_callback(Arc::new(|conn: &ConnectionRef, buffered: usize| {
        tracing::warn!(
            fd = conn.fd(),
            buffered,
            "slow client crossed the high-water mark"
        );
    }));
    server.set_error_callback(Arc::new(|conn: &ConnectionRef, error: &tern_net::NetError| {
        tracing::warn!(fd = conn.fd(), error = %error, "client error");
    }));

    // The signal handler runs on its own thread; it cannot stop the main
    // loop directly, so a watcher marshals the shutdown.
    let shutdown = signal::install_signal_handler();
    {
        let server = server.clone();
        let main_loop = main_loop.clone();
        std::thread::Builder::new()
            .name("shutdown-watcher".to_string())
            .spawn(move || {
                while !shutdown.load(Ordering::Relaxed) {
                    std::thread::sleep(Duration::from_millis(100));
                }
                server.stop();
                main_loop.stop();
            })?;
    }

    server.start()?;
    tracing::info!(
        listen = %address,
        workers = config.threads(),
        "echo server running"
    );
    main_loop.run();

    tracing::info!("echo server exited");
    Ok(())
}

fn print_default_config() {
    let config = r#"# tern-server configuration

[listener]
# Listen address (IPv4)
address = "0.0.0.0:7000"

[workers]
# Number of worker event loops (default: number of CPUs).
# 0 hosts every connection on the acceptor loop.
# threads = 4

[connection]
# Output-buffer size at which back-pressure is signalled
high_water_mark = "64MB"

[logging]
# Log level: "trace", "debug", "info", "warn", "error"
level = "info"

# Output format: "compact", "pretty", or "json"
format = "compact"

# Include timestamps / thread names in log lines
timestamps = true
thread_names = true
"#;
    print!("{}", config);
}
