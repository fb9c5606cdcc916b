//! Mock injector/client binary for integration testing
//!
//! Speaks the same command line as the real binaries and prints the same
//! readiness markers, so scenarios can run without a network overlay.
//! Started with `--injector-ep` it acts as a client: an HTTP proxy that
//! forwards every connection to the injector. Without it, it acts as an
//! injector that fetches the requested URL and answers with the result.
//! In I2P mode the "tunnel" is a plain TCP listener on an ephemeral port,
//! announced as the public ID.
//!
//! Behaviour switches (environment):
//! - `MOCK_PEER_EXIT_EARLY`: exit with code 3 before printing any marker
//! - `MOCK_PEER_SILENT`: never print a marker, wait for an interrupt
//! - `MOCK_PEER_EXIT_AFTER_READY`: print the markers, then exit with code 7
//! - `MOCK_PEER_FAIL_FIRST=N`: (client) answer 503 to the first N requests
//! - `MOCK_PEER_IGNORE_SIGINT`: keep running after SIGINT

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use clap::Parser;
use tokio::io::{self, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const TCP_MARKER: &str = "[DEBUG] Successfully listening on TCP Port";
const I2P_MARKER: &str = "[DEBUG] I2P Tunnel has been established";

/// Largest request head accepted
const MAX_HEAD: usize = 64 * 1024;

#[derive(Parser, Debug)]
#[command(name = "mock_peer")]
struct Args {
    #[arg(long)]
    repo: Option<PathBuf>,

    #[arg(long)]
    listen_on_tcp: Option<SocketAddr>,

    #[arg(long)]
    listen_on_i2p: Option<bool>,

    #[arg(long)]
    injector_ep: Option<String>,

    #[arg(long)]
    injector_ipns: Option<String>,

    /// Front-end URL (ignored)
    front_end_url: Option<String>,
}

fn env_flag(name: &str) -> bool {
    std::env::var_os(name).is_some()
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if env_flag("MOCK_PEER_EXIT_EARLY") {
        eprintln!("mock_peer: simulated startup failure");
        std::process::exit(3);
    }

    if let Err(e) = run(args).await {
        eprintln!("mock_peer: {e}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> io::Result<()> {
    if let Some(repo) = &args.repo {
        std::fs::create_dir_all(repo)?;
        eprintln!("mock_peer: repo {}", repo.display());
    }
    if let (Some(ipns), Some(front_end)) = (&args.injector_ipns, &args.front_end_url) {
        eprintln!("mock_peer: injector {ipns} via {front_end}");
    }

    // Installed before any marker so an early interrupt is never fatal
    let mut interrupts = Interrupts::install()?;
    let ignore_sigint = env_flag("MOCK_PEER_IGNORE_SIGINT");

    if env_flag("MOCK_PEER_SILENT") {
        interrupts.wait(ignore_sigint).await;
        return Ok(());
    }

    let serve = match &args.injector_ep {
        Some(injector) => {
            let listen = args.listen_on_tcp.ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "client needs --listen-on-tcp")
            })?;
            let listener = TcpListener::bind(listen).await?;
            println!("{} {}", TCP_MARKER, listen.port());
            println!("{}", I2P_MARKER);

            let fail_first = std::env::var("MOCK_PEER_FAIL_FIRST")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            tokio::spawn(serve_client(listener, injector.clone(), fail_first))
        }
        None => {
            let listener = if args.listen_on_i2p == Some(true) {
                let listener = TcpListener::bind("127.0.0.1:0").await?;
                println!("I2P Public ID: {}", listener.local_addr()?);
                println!("{}", I2P_MARKER);
                listener
            } else {
                let listen = args.listen_on_tcp.ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidInput, "injector needs a listener")
                })?;
                let listener = TcpListener::bind(listen).await?;
                println!("{} {}", TCP_MARKER, listen.port());
                listener
            };
            tokio::spawn(serve_injector(listener))
        }
    };

    if env_flag("MOCK_PEER_EXIT_AFTER_READY") {
        eprintln!("mock_peer: crashed after ready");
        std::process::exit(7);
    }

    interrupts.wait(ignore_sigint).await;
    serve.abort();
    eprintln!("mock_peer: interrupted, shutting down");
    Ok(())
}

struct Interrupts {
    #[cfg(unix)]
    signal: tokio::signal::unix::Signal,
}

impl Interrupts {
    fn install() -> io::Result<Self> {
        Ok(Self {
            #[cfg(unix)]
            signal: tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?,
        })
    }

    async fn next(&mut self) {
        #[cfg(unix)]
        self.signal.recv().await;
        #[cfg(not(unix))]
        let _ = tokio::signal::ctrl_c().await;
    }

    async fn wait(&mut self, ignore: bool) {
        loop {
            self.next().await;
            if !ignore {
                return;
            }
            eprintln!("mock_peer: ignoring SIGINT");
        }
    }
}

async fn serve_client(listener: TcpListener, injector: String, fail_first: u32) {
    let served = Arc::new(AtomicU32::new(0));
    loop {
        let Ok((stream, _)) = listener.accept().await else {
            continue;
        };
        let injector = injector.clone();
        let served = served.clone();
        tokio::spawn(async move {
            let n = served.fetch_add(1, Ordering::SeqCst);
            if let Err(e) = forward(stream, &injector, n < fail_first).await {
                eprintln!("mock_peer: client connection failed: {e}");
            }
        });
    }
}

/// Relay one proxy connection to the injector, or refuse it
async fn forward(mut stream: TcpStream, injector: &str, refuse: bool) -> io::Result<()> {
    let head = read_head(&mut stream).await?;
    if refuse {
        eprintln!("mock_peer: refusing request");
        return respond(&mut stream, 503, "Service Unavailable", "circuit not ready").await;
    }

    let mut upstream = TcpStream::connect(injector).await?;
    upstream.write_all(&head).await?;
    io::copy_bidirectional(&mut stream, &mut upstream).await?;
    Ok(())
}

async fn serve_injector(listener: TcpListener) {
    let client = match reqwest::Client::builder().no_proxy().build() {
        Ok(client) => client,
        Err(e) => {
            eprintln!("mock_peer: cannot build HTTP client: {e}");
            return;
        }
    };

    loop {
        let Ok((stream, _)) = listener.accept().await else {
            continue;
        };
        let client = client.clone();
        tokio::spawn(async move {
            if let Err(e) = fetch(stream, &client).await {
                eprintln!("mock_peer: injector connection failed: {e}");
            }
        });
    }
}

/// Answer an absolute-form GET by fetching the target
async fn fetch(mut stream: TcpStream, client: &reqwest::Client) -> io::Result<()> {
    let head = read_head(&mut stream).await?;
    let head = String::from_utf8_lossy(&head);
    let target = head
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or_default()
        .to_string();

    match client.get(&target).send().await {
        Ok(response) => {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            respond(
                &mut stream,
                status.as_u16(),
                status.canonical_reason().unwrap_or(""),
                &body,
            )
            .await
        }
        Err(e) => {
            eprintln!("mock_peer: fetching {target} failed: {e}");
            respond(&mut stream, 502, "Bad Gateway", "upstream unreachable").await
        }
    }
}

/// Read up to and including the blank line ending the request head
async fn read_head(stream: &mut TcpStream) -> io::Result<Vec<u8>> {
    let mut head = Vec::new();
    let mut buf = [0u8; 4096];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        if head.len() > MAX_HEAD {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "request head too large"));
        }
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        head.extend_from_slice(&buf[..n]);
    }
    Ok(head)
}

async fn respond(stream: &mut TcpStream, status: u16, reason: &str, body: &str) -> io::Result<()> {
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        reason,
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}
