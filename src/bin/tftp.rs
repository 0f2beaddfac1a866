//! Interactive TFTP client: a `tftp>` prompt accepting `get`, `put`, and `quit`.

use std::io::{self, BufRead, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;

use anyhow::{Result, anyhow};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use tftpd_rs::client;

/// An interactive TFTP client.
#[derive(Parser, Debug)]
#[command(name = "tftp", version, about)]
struct Cli {
    /// Server to connect to, as host:port (port defaults to 69 if omitted).
    server: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let cli = Cli::parse();
    let server = resolve_server(&cli.server)?;

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    print!("tftp> ");
    stdout.flush()?;

    for line in stdin.lock().lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            print!("tftp> ");
            stdout.flush()?;
            continue;
        }

        match parse_command(line) {
            Some(Command::Quit) => break,
            Some(Command::Get(filename)) => {
                let local: PathBuf = PathBuf::from(&filename);
                match client::get(server, &filename, &local).await {
                    Ok(()) => println!("received {filename}"),
                    Err(e) => println!("get {filename} failed: {e}"),
                }
            }
            Some(Command::Put(filename)) => {
                let local: PathBuf = PathBuf::from(&filename);
                match client::put(server, &local, &filename).await {
                    Ok(()) => println!("sent {filename}"),
                    Err(e) => println!("put {filename} failed: {e}"),
                }
            }
            None => println!("invalid command"),
        }

        print!("tftp> ");
        stdout.flush()?;
    }

    Ok(())
}

enum Command {
    Get(String),
    Put(String),
    Quit,
}

fn parse_command(line: &str) -> Option<Command> {
    let mut parts = line.splitn(2, char::is_whitespace);
    let verb = parts.next()?;
    let rest = parts.next().map(str::trim).unwrap_or_default();
    match verb {
        "quit" | "exit" if rest.is_empty() => Some(Command::Quit),
        "get" if !rest.is_empty() => Some(Command::Get(rest.to_string())),
        "put" if !rest.is_empty() => Some(Command::Put(rest.to_string())),
        _ => None,
    }
}

fn resolve_server(input: &str) -> Result<SocketAddr> {
    let with_port = if input.contains(':') {
        input.to_string()
    } else {
        format!("{input}:69")
    };
    with_port
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| anyhow!("could not resolve {input}"))
}
