//! Client-side `get`/`put` engine: drives the same Reader/Writer state
//! machine as the server, from the peer role, over a single socket pinned
//! to the first response's source port (spec.md §3 invariant 5).

use std::net::SocketAddr;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::lock::FileLock;
use crate::packet::{MAX_PACKET, Packet};
use crate::session::{MAX_RETRIES, Outcome, RETRANSMIT_TIMEOUT, Session};

/// Download `remote_filename` from `server` into `local_path`. On failure
/// the partially-written local file is removed (spec.md §7).
pub async fn get(server: SocketAddr, remote_filename: &str, local_path: &Path) -> Result<()> {
    let _lock = FileLock::acquire(local_path, Some(server))
        .map_err(|e| anyhow!("{e}"))
        .context("get")?;

    let result = get_inner(server, remote_filename, local_path).await;
    if result.is_err() {
        let _ = std::fs::remove_file(local_path);
    }
    result
}

async fn get_inner(server: SocketAddr, remote_filename: &str, local_path: &Path) -> Result<()> {
    let sock = UdpSocket::bind("0.0.0.0:0").await?;
    let request = Packet::request(true, remote_filename, "octet")?;
    let (peer, first) = request_until_response(&sock, server, &request).await?;
    sock.connect(peer).await?;

    let file = std::fs::File::create(local_path)
        .with_context(|| format!("creating {}", local_path.display()))?;
    let mut session = Session::new_writer(file, peer);

    debug!(%peer, remote_filename, "RRQ accepted, pinned to peer TID");
    let outcome = session.on_packet(&first);
    let succeeded = drive(&sock, &mut session, outcome).await?;
    if !succeeded {
        return Err(anyhow!("transfer of {remote_filename} did not complete"));
    }
    info!(remote_filename, local = %local_path.display(), "get complete");
    Ok(())
}

/// Upload `local_path` to `server` as `remote_filename`.
pub async fn put(server: SocketAddr, local_path: &Path, remote_filename: &str) -> Result<()> {
    let _lock = FileLock::acquire(local_path, Some(server))
        .map_err(|e| anyhow!("{e}"))
        .context("put")?;

    let sock = UdpSocket::bind("0.0.0.0:0").await?;
    let request = Packet::request(false, remote_filename, "octet")?;
    let (peer, first) = request_until_response(&sock, server, &request).await?;
    sock.connect(peer).await?;

    match Packet::decode(&first)? {
        Packet::ACK { block: 0 } => {}
        Packet::ERROR { code, message } => {
            return Err(anyhow!("server rejected upload: ERROR {code}: {message}"));
        }
        other => return Err(anyhow!("unexpected response to WRQ: {other:?}")),
    }

    let file = std::fs::File::open(local_path)
        .with_context(|| format!("opening {}", local_path.display()))?;
    let mut session = Session::new_reader(file, peer)?;
    let first_data = session.initial();

    debug!(%peer, remote_filename, "WRQ accepted, pinned to peer TID");
    sock.send(&first_data).await?;
    let succeeded = run_loop(&sock, &mut session).await?;
    if !succeeded {
        return Err(anyhow!("upload of {remote_filename} did not complete"));
    }
    info!(remote_filename, local = %local_path.display(), "put complete");
    Ok(())
}

/// Send `request` to `server`, retrying every `RETRANSMIT_TIMEOUT` up to
/// `MAX_RETRIES` times, and return the first reply along with the address
/// it actually came from (which becomes this transfer's pinned TID).
async fn request_until_response(
    sock: &UdpSocket,
    server: SocketAddr,
    request: &Packet,
) -> Result<(SocketAddr, Vec<u8>)> {
    let bytes = request.encode();
    let mut buf = vec![0u8; MAX_PACKET];
    let mut retries = 0u32;
    loop {
        sock.send_to(&bytes, server).await?;
        match timeout(RETRANSMIT_TIMEOUT, sock.recv_from(&mut buf)).await {
            Ok(Ok((n, from))) => return Ok((from, buf[..n].to_vec())),
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                retries += 1;
                if retries > MAX_RETRIES {
                    return Err(anyhow!("no response from {server}"));
                }
            }
        }
    }
}

/// Apply the outcome of the very first packet (already received by
/// `request_until_response`) and then fall into the normal recv/timeout loop.
async fn drive(sock: &UdpSocket, session: &mut Session, first_outcome: Outcome) -> Result<bool> {
    match first_outcome {
        Outcome::Reply(bytes) => {
            sock.send(&bytes).await?;
            run_loop(sock, session).await
        }
        Outcome::ReplyAndDone(bytes) => {
            let _ = sock.send(&bytes).await;
            Ok(true)
        }
        Outcome::Done => Ok(true),
        Outcome::Ignore => run_loop(sock, session).await,
        Outcome::Failed(err) => {
            if let Some((code, message)) = err.to_wire_error() {
                let _ = sock.send(&Packet::error(code, message).encode()).await;
            }
            Err(err.into())
        }
    }
}

/// Steady-state recv/timeout loop once the session is past its first packet.
async fn run_loop(sock: &UdpSocket, session: &mut Session) -> Result<bool> {
    let mut buf = vec![0u8; MAX_PACKET];
    loop {
        let outcome = match timeout(RETRANSMIT_TIMEOUT, sock.recv(&mut buf)).await {
            Ok(Ok(n)) => session.on_packet(&buf[..n]),
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => session.on_timeout(),
        };

        match outcome {
            Outcome::Reply(bytes) => {
                sock.send(&bytes).await?;
            }
            Outcome::ReplyAndDone(bytes) => {
                let _ = sock.send(&bytes).await;
                return Ok(true);
            }
            Outcome::Ignore => continue,
            Outcome::Done => return Ok(true),
            Outcome::Failed(err) => {
                if let Some((code, message)) = err.to_wire_error() {
                    let _ = sock.send(&Packet::error(code, message).encode()).await;
                }
                return Err(err.into());
            }
        }
    }
}
