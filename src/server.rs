//! The well-known-port listener and per-transfer task bodies (spec.md §4.3/§4.4).

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::{Duration, timeout};
use tracing::{debug, info, warn};

use crate::error::ProtocolErrorCode;
use crate::packet::{MAX_FILE_SIZE, MAX_PACKET, Packet};
use crate::session::{Outcome, RETRANSMIT_TIMEOUT, Session};
use crate::table::{ActivityHandle, SessionTable};

/// How often the listener wakes to sweep idle sessions (spec.md §4.4).
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Run the TFTP server on `port`, serving files rooted at `dir`, until
/// `shutdown` is set to `true`.
pub async fn run(port: u16, dir: PathBuf, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;
    let sock = UdpSocket::bind(addr)
        .await
        .with_context(|| format!("binding well-known TFTP socket on {addr}"))?;
    info!(%addr, "tftpd listening");

    let dir = Arc::new(
        std::fs::canonicalize(&dir).with_context(|| format!("serving root {}", dir.display()))?,
    );
    let table = Arc::new(SessionTable::new());
    let mut buf = vec![0u8; MAX_PACKET];
    let mut sweep_tick = tokio::time::interval(SWEEP_INTERVAL);

    loop {
        tokio::select! {
            result = sock.recv_from(&mut buf) => {
                let (n, peer) = result?;
                handle_listener_packet(&sock, &table, &dir, peer, &buf[..n]).await;
            }
            _ = sweep_tick.tick() => {
                table.sweep();
            }
            _ = shutdown.changed() => {
                info!("tftpd shutting down");
                break;
            }
        }
    }
    Ok(())
}

async fn handle_listener_packet(
    well_known: &UdpSocket,
    table: &Arc<SessionTable>,
    dir: &Arc<PathBuf>,
    peer: SocketAddr,
    raw: &[u8],
) {
    let pkt = match Packet::decode(raw) {
        Ok(p) => p,
        Err(e) => {
            debug!(%peer, error = %e, "dropping malformed packet on listener");
            return;
        }
    };

    let (filename, is_read) = match pkt {
        Packet::RRQ { filename, .. } => (filename, true),
        Packet::WRQ { filename, .. } => (filename, false),
        other => {
            debug!(%peer, packet = ?other, "unexpected packet on listener socket");
            return;
        }
    };

    if table.find(peer).is_some() {
        debug!(%peer, "duplicate request for an in-flight peer, ignoring");
        return;
    }

    let path = match sanitize_path(dir, &filename) {
        Ok(p) => p,
        Err(e) => {
            let _ = reply_error(well_known, peer, ProtocolErrorCode::AccessViolation, &e.to_string()).await;
            return;
        }
    };

    let table_for_task = Arc::clone(table);
    let created = table.create(peer, move |idx, activity| {
        tokio::spawn(async move {
            if is_read {
                run_reader(peer, path, activity).await;
            } else {
                run_writer(peer, path, activity).await;
            }
            table_for_task.retire(idx);
        })
    });

    if created.is_none() {
        warn!(%peer, "session table full, rejecting request");
        let _ = reply_error(well_known, peer, ProtocolErrorCode::DiskFull, "too many sessions").await;
    }
}

async fn reply_error(
    sock: &UdpSocket,
    peer: SocketAddr,
    code: ProtocolErrorCode,
    message: &str,
) -> std::io::Result<()> {
    let pkt = Packet::error(code.code(), message);
    sock.send_to(&pkt.encode(), peer).await.map(|_| ())
}

/// Bind an ephemeral UDP endpoint connected to `peer`. This becomes the
/// session's server-side TID (spec.md §4.3): the client latches onto its
/// source port for the rest of the transfer, freeing the well-known socket.
///
/// Built via `socket2` so the send/recv buffers can be sized for
/// `MAX_PACKET` before the socket is handed to tokio; the OS default is
/// occasionally too small and yields `ENOBUFS` under load.
async fn bind_transfer_socket(peer: SocketAddr) -> std::io::Result<UdpSocket> {
    let domain = if peer.is_ipv6() {
        socket2::Domain::IPV6
    } else {
        socket2::Domain::IPV4
    };
    let raw = socket2::Socket::new(domain, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))?;

    let buf_size = MAX_PACKET * 2;
    let _ = raw.set_send_buffer_size(buf_size);
    let _ = raw.set_recv_buffer_size(buf_size);

    let bind_addr: SocketAddr = if peer.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" }
        .parse()
        .unwrap();
    raw.bind(&bind_addr.into())?;
    raw.set_nonblocking(true)?;

    let std_sock: std::net::UdpSocket = raw.into();
    let sock = UdpSocket::from_std(std_sock)?;
    sock.connect(peer).await?;
    Ok(sock)
}

async fn run_reader(peer: SocketAddr, path: PathBuf, activity: ActivityHandle) {
    let file = match std::fs::File::open(&path) {
        Ok(f) => f,
        Err(e) => {
            warn!(%peer, path = %path.display(), error = %e, "RRQ: cannot open file");
            if let Ok(sock) = bind_transfer_socket(peer).await {
                let code = if e.kind() == std::io::ErrorKind::NotFound {
                    ProtocolErrorCode::FileNotFound
                } else {
                    ProtocolErrorCode::AccessViolation
                };
                let _ = reply_error(&sock, peer, code, code.message()).await;
            }
            activity.touch();
            return;
        }
    };

    match file.metadata() {
        Ok(meta) if meta.len() as usize > MAX_FILE_SIZE => {
            warn!(%peer, path = %path.display(), size = meta.len(), "RRQ: file exceeds maximum supported size");
            if let Ok(sock) = bind_transfer_socket(peer).await {
                let _ = reply_error(
                    &sock,
                    peer,
                    ProtocolErrorCode::DiskFull,
                    "file exceeds maximum supported size",
                )
                .await;
            }
            activity.touch();
            return;
        }
        Ok(_) => {}
        Err(e) => {
            warn!(%peer, path = %path.display(), error = %e, "RRQ: cannot stat file");
            activity.touch();
            return;
        }
    }

    let session = match Session::new_reader(file, peer) {
        Ok(s) => s,
        Err(e) => {
            warn!(%peer, error = %e, "RRQ: failed reading first block");
            activity.touch();
            return;
        }
    };

    let sock = match bind_transfer_socket(peer).await {
        Ok(s) => s,
        Err(e) => {
            warn!(%peer, error = %e, "RRQ: could not bind transfer socket");
            activity.touch();
            return;
        }
    };

    info!(%peer, path = %path.display(), "RRQ accepted");
    run_transfer(sock, session, activity).await;
    info!(%peer, path = %path.display(), "RRQ finished");
}

async fn run_writer(peer: SocketAddr, path: PathBuf, activity: ActivityHandle) {
    let tmp_path = tmp_path_for(&path);
    if let Some(parent) = path.parent()
        && let Err(e) = std::fs::create_dir_all(parent)
    {
        warn!(%peer, path = %path.display(), error = %e, "WRQ: cannot create parent directory");
        if let Ok(sock) = bind_transfer_socket(peer).await {
            let _ = reply_error(&sock, peer, ProtocolErrorCode::AccessViolation, &e.to_string()).await;
        }
        activity.touch();
        return;
    }

    let file = match std::fs::File::create(&tmp_path) {
        Ok(f) => f,
        Err(e) => {
            warn!(%peer, path = %tmp_path.display(), error = %e, "WRQ: cannot create file");
            if let Ok(sock) = bind_transfer_socket(peer).await {
                let _ = reply_error(&sock, peer, ProtocolErrorCode::AccessViolation, &e.to_string()).await;
            }
            activity.touch();
            return;
        }
    };

    let session = Session::new_writer(file, peer);

    let sock = match bind_transfer_socket(peer).await {
        Ok(s) => s,
        Err(e) => {
            warn!(%peer, error = %e, "WRQ: could not bind transfer socket");
            activity.touch();
            return;
        }
    };

    info!(%peer, path = %path.display(), "WRQ accepted");
    let succeeded = run_transfer(sock, session, activity).await;

    if succeeded {
        if let Err(e) = std::fs::rename(&tmp_path, &path) {
            warn!(%peer, path = %path.display(), error = %e, "WRQ: failed to finalize upload");
            let _ = std::fs::remove_file(&tmp_path);
        } else {
            info!(%peer, path = %path.display(), "WRQ finished");
        }
    } else {
        let _ = std::fs::remove_file(&tmp_path);
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Drive `session` to completion over `sock`, reporting whether it
/// succeeded. Shared by both the RRQ and WRQ task bodies.
async fn run_transfer(sock: UdpSocket, mut session: Session, activity: ActivityHandle) -> bool {
    let mut recv_buf = vec![0u8; MAX_PACKET];

    if sock.send(&session.initial()).await.is_err() {
        return false;
    }
    activity.touch();

    loop {
        let outcome = match timeout(RETRANSMIT_TIMEOUT, sock.recv(&mut recv_buf)).await {
            Ok(Ok(n)) => {
                activity.touch();
                session.on_packet(&recv_buf[..n])
            }
            Ok(Err(_)) => return false,
            Err(_) => session.on_timeout(),
        };

        match outcome {
            Outcome::Reply(bytes) => {
                if sock.send(&bytes).await.is_err() {
                    return false;
                }
                activity.touch();
            }
            Outcome::ReplyAndDone(bytes) => {
                let _ = sock.send(&bytes).await;
                activity.expire();
                return true;
            }
            Outcome::Ignore => {
                // Stale/duplicate/out-of-order packet: stay silent and keep
                // waiting, per spec.md §4.2 (no sorcerer's-apprentice resend).
                continue;
            }
            Outcome::Done => {
                activity.expire();
                return true;
            }
            Outcome::Failed(err) => {
                if let Some((code, message)) = err.to_wire_error() {
                    let _ = sock.send(&Packet::error(code, message).encode()).await;
                }
                debug!(peer = %session.peer(), error = %err, "transfer failed");
                activity.expire();
                return false;
            }
        }
    }
}

/// Ensure the requested filename stays inside the served directory.
/// Supports subdirectory paths while rejecting traversal (`..`) and
/// absolute paths (spec.md §9's open question: reject, don't mirror).
pub(crate) fn sanitize_path(dir: &Path, filename: &str) -> Result<PathBuf> {
    let normalized = filename.replace('\\', "/");

    if normalized.starts_with('/') {
        return Err(anyhow!("absolute paths are not allowed"));
    }
    if normalized.split('/').any(|c| c == "..") {
        return Err(anyhow!("path traversal is not allowed"));
    }

    let clean: PathBuf = normalized
        .split('/')
        .filter(|c| !c.is_empty() && *c != ".")
        .collect();
    if clean.as_os_str().is_empty() {
        return Err(anyhow!("invalid filename"));
    }

    let candidate = dir.join(&clean);
    let canonical_dir = dir
        .canonicalize()
        .map_err(|e| anyhow!("cannot canonicalize served directory: {e}"))?;

    if candidate.exists() {
        let canonical = candidate
            .canonicalize()
            .map_err(|e| anyhow!("cannot canonicalize path: {e}"))?;
        if !canonical.starts_with(&canonical_dir) {
            return Err(anyhow!("path escapes served directory"));
        }
        Ok(canonical)
    } else {
        let mut ancestor = candidate.parent();
        while let Some(a) = ancestor {
            if a.exists() {
                let canonical_ancestor = a
                    .canonicalize()
                    .map_err(|e| anyhow!("cannot canonicalize ancestor: {e}"))?;
                if !canonical_ancestor.starts_with(&canonical_dir) {
                    return Err(anyhow!("path escapes served directory"));
                }
                return Ok(candidate);
            }
            ancestor = a.parent();
        }
        Err(anyhow!("path escapes served directory"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_simple_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hello.txt"), b"test").unwrap();
        let result = sanitize_path(dir.path(), "hello.txt").unwrap();
        assert!(result.ends_with("hello.txt"));
    }

    #[test]
    fn sanitize_subdirectory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sub/deep")).unwrap();
        std::fs::write(dir.path().join("sub/deep/file.cfg"), b"data").unwrap();
        let result = sanitize_path(dir.path(), "sub/deep/file.cfg").unwrap();
        assert!(result.ends_with("sub/deep/file.cfg"));
    }

    #[test]
    fn sanitize_rejects_dotdot() {
        let dir = tempfile::tempdir().unwrap();
        assert!(sanitize_path(dir.path(), "../etc/passwd").is_err());
        assert!(sanitize_path(dir.path(), "sub/../../etc/passwd").is_err());
    }

    #[test]
    fn sanitize_rejects_absolute() {
        let dir = tempfile::tempdir().unwrap();
        assert!(sanitize_path(dir.path(), "/etc/passwd").is_err());
    }

    #[test]
    fn sanitize_nonexistent_path_within_dir() {
        let dir = tempfile::tempdir().unwrap();
        let result = sanitize_path(dir.path(), "new_dir/file.bin").unwrap();
        assert!(result.ends_with("new_dir/file.bin"));
    }

    #[test]
    fn sanitize_rejects_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(sanitize_path(dir.path(), "").is_err());
        assert!(sanitize_path(dir.path(), ".").is_err());
        assert!(sanitize_path(dir.path(), "..").is_err());
    }
}
