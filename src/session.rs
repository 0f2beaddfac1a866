//! The per-transfer Reader/Writer state machine (spec.md §4.2).
//!
//! This is deliberately transport-agnostic: it knows nothing about sockets,
//! async runtimes, or timers. Callers drive it with `on_packet` /
//! `on_timeout` and get back an `Outcome` describing what to do next, which
//! lets the exact same machine be exercised by a real `tokio::net::UdpSocket`
//! transport and by synchronous unit tests.

use std::fs::File;
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::time::Instant;

use crate::error::{Error, ProtocolErrorCode};
use crate::packet::{BLOCK_SIZE, MAX_BLOCKS, Packet};

/// Retransmissions of the current outbound packet before giving up.
pub const MAX_RETRIES: u32 = 5;

/// Idle timeout after which a session is force-closed regardless of its own
/// retry cadence (spec.md §4.3 `sweep`).
pub const IDLE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Single-shot retransmit timer.
pub const RETRANSMIT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(3);

/// Which half of the transfer this session drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sends the file to the peer (serves an RRQ, or drives a client `put`).
    Reader,
    /// Receives the file from the peer (serves a WRQ, or drives a client `get`).
    Writer,
}

enum Body {
    Reader { file: File },
    Writer { file: File },
}

/// What the caller should do after feeding the machine a packet or timeout.
pub enum Outcome {
    /// Send these bytes and keep the session alive, awaiting the next packet.
    Reply(Vec<u8>),
    /// Send these bytes; this is the final packet of a successful transfer.
    ReplyAndDone(Vec<u8>),
    /// Stay silent and keep waiting (duplicate/stale packet, ignored by design).
    Ignore,
    /// The transfer ended, successfully, with no further packet to send
    /// (a Reader that just got the ACK for its final short DATA).
    Done,
    /// The transfer failed. `Error::to_wire_error` tells the caller whether
    /// an ERROR packet should be sent to the peer before tearing down.
    Failed(Error),
}

/// One in-flight RRQ/WRQ transfer, from either role.
pub struct Session {
    body: Body,
    peer: SocketAddr,
    current_block: u16,
    last_data_size: usize,
    retries: u32,
    terminated: bool,
    last_activity: Instant,
    /// The last DATA or ACK we sent, kept for retransmission.
    pending: Vec<u8>,
}

/// True if `candidate` is strictly before `current` on the wrapping u16
/// block-number circle (i.e. a stale retransmission, not a future block).
fn is_stale(current: u16, candidate: u16) -> bool {
    let diff = current.wrapping_sub(candidate);
    diff != 0 && diff < 0x8000
}

impl Session {
    /// Start a Reader: open for reading, send DATA(1) immediately.
    pub fn new_reader(mut file: File, peer: SocketAddr) -> std::io::Result<Self> {
        let mut buf = vec![0u8; BLOCK_SIZE];
        let n = read_full(&mut file, &mut buf)?;
        buf.truncate(n);
        let pending = Packet::DATA { block: 1, data: buf }.encode();
        Ok(Self {
            body: Body::Reader { file },
            peer,
            current_block: 1,
            last_data_size: n,
            retries: 0,
            terminated: false,
            last_activity: Instant::now(),
            pending,
        })
    }

    /// Start a Writer: open for writing, send ACK(0) immediately.
    pub fn new_writer(file: File, peer: SocketAddr) -> Self {
        let pending = Packet::ACK { block: 0 }.encode();
        Self {
            body: Body::Writer { file },
            peer,
            current_block: 0,
            last_data_size: 0,
            retries: 0,
            terminated: false,
            last_activity: Instant::now(),
            pending,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn role(&self) -> Role {
        match self.body {
            Body::Reader { .. } => Role::Reader,
            Body::Writer { .. } => Role::Writer,
        }
    }

    pub fn terminated(&self) -> bool {
        self.terminated
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// The packet to send right away (initial DATA(1) or ACK(0)).
    pub fn initial(&self) -> Vec<u8> {
        self.pending.clone()
    }

    pub fn on_packet(&mut self, raw: &[u8]) -> Outcome {
        self.last_activity = Instant::now();
        let pkt = match Packet::decode(raw) {
            Ok(p) => p,
            Err(e) => return self.fail(Error::Decode(e)),
        };
        match pkt {
            Packet::ERROR { code, message } => {
                self.terminated = true;
                Outcome::Failed(Error::PeerError { code, message })
            }
            Packet::ACK { block } => match self.role() {
                Role::Reader => self.on_ack(block),
                Role::Writer => self.illegal(),
            },
            Packet::DATA { block, data } => match self.role() {
                Role::Writer => self.on_data(block, data),
                Role::Reader => self.illegal(),
            },
            Packet::RRQ { .. } | Packet::WRQ { .. } => self.illegal(),
        }
    }

    pub fn on_timeout(&mut self) -> Outcome {
        if self.retries >= MAX_RETRIES {
            self.terminated = true;
            return Outcome::Failed(Error::RetriesExhausted(self.retries));
        }
        self.retries += 1;
        self.last_activity = Instant::now();
        Outcome::Reply(self.pending.clone())
    }

    fn illegal(&mut self) -> Outcome {
        self.terminated = true;
        Outcome::Failed(Error::Protocol(ProtocolErrorCode::IllegalOperation))
    }

    fn fail(&mut self, err: Error) -> Outcome {
        self.terminated = true;
        Outcome::Failed(err)
    }

    fn on_ack(&mut self, block: u16) -> Outcome {
        if block == self.current_block {
            if self.last_data_size < BLOCK_SIZE {
                self.terminated = true;
                return Outcome::Done;
            }
            let file = match &mut self.body {
                Body::Reader { file } => file,
                Body::Writer { .. } => unreachable!("on_ack only called for Reader"),
            };
            let mut buf = vec![0u8; BLOCK_SIZE];
            let n = match read_full(file, &mut buf) {
                Ok(n) => n,
                Err(e) => return self.fail(Error::Io(e)),
            };
            buf.truncate(n);
            self.current_block = self.current_block.wrapping_add(1);
            self.last_data_size = n;
            self.retries = 0;
            let bytes = Packet::DATA {
                block: self.current_block,
                data: buf,
            }
            .encode();
            self.pending = bytes.clone();
            Outcome::Reply(bytes)
        } else if is_stale(self.current_block, block) {
            // Sorcerer's apprentice: never resend on a stale ACK.
            Outcome::Ignore
        } else {
            self.illegal()
        }
    }

    fn on_data(&mut self, block: u16, data: Vec<u8>) -> Outcome {
        let expected = self.current_block.wrapping_add(1);
        if block == expected {
            if self.current_block as usize == MAX_BLOCKS {
                // Accepting this block would wrap the counter to 0 and
                // silently continue past the supported size ceiling.
                return self.fail(Error::FileTooLarge(MAX_BLOCKS));
            }
            let file = match &mut self.body {
                Body::Writer { file } => file,
                Body::Reader { .. } => unreachable!("on_data only called for Writer"),
            };
            if let Err(e) = file.write_all(&data) {
                return self.fail(Error::Io(e));
            }
            self.current_block = block;
            self.last_data_size = data.len();
            self.retries = 0;
            let ack = Packet::ACK { block }.encode();
            self.pending = ack.clone();
            if data.len() < BLOCK_SIZE {
                self.terminated = true;
                Outcome::ReplyAndDone(ack)
            } else {
                Outcome::Reply(ack)
            }
        } else if block == self.current_block {
            // Peer retransmitted the block we already have; re-ACK without
            // writing it again. Also covers "dallying": a duplicate of the
            // final short DATA after we've already terminated.
            Outcome::Reply(self.pending.clone())
        } else {
            Outcome::Ignore
        }
    }
}

/// Read up to `buf.len()` bytes, looping on short reads (spec: "read up to
/// 512 bytes"; a single `read` call is allowed to return fewer).
fn read_full(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match file.read(&mut buf[total..])? {
            0 => break,
            n => total += n,
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Seek;

    fn tmp_file_with(content: &[u8]) -> File {
        let mut f = tempfile::tempfile().unwrap();
        f.write_all(content).unwrap();
        f.rewind().unwrap();
        f
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:6969".parse().unwrap()
    }

    #[test]
    fn reader_sends_exact_multiple_as_trailing_empty_block() {
        let content = vec![0x41u8; BLOCK_SIZE];
        let mut session = Session::new_reader(tmp_file_with(&content), peer()).unwrap();
        assert_eq!(session.initial(), Packet::DATA { block: 1, data: content.clone() }.encode());

        match session.on_packet(&Packet::ACK { block: 1 }.encode()) {
            Outcome::Reply(bytes) => {
                assert_eq!(bytes, Packet::DATA { block: 2, data: vec![] }.encode());
            }
            _ => panic!("expected Reply"),
        }

        match session.on_packet(&Packet::ACK { block: 2 }.encode()) {
            Outcome::Done => {}
            _ => panic!("expected Done"),
        }
        assert!(session.terminated());
    }

    #[test]
    fn reader_short_file_terminates_after_first_ack() {
        let mut session = Session::new_reader(tmp_file_with(b"hello"), peer()).unwrap();
        match session.on_packet(&Packet::ACK { block: 1 }.encode()) {
            Outcome::Done => {}
            _ => panic!("expected Done"),
        }
    }

    #[test]
    fn reader_ignores_stale_ack_no_sorcerers_apprentice() {
        let content = vec![0x41u8; BLOCK_SIZE * 2];
        let mut session = Session::new_reader(tmp_file_with(&content), peer()).unwrap();
        // Advance to block 2.
        session.on_packet(&Packet::ACK { block: 1 }.encode());
        // A duplicate ACK(1) now refers to the *previous* block: stale, ignore.
        match session.on_packet(&Packet::ACK { block: 1 }.encode()) {
            Outcome::Ignore => {}
            _ => panic!("expected Ignore on stale ack"),
        }
    }

    #[test]
    fn reader_future_ack_is_protocol_violation() {
        let mut session = Session::new_reader(tmp_file_with(b"hi"), peer()).unwrap();
        match session.on_packet(&Packet::ACK { block: 99 }.encode()) {
            Outcome::Failed(Error::Protocol(ProtocolErrorCode::IllegalOperation)) => {}
            _ => panic!("expected protocol violation"),
        }
    }

    #[test]
    fn reader_retransmits_on_timeout_then_gives_up() {
        let mut session = Session::new_reader(tmp_file_with(b"hi"), peer()).unwrap();
        let first = session.initial();
        for _ in 0..MAX_RETRIES {
            match session.on_timeout() {
                Outcome::Reply(bytes) => assert_eq!(bytes, first),
                _ => panic!("expected retransmit"),
            }
        }
        match session.on_timeout() {
            Outcome::Failed(Error::RetriesExhausted(n)) => assert_eq!(n, MAX_RETRIES),
            _ => panic!("expected retry exhaustion"),
        }
    }

    #[test]
    fn writer_short_upload_replies_and_done() {
        let mut session = Session::new_writer(tempfile::tempfile().unwrap(), peer());
        assert_eq!(session.initial(), Packet::ACK { block: 0 }.encode());

        let payload = b"small upload".to_vec();
        match session.on_packet(&Packet::DATA { block: 1, data: payload }.encode()) {
            Outcome::ReplyAndDone(bytes) => {
                assert_eq!(bytes, Packet::ACK { block: 1 }.encode());
            }
            _ => panic!("expected ReplyAndDone"),
        }
        assert!(session.terminated());
    }

    #[test]
    fn writer_duplicate_data_writes_once_acks_every_time() {
        let mut session = Session::new_writer(tempfile::tempfile().unwrap(), peer());
        let full_block = vec![0x42u8; BLOCK_SIZE];

        for i in 0..3 {
            match session.on_packet(&Packet::DATA { block: 1, data: full_block.clone() }.encode()) {
                Outcome::Reply(bytes) => assert_eq!(bytes, Packet::ACK { block: 1 }.encode()),
                _ => panic!("iteration {i}: expected Reply"),
            }
        }

        // Confirm the payload was written exactly once by checking file length.
        if let Body::Writer { file } = &mut session.body {
            let len = file.metadata().unwrap().len();
            assert_eq!(len as usize, BLOCK_SIZE);
        }
    }

    #[test]
    fn writer_refuses_block_that_would_wrap_past_max_blocks() {
        let mut session = Session::new_writer(tempfile::tempfile().unwrap(), peer());
        session.current_block = u16::MAX;
        match session.on_packet(&Packet::DATA { block: 0, data: vec![0u8; BLOCK_SIZE] }.encode()) {
            Outcome::Failed(Error::FileTooLarge(n)) => assert_eq!(n, MAX_BLOCKS),
            _ => panic!("expected FileTooLarge"),
        }
        assert!(session.terminated());
    }

    #[test]
    fn writer_never_writes_out_of_order_block() {
        let mut session = Session::new_writer(tempfile::tempfile().unwrap(), peer());
        match session.on_packet(&Packet::DATA { block: 5, data: b"oops".to_vec() }.encode()) {
            Outcome::Ignore => {}
            _ => panic!("expected out-of-order DATA to be ignored"),
        }
    }

    #[test]
    fn writer_dallying_reacks_duplicate_final_data() {
        let mut session = Session::new_writer(tempfile::tempfile().unwrap(), peer());
        let payload = b"final block".to_vec();
        session.on_packet(&Packet::DATA { block: 1, data: payload.clone() }.encode());
        assert!(session.terminated());

        // Sender didn't see our ACK and retransmits the same final DATA.
        match session.on_packet(&Packet::DATA { block: 1, data: payload }.encode()) {
            Outcome::Reply(bytes) => assert_eq!(bytes, Packet::ACK { block: 1 }.encode()),
            _ => panic!("expected dallying re-ack"),
        }
    }

    #[test]
    fn reader_rejects_unexpected_packet_kind() {
        let mut session = Session::new_reader(tmp_file_with(b"hi"), peer()).unwrap();
        match session.on_packet(&Packet::request(true, "x", "octet").unwrap().encode()) {
            Outcome::Failed(Error::Protocol(ProtocolErrorCode::IllegalOperation)) => {}
            _ => panic!("expected illegal operation"),
        }
    }

    #[test]
    fn error_packet_terminates_without_replying() {
        let mut session = Session::new_reader(tmp_file_with(b"hi"), peer()).unwrap();
        match session.on_packet(&Packet::error(1, "nope").encode()) {
            Outcome::Failed(Error::PeerError { code, .. }) => assert_eq!(code, 1),
            _ => panic!("expected PeerError"),
        }
        assert!(session.terminated());
    }
}
