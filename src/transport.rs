use std::io;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

use crate::protocol::{self, MAX_PACKET_BYTES, PacketType};

/// A raw datagram received from a peer: the undecoded payload plus the
/// reply address. Reply routing always uses this address, never the owner
/// identifier persisted in the lock file.
#[derive(Debug)]
pub struct Datagram {
    payload: [u8; MAX_PACKET_BYTES],
    len: usize,
    from: SocketAddr,
}

impl Datagram {
    pub fn payload(&self) -> &[u8] {
        &self.payload[..self.len]
    }

    pub fn from(&self) -> SocketAddr {
        self.from
    }
}

/// Loopback UDP channel between lock holders and requesters. Sends are
/// best-effort: peers come and go under normal churn, so a failed send is
/// logged and reported as `false`, never raised.
#[derive(Debug)]
pub struct LockCommunicator {
    socket: UdpSocket,
    stopped: AtomicBool,
}

impl LockCommunicator {
    /// Bind an ephemeral port on the loopback interface. The port is the
    /// owner identifier advertised to peers via the lock file.
    pub fn bind() -> io::Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))?;
        Ok(Self {
            socket,
            stopped: AtomicBool::new(false),
        })
    }

    /// The locally bound port, or `None` once the communicator is stopped.
    pub fn port(&self) -> Option<u16> {
        if self.stopped.load(Ordering::SeqCst) {
            return None;
        }
        self.socket.local_addr().ok().map(|addr| addr.port())
    }

    /// Best-effort UNLOCK_REQUEST to the lock owner's advertised port.
    /// Returns whether the send succeeded.
    pub fn ping_owner(&self, owner_port: u16, lock_id: u64, display_name: &str) -> bool {
        let payload = protocol::encode(lock_id, PacketType::UnlockRequest);
        match self
            .socket
            .send_to(&payload, (Ipv4Addr::LOCALHOST, owner_port))
        {
            Ok(_) => true,
            Err(err) => {
                debug!(owner_port, lock_id, display_name, %err, "failed to ping lock owner");
                false
            }
        }
    }

    /// Block until a datagram arrives. Returns `Ok(None)` when the
    /// communicator was stopped (clean shutdown) or on a benign wake;
    /// unexpected I/O failures propagate to the caller.
    pub fn receive(&self) -> io::Result<Option<Datagram>> {
        let mut payload = [0u8; MAX_PACKET_BYTES];
        let (len, from) = match self.socket.recv_from(&mut payload) {
            Ok(received) => received,
            Err(err) => {
                if self.stopped.load(Ordering::SeqCst) {
                    return Ok(None);
                }
                return Err(err);
            }
        };
        if self.stopped.load(Ordering::SeqCst) {
            return Ok(None);
        }
        if len == 0 {
            // zero-length datagrams carry no packet; treat as a wake
            return Ok(None);
        }
        Ok(Some(Datagram { payload, len, from }))
    }

    /// Best-effort UNLOCK_REQUEST_CONFIRMATION back to a requester. A lost
    /// confirmation self-heals through the requester's retry loop.
    pub fn confirm_unlock_request(&self, reply_addr: SocketAddr, lock_id: u64) {
        let payload = protocol::encode(lock_id, PacketType::UnlockRequestConfirmation);
        match self.socket.send_to(&payload, reply_addr) {
            Ok(_) => debug!(lock_id, %reply_addr, "confirmed unlock request"),
            Err(err) => {
                debug!(lock_id, %reply_addr, %err, "failed to confirm unlock request");
            }
        }
    }

    /// Best-effort LOCK_RELEASE_CONFIRMATION to each requester
    /// independently; one unreachable peer never blocks the rest.
    pub fn confirm_lock_release<I>(&self, reply_addrs: I, lock_id: u64)
    where
        I: IntoIterator<Item = SocketAddr>,
    {
        let payload = protocol::encode(lock_id, PacketType::LockReleaseConfirmation);
        for reply_addr in reply_addrs {
            match self.socket.send_to(&payload, reply_addr) {
                Ok(_) => debug!(lock_id, %reply_addr, "confirmed lock release"),
                Err(err) => {
                    debug!(lock_id, %reply_addr, %err, "failed to confirm lock release");
                }
            }
        }
    }

    /// Mark the channel stopped and unblock a pending `receive`. std UDP
    /// sockets cannot be closed out from under a blocked `recv_from`, so a
    /// zero-length datagram to our own port serves as the wake-up.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(addr) = self.socket.local_addr() {
            if let Err(err) = self.socket.send_to(&[], addr) {
                debug!(%err, "failed to wake contention listener for shutdown");
            }
        }
    }
}
