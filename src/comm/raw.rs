//! Shared framing layer for the network comms
//!
//! Every raw comm owns a [`FrameLink`]: the piece that frames outgoing PDUs
//! with the packet codec and decodes complete inbound frames into callback
//! invocations. The transports (UDP, TCP, WebSocket, mux sessions) only move
//! bytes; framing, send serialization and callback dispatch live here.

use crate::comm::RecvCallback;
use crate::error::Result;
use crate::time_source::{RealTimeSource, TimeSource};
use crate::types::PduResolvedKey;
use crate::wire::{self, DataPacket, PacketVersion, HEADER_LEN_V2, MAX_V1_HEADER_LEN};
use parking_lot::{Mutex, RwLock};
use std::io::Read;
use std::net::TcpStream;
use std::sync::Arc;

/// Framing and dispatch state shared between a comm and its I/O thread
pub struct FrameLink {
    version: Mutex<PacketVersion>,
    time_source: Arc<dyn TimeSource>,
    send_lock: Mutex<()>,
    callback: RwLock<Option<RecvCallback>>,
}

impl FrameLink {
    pub fn new(version: PacketVersion) -> Self {
        Self::with_time_source(version, Arc::new(RealTimeSource::new()))
    }

    pub fn with_time_source(version: PacketVersion, time_source: Arc<dyn TimeSource>) -> Self {
        Self {
            version: Mutex::new(version),
            time_source,
            send_lock: Mutex::new(()),
            callback: RwLock::new(None),
        }
    }

    pub fn version(&self) -> PacketVersion {
        *self.version.lock()
    }

    /// Select the wire framing. Mux sessions call this from their config.
    pub fn set_version(&self, version: PacketVersion) {
        *self.version.lock() = version;
    }

    pub fn set_callback(&self, callback: RecvCallback) {
        *self.callback.write() = Some(callback);
    }

    /// Encode and write one frame. The closure performs the transport
    /// write; the internal lock keeps concurrent sends from interleaving
    /// encode+write pairs on the same connection.
    pub fn send_frame<F>(&self, key: &PduResolvedKey, data: &[u8], write: F) -> Result<()>
    where
        F: FnOnce(&[u8]) -> Result<()>,
    {
        let mut packet = DataPacket::new(key.robot.clone(), key.channel_id, data.to_vec());
        packet.meta.real_time_us = self.time_source.now_usec();

        let _guard = self.send_lock.lock();
        let encoded = packet.encode(self.version());
        write(&encoded)
    }

    /// Decode one complete raw frame and hand the body to the callback.
    /// Undecodable and non-data frames are dropped.
    pub fn deliver(&self, raw: &[u8]) {
        let packet = match DataPacket::decode(raw, self.version()) {
            Ok(p) => p,
            Err(e) => {
                log::debug!("dropping undecodable frame ({} bytes): {}", raw.len(), e);
                return;
            }
        };
        if !packet.is_pdu_data() {
            log::debug!(
                "dropping non-data frame: request_type=0x{:08X}",
                packet.meta.request_type
            );
            return;
        }

        let callback = self.callback.read().clone();
        if let Some(callback) = callback {
            let key = PduResolvedKey::new(packet.meta.robot.clone(), packet.meta.channel_id);
            callback(&key, &packet.body);
        }
    }
}

/// Outcome of pulling one frame off a stream transport
pub enum FrameRead {
    /// A complete raw frame, ready for [`FrameLink::deliver`]
    Frame(Vec<u8>),
    /// Read timeout with no frame bytes consumed; poll the running flag and
    /// retry
    Idle,
    /// EOF, error, or a timeout in the middle of a frame
    Disconnected,
}

enum ChunkRead {
    Full,
    Idle,
    Gone,
}

fn read_chunk(stream: &mut TcpStream, buf: &mut [u8], idle_ok: bool) -> ChunkRead {
    let mut total = 0;
    while total < buf.len() {
        match stream.read(&mut buf[total..]) {
            Ok(0) => return ChunkRead::Gone,
            Ok(n) => total += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                if total == 0 && idle_ok {
                    return ChunkRead::Idle;
                }
                // a timeout mid-frame is a hard disconnect
                return ChunkRead::Gone;
            }
            Err(_) => return ChunkRead::Gone,
        }
    }
    ChunkRead::Full
}

/// Read exactly one framed packet off a stream.
///
/// V2 reads the fixed 304-byte header then `body_len` body bytes; V1 reads
/// the `header_len` prefix (capped at 4 MiB) then that many bytes.
pub fn read_frame(stream: &mut TcpStream, version: PacketVersion) -> FrameRead {
    match version {
        PacketVersion::V2 => {
            let mut frame = vec![0u8; HEADER_LEN_V2];
            match read_chunk(stream, &mut frame, true) {
                ChunkRead::Full => {}
                ChunkRead::Idle => return FrameRead::Idle,
                ChunkRead::Gone => return FrameRead::Disconnected,
            }
            let body_len = wire::v2_body_len(&frame) as usize;
            if body_len > 0 {
                let mut body = vec![0u8; body_len];
                match read_chunk(stream, &mut body, false) {
                    ChunkRead::Full => frame.extend_from_slice(&body),
                    _ => return FrameRead::Disconnected,
                }
            }
            FrameRead::Frame(frame)
        }
        PacketVersion::V1 => {
            let mut prefix = [0u8; 4];
            match read_chunk(stream, &mut prefix, true) {
                ChunkRead::Full => {}
                ChunkRead::Idle => return FrameRead::Idle,
                ChunkRead::Gone => return FrameRead::Disconnected,
            }
            let header_len = u32::from_le_bytes(prefix);
            if header_len == 0 || header_len > MAX_V1_HEADER_LEN {
                log::debug!("dropping session: bad v1 header_len {}", header_len);
                return FrameRead::Disconnected;
            }
            let mut frame = vec![0u8; 4 + header_len as usize];
            frame[..4].copy_from_slice(&prefix);
            match read_chunk(stream, &mut frame[4..], false) {
                ChunkRead::Full => FrameRead::Frame(frame),
                _ => FrameRead::Disconnected,
            }
        }
    }
}
