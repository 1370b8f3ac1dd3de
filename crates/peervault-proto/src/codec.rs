//! Frame serialization and deserialization.
//!
//! All integers are big-endian. Byte arrays are `u32`-length-prefixed;
//! short strings are `u16`-length-prefixed with 0 meaning absent where the
//! field is optional. Every read is bounds-checked; a declared length that
//! runs past the frame is a `BadFrame`, never a panic.

use crate::error::ProtocolError;
use crate::message::{
    AnnounceReason, Envelope, ErrorCode, LeaveReason, Message, MessageType, PeerInfo,
    VersionExtension, VersionInfo,
};
use crate::{Result, MIN_FRAME_SIZE};

/// Serialize a message into a frame with the given timestamp.
#[must_use]
pub fn serialize(message: &Message, timestamp_ms: u64) -> Vec<u8> {
    let mut w = Writer::new();
    w.u8(message.message_type() as u8);
    w.u64(timestamp_ms);

    match message {
        Message::VersionInfo(info) => write_version_info(&mut w, info),
        Message::Updates { op_count, updates } => {
            w.u32(*op_count);
            w.bytes32(updates);
        }
        Message::SnapshotRequest | Message::UpgradeReady => {}
        Message::Snapshot {
            total_size,
            snapshot,
        } => {
            w.u32(*total_size);
            w.bytes32(snapshot);
        }
        Message::SnapshotChunk {
            chunk_index,
            total_chunks,
            data,
        } => {
            w.u32(*chunk_index);
            w.u32(*total_chunks);
            w.bytes32(data);
        }
        Message::SyncComplete { version } => w.bytes32(version),
        Message::Error { code, message } => {
            w.u8(*code as u8);
            w.bytes32(message.as_bytes());
        }
        Message::Ping { seq } | Message::Pong { seq } => w.u32(*seq),
        Message::BlobHashes { hashes } | Message::BlobRequest { hashes } => {
            w.u32(hashes.len() as u32);
            for hash in hashes {
                w.str16(hash);
            }
        }
        Message::BlobData {
            hash,
            mime_type,
            data,
        } => {
            w.str16(hash);
            w.opt_str16(mime_type.as_deref());
            w.bytes32(data);
        }
        Message::BlobSyncComplete { blob_count } => w.u32(*blob_count),
        Message::PeerRemoved { reason } => w.opt_str16(reason.as_deref()),
        Message::PeerAnnouncement { reason, peers } => {
            w.u8(*reason as u8);
            w.u16(peers.len() as u16);
            for peer in peers {
                write_peer_info(&mut w, peer);
            }
        }
        Message::PeerRequest { group_ids } => write_string_list(&mut w, group_ids),
        Message::PeerLeft {
            node_id,
            reason,
            group_ids,
        } => {
            w.str16(node_id);
            w.u8(*reason as u8);
            write_string_list(&mut w, group_ids);
        }
        Message::SdpOffer { payload }
        | Message::SdpAnswer { payload }
        | Message::IceCandidate { payload } => w.bytes32(payload.as_bytes()),
        Message::UpgradeFailed { reason } => w.bytes32(reason.as_bytes()),
    }

    w.into_bytes()
}

/// Deserialize a frame.
///
/// # Errors
///
/// `Short` below the 9-byte header, `UnknownType` for unrecognized type
/// bytes, `BadFrame` for any length overrun or malformed payload.
pub fn deserialize(frame: &[u8]) -> Result<Envelope> {
    if frame.len() < MIN_FRAME_SIZE {
        return Err(ProtocolError::Short(frame.len()));
    }

    let type_byte = frame[0];
    let mut r = Reader::new(&frame[1..]);
    let timestamp_ms = r.u64()?;

    let message = match type_byte {
        0x01 => read_version_info(&mut r)?,
        0x02 => Message::Updates {
            op_count: r.u32()?,
            updates: r.bytes32()?,
        },
        0x03 => Message::SnapshotRequest,
        0x04 => Message::Snapshot {
            total_size: r.u32()?,
            snapshot: r.bytes32()?,
        },
        0x05 => Message::SnapshotChunk {
            chunk_index: r.u32()?,
            total_chunks: r.u32()?,
            data: r.bytes32()?,
        },
        0x06 => Message::SyncComplete {
            version: r.bytes32()?,
        },
        0x07 => Message::Error {
            code: ErrorCode::try_from(r.u8()?)?,
            message: r.string32("error message")?,
        },
        0x08 => Message::Ping { seq: r.u32()? },
        0x09 => Message::Pong { seq: r.u32()? },
        0x10 => Message::BlobHashes {
            hashes: read_hash_list(&mut r)?,
        },
        0x11 => Message::BlobRequest {
            hashes: read_hash_list(&mut r)?,
        },
        0x12 => Message::BlobData {
            hash: r.string16("blob hash")?,
            mime_type: r.opt_string16("mime type")?,
            data: r.bytes32()?,
        },
        0x13 => Message::BlobSyncComplete {
            blob_count: r.u32()?,
        },
        0x20 => Message::PeerRemoved {
            reason: r.opt_string16("removal reason")?,
        },
        0x21 => {
            let reason = AnnounceReason::try_from(r.u8()?)?;
            let count = r.u16()?;
            let mut peers = Vec::with_capacity(count as usize);
            for _ in 0..count {
                peers.push(read_peer_info(&mut r)?);
            }
            Message::PeerAnnouncement { reason, peers }
        }
        0x22 => Message::PeerRequest {
            group_ids: read_string_list(&mut r)?,
        },
        0x23 => Message::PeerLeft {
            node_id: r.string16("node id")?,
            reason: LeaveReason::try_from(r.u8()?)?,
            group_ids: read_string_list(&mut r)?,
        },
        0x40 => Message::SdpOffer {
            payload: r.string32("sdp offer")?,
        },
        0x41 => Message::SdpAnswer {
            payload: r.string32("sdp answer")?,
        },
        0x42 => Message::IceCandidate {
            payload: r.string32("ice candidate")?,
        },
        0x43 => Message::UpgradeReady,
        0x44 => Message::UpgradeFailed {
            reason: r.string32("upgrade failure")?,
        },
        other => return Err(ProtocolError::UnknownType(other)),
    };

    Ok(Envelope {
        timestamp_ms,
        message,
    })
}

fn write_version_info(w: &mut Writer, info: &VersionInfo) {
    w.bytes32(info.vault_id.as_bytes());
    w.bytes32(&info.version);
    w.bytes32(info.ticket.as_bytes());
    w.str16(&info.hostname);
    w.opt_str16(info.nickname.as_deref());

    if let Some(ext) = &info.extension {
        w.u8(ext.protocol_version);
        w.str16(&ext.plugin_version);
        write_string_list(w, &ext.group_ids);
        w.u16(ext.known_peers.len() as u16);
        for peer in &ext.known_peers {
            write_peer_info(w, peer);
        }
    }
}

fn read_version_info(r: &mut Reader<'_>) -> Result<Message> {
    let vault_id = r.string32("vault id")?;
    let version = r.bytes32()?;
    let ticket = r.string32("ticket")?;
    let hostname = r.string16("hostname")?;
    let nickname = r.opt_string16("nickname")?;

    // Trailing bytes are a v2 extension block, interpreted only when the
    // advertised protocol version is at least 2.
    let extension = if r.remaining() > 0 {
        let protocol_version = r.u8()?;
        if protocol_version >= 2 {
            Some(VersionExtension {
                protocol_version,
                plugin_version: r.string16("plugin version")?,
                group_ids: read_string_list(r)?,
                known_peers: {
                    let count = r.u16()?;
                    let mut peers = Vec::with_capacity(count as usize);
                    for _ in 0..count {
                        peers.push(read_peer_info(r)?);
                    }
                    peers
                },
            })
        } else {
            None
        }
    } else {
        None
    };

    Ok(Message::VersionInfo(VersionInfo {
        vault_id,
        version,
        ticket,
        hostname,
        nickname,
        extension,
    }))
}

fn write_peer_info(w: &mut Writer, peer: &PeerInfo) {
    w.str16(&peer.node_id);
    w.opt_str16(peer.ticket.as_deref());
    w.opt_str16(peer.hostname.as_deref());
    w.opt_str16(peer.nickname.as_deref());
    w.u64(peer.last_seen);
}

fn read_peer_info(r: &mut Reader<'_>) -> Result<PeerInfo> {
    Ok(PeerInfo {
        node_id: r.string16("peer node id")?,
        ticket: r.opt_string16("peer ticket")?,
        hostname: r.opt_string16("peer hostname")?,
        nickname: r.opt_string16("peer nickname")?,
        last_seen: r.u64()?,
    })
}

fn write_string_list(w: &mut Writer, items: &[String]) {
    w.u16(items.len() as u16);
    for item in items {
        w.str16(item);
    }
}

fn read_string_list(r: &mut Reader<'_>) -> Result<Vec<String>> {
    let count = r.u16()?;
    let mut items = Vec::with_capacity(count as usize);
    for _ in 0..count {
        items.push(r.string16("list item")?);
    }
    Ok(items)
}

fn read_hash_list(r: &mut Reader<'_>) -> Result<Vec<String>> {
    let count = r.u32()?;
    let mut hashes = Vec::with_capacity((count as usize).min(4096));
    for _ in 0..count {
        hashes.push(r.string16("blob hash")?);
    }
    Ok(hashes)
}

/// Big-endian frame writer.
struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn new() -> Self {
        Self { buf: Vec::new() }
    }

    fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn bytes32(&mut self, bytes: &[u8]) {
        self.u32(bytes.len() as u32);
        self.buf.extend_from_slice(bytes);
    }

    fn str16(&mut self, s: &str) {
        self.u16(s.len() as u16);
        self.buf.extend_from_slice(s.as_bytes());
    }

    /// Optional short string; length 0 means absent.
    fn opt_str16(&mut self, s: Option<&str>) {
        match s {
            Some(s) if !s.is_empty() => self.str16(s),
            _ => self.u16(0),
        }
    }
}

/// Bounds-checked big-endian frame reader.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(ProtocolError::BadFrame("length exceeds frame"));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        Ok(u64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn bytes32(&mut self) -> Result<Vec<u8>> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn string32(&mut self, field: &'static str) -> Result<String> {
        let bytes = self.bytes32()?;
        String::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8(field))
    }

    fn string16(&mut self, field: &'static str) -> Result<String> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes)
            .map(String::from)
            .map_err(|_| ProtocolError::InvalidUtf8(field))
    }

    /// Optional short string; length 0 decodes to `None`.
    fn opt_string16(&mut self, field: &'static str) -> Result<Option<String>> {
        let s = self.string16(field)?;
        Ok(if s.is_empty() { None } else { Some(s) })
    }
}
