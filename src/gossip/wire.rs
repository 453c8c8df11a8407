//! Gossip wire format: length-prefixed body, one-byte compression header
//! (0x00 plain JSON, 0x01 LZ4-compressed JSON), as SPEC_FULL §6 fixes.

use crate::config::NodeRole;
use crate::directory::{now_millis, NodeInfo, ServiceSummary, Status};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const SCHEMA_VERSION: u32 = 1;
const PLAIN: u8 = 0x00;
const LZ4: u8 = 0x01;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfoWire {
    pub schema: u32,
    pub node_id: String,
    pub version: u64,
    pub status: Status,
    pub address: String,
    pub port: u16,
    pub role: NodeRole,
    pub capabilities: Vec<String>,
    pub last_seen: u64,
    pub metadata: BTreeMap<String, String>,
    pub services: BTreeMap<String, ServiceSummary>,
}

impl NodeInfoWire {
    pub fn from(info: &NodeInfo) -> Self {
        Self {
            schema: SCHEMA_VERSION,
            node_id: info.node_id.clone(),
            version: info.version,
            status: info.status,
            address: info.address.clone(),
            port: info.port,
            role: info.role,
            capabilities: info.capabilities.clone(),
            last_seen: info.last_seen,
            metadata: info.metadata.clone(),
            services: info.services.clone(),
        }
    }

    pub fn to_node_info(&self) -> NodeInfo {
        NodeInfo {
            node_id: self.node_id.clone(),
            address: self.address.clone(),
            port: self.port,
            role: self.role,
            capabilities: self.capabilities.clone(),
            last_seen: self.last_seen,
            status: self.status,
            metadata: self.metadata.clone(),
            services: self.services.clone(),
            version: self.version,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipFrame {
    pub from: String,
    pub nonce: String,
    pub entries: Vec<NodeInfoWire>,
}

#[derive(Debug, Clone)]
pub struct Digest {
    pub entries: Vec<NodeInfoWire>,
}

/// Serializes `digest` as a `GossipFrame`, compressing with LZ4 when the
/// plain JSON exceeds `compression_threshold` bytes, and prefixes the result
/// with a 4-byte big-endian length and 1-byte compression header.
pub fn encode_frame(from: &str, digest: &Digest, compression_threshold: usize) -> Vec<u8> {
    let frame = GossipFrame {
        from: from.to_string(),
        nonce: random_nonce(),
        entries: digest.entries.clone(),
    };
    let json = serde_json::to_vec(&frame).expect("gossip frame always serializes");

    let (header, body) = if json.len() > compression_threshold {
        (LZ4, lz4_flex::compress_prepend_size(&json))
    } else {
        (PLAIN, json)
    };

    let mut out = Vec::with_capacity(5 + body.len());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.push(header);
    out.extend_from_slice(&body);
    out
}

/// Inverse of `encode_frame`. `bytes` must contain exactly one frame (the
/// HTTP body for a single gossip POST).
pub fn decode_frame(bytes: &[u8]) -> Result<GossipFrame, crate::error::ClusterError> {
    if bytes.len() < 5 {
        return Err(crate::error::ClusterError::TransportError(
            "gossip frame too short".to_string(),
        ));
    }
    let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    let header = bytes[4];
    let body = &bytes[5..];
    if body.len() != len {
        return Err(crate::error::ClusterError::TransportError(format!(
            "gossip frame length mismatch: header says {}, got {}",
            len,
            body.len()
        )));
    }

    let json = match header {
        PLAIN => body.to_vec(),
        LZ4 => lz4_flex::decompress_size_prepended(body).map_err(|e| {
            crate::error::ClusterError::TransportError(format!("lz4 decompress failed: {e}"))
        })?,
        other => {
            return Err(crate::error::ClusterError::TransportError(format!(
                "unknown gossip compression header: {other:#x}"
            )))
        }
    };

    serde_json::from_slice(&json).map_err(|e| {
        crate::error::ClusterError::TransportError(format!("gossip frame parse failed: {e}"))
    })
}

fn random_nonce() -> String {
    use rand::Rng;
    let bytes: [u8; 8] = rand::thread_rng().gen();
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeRole;

    fn sample_wire() -> NodeInfoWire {
        NodeInfoWire {
            schema: SCHEMA_VERSION,
            node_id: "w1".to_string(),
            version: 3,
            status: Status::Alive,
            address: "10.0.0.2".to_string(),
            port: 9443,
            role: NodeRole::Worker,
            capabilities: vec!["echo".to_string()],
            last_seen: now_millis(),
            metadata: BTreeMap::new(),
            services: BTreeMap::new(),
        }
    }

    #[test]
    fn round_trips_plain_frame() {
        let digest = Digest {
            entries: vec![sample_wire()],
        };
        let encoded = encode_frame("c1", &digest, 1_000_000);
        assert_eq!(encoded[4], PLAIN);
        let decoded = decode_frame(&encoded).unwrap();
        assert_eq!(decoded.from, "c1");
        assert_eq!(decoded.entries[0].node_id, "w1");
    }

    #[test]
    fn compresses_above_threshold() {
        let entries: Vec<NodeInfoWire> = (0..200)
            .map(|i| {
                let mut w = sample_wire();
                w.node_id = format!("w{i}");
                w
            })
            .collect();
        let digest = Digest { entries };
        let encoded = encode_frame("c1", &digest, 16);
        assert_eq!(encoded[4], LZ4);
        let decoded = decode_frame(&encoded).unwrap();
        assert_eq!(decoded.entries.len(), 200);
    }

    #[test]
    fn rejects_truncated_frame() {
        assert!(decode_frame(&[0, 0]).is_err());
    }
}
