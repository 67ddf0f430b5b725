//! Built-in protocol handler
//!
//! Runs the version/verack handshake, keeps peer heights current through
//! ping/pong, answers address requests and passes every other frame from an
//! established peer to the application's [`FrameSink`].
//!
//! Handshake, as seen from each side:
//!
//! | side     | state       | receives  | moves to     | replies  |
//! |----------|-------------|-----------|--------------|----------|
//! | inbound  | HAND        | version   | HAND_SHAKE   | version  |
//! | outbound | HAND        | version   | HAND_SHAKED  | verack   |
//! | inbound  | HAND_SHAKE  | verack    | ESTABLISH    | verack   |
//! | outbound | HAND_SHAKED | verack    | ESTABLISH    |          |

use crate::network::constants::MAX_ADDR_NODE_CNT;
use crate::network::dispatch::MessageHandler;
use crate::network::link::{Channel, Link, LinkState};
use crate::network::message::{
    decode_payload, split_frame, AddrPayload, Command, HeightPayload, VersionPayload,
};
use crate::network::server::NetServer;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

/// A validated frame handed to the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame {
    pub peer_id: u64,
    pub channel: Channel,
    pub command: String,
    pub payload: Bytes,
}

/// Application side of the protocol handler
pub trait FrameSink: Send + Sync + 'static {
    fn deliver(&self, frame: InboundFrame);
}

/// Sink that forwards frames over an unbounded channel
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<InboundFrame>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<InboundFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl FrameSink for ChannelSink {
    fn deliver(&self, frame: InboundFrame) {
        if self.tx.send(frame).is_err() {
            log::trace!("Frame sink receiver dropped");
        }
    }
}

pub struct ProtocolHandler {
    server: Weak<NetServer>,
    sink: Arc<dyn FrameSink>,
}

impl ProtocolHandler {
    pub fn new(server: Weak<NetServer>, sink: Arc<dyn FrameSink>) -> Self {
        Self { server, sink }
    }

    async fn reply<T: Serialize>(server: &NetServer, link: &Link, command: Command, payload: &T) {
        let frame = match server.message(command, payload) {
            Ok(frame) => frame,
            Err(e) => {
                log::error!("Failed to encode {}: {}", command.as_str(), e);
                return;
            }
        };
        if let Err(e) = link.tx(&frame).await {
            log::debug!("Failed to send {} to {}: {}", command.as_str(), link.addr(), e);
        }
    }

    async fn on_version(&self, server: &Arc<NetServer>, link: &Arc<Link>, payload: &[u8]) {
        let version: VersionPayload = match decode_payload(payload) {
            Ok(v) => v,
            Err(e) => {
                log::warn!("Malformed version from {}: {}", link.addr(), e);
                server.disconnect(link).await;
                return;
            }
        };

        if version.nonce == server.id() {
            log::info!("Connected to ourselves via {}, dropping", link.addr());
            server.disconnect(link).await;
            return;
        }

        if let Some(existing) = server.table().get_nbr_node(version.nonce).await {
            if !Arc::ptr_eq(&existing, link) {
                if existing.is_established() {
                    log::info!(
                        "Peer {} already connected via {}, rejecting {}",
                        version.nonce,
                        existing.addr(),
                        link.addr()
                    );
                    server.disconnect(link).await;
                    return;
                }
                server.table().del_if_same(&existing).await;
            }
        }

        link.set_id(version.nonce);
        link.set_height(version.start_height);
        link.set_relay(version.relay);
        link.set_ports(version.sync_port, version.cons_port);

        if link.is_outbound() {
            if !link.transition(LinkState::Hand, LinkState::HandShaked) {
                log::warn!("Unexpected version from {} in {}", link.addr(), link.state());
                server.disconnect(link).await;
                return;
            }
            Self::reply(server, link, Command::VerAck, &()).await;
        } else {
            if !link.transition(LinkState::Hand, LinkState::HandShake) {
                log::warn!("Unexpected version from {} in {}", link.addr(), link.state());
                server.disconnect(link).await;
                return;
            }
            match server.version_frame(false) {
                Ok(frame) => {
                    if let Err(e) = link.tx(&frame).await {
                        log::debug!("Failed to send version to {}: {}", link.addr(), e);
                    }
                }
                Err(e) => log::error!("Failed to encode version: {}", e),
            }
        }
    }

    async fn on_verack(&self, server: &Arc<NetServer>, link: &Arc<Link>) {
        match link.state() {
            LinkState::HandShake => {
                if link.transition(LinkState::HandShake, LinkState::Establish) {
                    Self::reply(server, link, Command::VerAck, &()).await;
                    server.on_established(link).await;
                }
            }
            LinkState::HandShaked => {
                if link.transition(LinkState::HandShaked, LinkState::Establish) {
                    server.on_established(link).await;
                }
            }
            state => {
                log::warn!("Unexpected verack from {} in {}", link.addr(), state);
            }
        }
    }

    async fn on_get_addr(&self, server: &NetServer, link: &Link) {
        let addrs: Vec<_> = server
            .table()
            .neighbor_addrs()
            .await
            .into_iter()
            .filter(|a| a.id != link.id())
            .take(MAX_ADDR_NODE_CNT)
            .collect();
        Self::reply(server, link, Command::Addr, &AddrPayload { addrs }).await;
    }

    async fn on_addr(&self, server: &Arc<NetServer>, payload: &[u8]) {
        let addrs: AddrPayload = match decode_payload(payload) {
            Ok(a) => a,
            Err(e) => {
                log::debug!("Malformed addr payload: {}", e);
                return;
            }
        };

        for peer in addrs.addrs.into_iter().take(MAX_ADDR_NODE_CNT) {
            if peer.id == server.id() || peer.port == 0 {
                continue;
            }
            if server.table().node_existed(peer.id).await {
                continue;
            }
            if server.table().len().await >= server.config().max_connections {
                break;
            }

            let server = server.clone();
            let addr = peer.to_addr_string();
            tokio::spawn(async move {
                if let Err(e) = server.connect(&addr).await {
                    log::debug!("Could not reach advertised peer {}: {}", addr, e);
                }
            });
        }
    }
}

#[async_trait]
impl MessageHandler for ProtocolHandler {
    async fn handle_frame(&self, link: Arc<Link>, channel: Channel, frame: Bytes) {
        let Some(server) = self.server.upgrade() else {
            return;
        };

        let (header, payload) = match split_frame(&frame) {
            Ok(parts) => parts,
            Err(e) => {
                log::warn!("Undecodable frame from {}: {}", link.addr(), e);
                return;
            }
        };
        if !header.verify_checksum(&payload) {
            log::warn!(
                "Checksum mismatch on {} from {}, dropping",
                header.command_name(),
                link.addr()
            );
            return;
        }

        match header.command() {
            Some(Command::Version) => self.on_version(&server, &link, &payload).await,
            Some(Command::VerAck) => self.on_verack(&server, &link).await,
            Some(Command::Disconnect) => {
                log::info!("Peer {} asked to disconnect", link.addr());
                server.disconnect(&link).await;
            }
            _ if !link.is_established() => {
                log::debug!(
                    "Ignoring {} from {} in {}",
                    header.command_name(),
                    link.addr(),
                    link.state()
                );
            }
            Some(Command::Ping) => {
                if let Ok(ping) = decode_payload::<HeightPayload>(&payload) {
                    link.set_height(ping.height);
                }
                let height = HeightPayload {
                    height: server.ledger().current_block_height() as u64,
                };
                Self::reply(&server, &link, Command::Pong, &height).await;
            }
            Some(Command::Pong) => {
                if let Ok(pong) = decode_payload::<HeightPayload>(&payload) {
                    link.set_height(pong.height);
                }
            }
            Some(Command::GetAddr) => self.on_get_addr(&server, &link).await,
            Some(Command::Addr) => self.on_addr(&server, &payload).await,
            _ => self.sink.deliver(InboundFrame {
                peer_id: link.id(),
                channel,
                command: header.command_name().to_string(),
                payload,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_sink_forwards() {
        let (sink, mut rx) = ChannelSink::new();
        let frame = InboundFrame {
            peer_id: 9,
            channel: Channel::Data,
            command: "block".into(),
            payload: Bytes::from_static(b"{}"),
        };
        sink.deliver(frame.clone());
        assert_eq!(rx.try_recv().unwrap(), frame);
    }

    #[test]
    fn test_channel_sink_tolerates_dropped_receiver() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        sink.deliver(InboundFrame {
            peer_id: 1,
            channel: Channel::Consensus,
            command: "consensus".into(),
            payload: Bytes::new(),
        });
    }
}
