use std::{net::SocketAddr, sync::Arc, time::Instant};

use ahash::AHashMap;
use anyhow::Result;
use bytes::{Bytes, BytesMut};
use engine::{Engine, HOUSEKEEPING_INTERVAL, SessionId};
use tokio::{
    net::UdpSocket,
    sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
    time::interval,
};

use crate::{
    config::Config,
    observer::Observer,
    statistics::{Statistics, StatisticsReporter, Stats},
};

const RATE_REFRESH_INTERVAL: std::time::Duration = std::time::Duration::from_millis(100);

/// Work posted onto the engine's event loop from other tasks.
pub enum Command {
    Transmission {
        destination_client_service_id: u64,
        destination_engine_id: u64,
        data: Bytes,
        length_of_red_part: u64,
        user_data: Bytes,
    },
    Cancellation {
        session_id: SessionId,
    },
    UpdateRate {
        max_send_rate_bits_per_sec: u64,
    },
}

/// Thread-safe surface of the engine: every call posts work onto the
/// event loop task and returns immediately.
#[derive(Clone)]
pub struct LtpHandle(UnboundedSender<Command>);

impl LtpHandle {
    /// Queue a block for transmission; the red part is the reliable
    /// prefix and `user_data` is echoed back in transmission notices.
    pub fn transmission_request(
        &self,
        destination_client_service_id: u64,
        destination_engine_id: u64,
        data: Bytes,
        length_of_red_part: u64,
        user_data: Bytes,
    ) -> Result<()> {
        self.0
            .send(Command::Transmission {
                destination_client_service_id,
                destination_engine_id,
                data,
                length_of_red_part,
                user_data,
            })
            .map_err(|_| anyhow::anyhow!("the ltp server is no longer running"))
    }

    pub fn cancellation_request(&self, session_id: SessionId) -> Result<()> {
        self.0
            .send(Command::Cancellation { session_id })
            .map_err(|_| anyhow::anyhow!("the ltp server is no longer running"))
    }

    pub fn update_rate(&self, max_send_rate_bits_per_sec: u64) -> Result<()> {
        self.0
            .send(Command::UpdateRate {
                max_send_rate_bits_per_sec,
            })
            .map_err(|_| anyhow::anyhow!("the ltp server is no longer running"))
    }
}

/// udp server
///
/// Binds the socket, spawns the engine's event loop task and returns a
/// handle for posting transmission requests onto it.
pub async fn start(
    config: &Arc<Config>,
    statistics: &Statistics,
    observer: Observer,
) -> Result<LtpHandle> {
    let socket = UdpSocket::bind(config.network.listen).await?;
    let local_addr = socket.local_addr()?;

    let peers: AHashMap<u64, SocketAddr> = config
        .network
        .peers
        .iter()
        .map(|peer| (peer.engine_id, peer.address))
        .collect();

    log::info!(
        "server listening: listen={}, local addr={}, engine id={}, peers={}",
        config.network.listen,
        local_addr,
        config.engine.engine_id,
        peers.len(),
    );

    let (sender, receiver) = unbounded_channel();
    let engine = Engine::new(config.engine.as_options(), observer);

    tokio::spawn(event_loop(
        socket,
        peers,
        engine,
        receiver,
        statistics.get_reporter(),
        config.network.mtu,
    ));

    Ok(LtpHandle(sender))
}

async fn event_loop(
    socket: UdpSocket,
    peers: AHashMap<u64, SocketAddr>,
    mut engine: Engine<Observer>,
    mut commands: UnboundedReceiver<Command>,
    reporter: StatisticsReporter,
    mtu: usize,
) {
    let peers_by_address: AHashMap<SocketAddr, u64> =
        peers.iter().map(|(id, address)| (*address, *id)).collect();

    let mut buffer = vec![0u8; mtu * 2];
    let mut housekeeping = interval(HOUSEKEEPING_INTERVAL);
    let mut rate_refresh = interval(RATE_REFRESH_INTERVAL);
    let mut last_rate_refresh = Instant::now();

    loop {
        let next_expiry = engine.next_timer_expiry();

        tokio::select! {
            result = socket.recv_from(&mut buffer) => {
                match result {
                    Ok((size, address)) => {
                        if let Some(engine_id) = peers_by_address.get(&address) {
                            reporter.send(
                                *engine_id,
                                &[Stats::ReceivedBytes(size), Stats::ReceivedPkts(1)],
                            );
                        }

                        if let Err(e) = engine.packet_in(&buffer[..size]) {
                            log::warn!("dropped a malformed packet: source={address}, error={e}");
                            if let Some(engine_id) = peers_by_address.get(&address) {
                                reporter.send(*engine_id, &[Stats::ErrorPkts(1)]);
                            }
                        }
                    }
                    Err(e) => {
                        log::error!("udp receive failed: {e}");
                        continue;
                    }
                }
            }
            command = commands.recv() => {
                match command {
                    Some(Command::Transmission {
                        destination_client_service_id,
                        destination_engine_id,
                        data,
                        length_of_red_part,
                        user_data,
                    }) => {
                        engine.transmission_request(
                            destination_client_service_id,
                            destination_engine_id,
                            data,
                            length_of_red_part,
                            user_data,
                        );
                    }
                    Some(Command::Cancellation { session_id }) => {
                        if !engine.cancellation_request(&session_id) {
                            log::warn!("cancellation of unknown session {session_id}");
                        }
                    }
                    Some(Command::UpdateRate { max_send_rate_bits_per_sec }) => {
                        engine.update_rate(max_send_rate_bits_per_sec);
                    }
                    None => {
                        log::error!("all ltp handles dropped, server loop stopping");
                        break;
                    }
                }
            }
            _ = async {
                match next_expiry {
                    Some(expiry) => tokio::time::sleep_until(expiry.into()).await,
                    None => std::future::pending().await,
                }
            } => {
                engine.advance_timers(Instant::now());
            }
            _ = housekeeping.tick() => {
                engine.housekeeping(Instant::now());
            }
            _ = rate_refresh.tick(), if engine.rate_limiting_enabled() => {
                let now = Instant::now();
                engine.refresh_rate_tokens(now - last_rate_refresh);
                last_rate_refresh = now;
            }
        }

        // drain everything the engine can currently send; when the rate
        // limiter runs dry this stops and the refresh tick resumes it
        while let Some(packet) = engine.next_packet_to_send() {
            let Some(address) = peers.get(&packet.remote_engine_id) else {
                log::warn!(
                    "no route to engine {}, dropping an outbound packet",
                    packet.remote_engine_id
                );
                continue;
            };

            let mut datagram = BytesMut::with_capacity(packet.total_length());
            for fragment in &packet.fragments {
                datagram.extend_from_slice(fragment);
            }

            match socket.send_to(&datagram, address).await {
                Ok(size) => {
                    reporter.send(
                        packet.remote_engine_id,
                        &[Stats::SendBytes(size), Stats::SendPkts(1)],
                    );
                }
                Err(e) => {
                    log::error!("udp send failed: target={address}, error={e}");
                }
            }
        }
    }
}
