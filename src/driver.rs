//! Optional async convenience layer (feature `tokio-driver`): owns an
//! [`Engine`] exclusively inside a single `tokio` task and feeds it from a
//! `tokio::net::UdpSocket`. Not part of the synchronous core's contract —
//! hosts that already run their own poll loop should drive `Engine`
//! directly instead.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::sleep;

use crate::connection::{Connection, ConnectionFactory};
use crate::engine::Engine;
use crate::metrics::tokio_task::TaskTiming;
use crate::metrics::{DefaultMetrics, Metrics};

/// The largest UDP datagram the driver will attempt to read in one
/// `recv_from` call.
const RECV_BUF_SIZE: usize = 64 * 1024;

/// Drives `engine` from `socket` until the socket errors out or the task is
/// cancelled. Runs ingress, lets the engine tick and egress on its own
/// schedule, and sleeps for `earliest_adv_tick` between iterations.
pub async fn run<C, F>(engine: &mut Engine<C, F>, socket: &UdpSocket) -> io::Result<()>
where
    C: Connection,
    F: ConnectionFactory<Conn = C>,
{
    let local = socket.local_addr()?;
    let mut buf = vec![0u8; RECV_BUF_SIZE];
    let metrics = DefaultMetrics;

    loop {
        let wait = next_wait(engine);
        let timing = TaskTiming::start("quic_engine_driver");

        tokio::select! {
            biased;
            recv = socket.recv_from(&mut buf) => {
                let (len, peer) = recv?;
                if let Err(err) = engine.packet_in(&buf[..len], local, peer, 0) {
                    tracing::debug!(%err, "driver: dropping unparseable datagram");
                }
            }
            _ = sleep(wait) => {}
        }

        engine.process_conns();
        timing.finish(&metrics);
    }
}

fn next_wait<C, F>(engine: &Engine<C, F>) -> Duration
where
    C: Connection,
    F: ConnectionFactory<Conn = C>,
{
    match engine.earliest_adv_tick() {
        Some(micros) if micros <= 0 => Duration::from_micros(0),
        Some(micros) => Duration::from_micros(micros as u64),
        None => Duration::from_millis(100),
    }
}

/// Sends one outgoing datagram spec over `socket`, used by a
/// [`crate::send::SendPackets`] implementation that wants to hand writes
/// off to a real `tokio::net::UdpSocket` rather than recording them.
pub async fn send_one(
    socket: &UdpSocket,
    buf: &[u8],
    peer: SocketAddr,
) -> io::Result<usize> {
    socket.send_to(buf, peer).await
}
