//! Echo client: sends a timestamped packet every second and reports
//! the round-trip time when the echo comes back.
//!
//! Run with: `cargo run --example echo_client [-- /tmp/memif.sock]`

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use memif::{FnPortHandler, Port, PortConfig, Socket};

fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

fn send_packets(port: &Port) {
    let txq0 = port.tx_queue(0).expect("tx queue");
    let quit = port.quit_receiver();

    std::thread::spawn(move || {
        let mut pkt = vec![0u8; 800];
        loop {
            // A disconnected quit channel means the port went down.
            match quit.recv_timeout(Duration::from_secs(1)) {
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                _ => return,
            }
            pkt[..8].copy_from_slice(&now_nanos().to_be_bytes());
            txq0.write_packet(&pkt);
        }
    });
}

fn recv_packets(port: &Port) {
    let rxq0 = port.rx_queue(0).expect("rx queue");
    let quit = port.quit_receiver();

    std::thread::spawn(move || {
        let mut pkt = vec![0u8; 2048];
        loop {
            if let Err(crossbeam_channel::TryRecvError::Disconnected) = quit.try_recv() {
                return;
            }
            match rxq0.read_packet(&mut pkt) {
                Ok(n) if n >= 8 => {
                    let sent = u64::from_be_bytes(pkt[..8].try_into().unwrap());
                    let rtt = now_nanos().saturating_sub(sent);
                    println!("RTT: {:?}", Duration::from_nanos(rtt));
                }
                Ok(_) => std::thread::sleep(Duration::from_micros(50)),
                Err(err) => tracing::warn!(error = %err, "recv error"),
            }
        }
    });
}

fn main() -> memif::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let path = std::env::args().nth(1).map(PathBuf::from);

    let handler = Arc::new(FnPortHandler::new(
        |port: &Port| {
            println!("Connected: {}", port.name());
            send_packets(port);
            recv_packets(port);
            Ok(())
        },
        |port: &Port| {
            println!("Disconnected: {}", port.name());
            Ok(())
        },
    ));

    let socket = Socket::new("echo-client", path)?;
    let port = socket.add_port(PortConfig::new(0, "memif_c0", handler))?;
    socket.start_polling();

    // The server may not be up yet; connection refused is retried.
    while !port.is_connecting() {
        if let Err(err) = port.request_connection() {
            tracing::debug!(error = %err, "connect failed, retrying");
            std::thread::sleep(Duration::from_millis(500));
        }
    }
    println!("{port}");

    let errors = socket.errors();
    while let Ok(err) = errors.recv() {
        tracing::error!(error = %err, "socket error");
    }
    Ok(())
}
