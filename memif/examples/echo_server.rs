//! Echo server: accepts one memif client and echoes every packet back.
//!
//! Run with: `cargo run --example echo_server [-- /tmp/memif.sock]`

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use memif::{FnPortHandler, Port, PortConfig, Socket};

fn packet_processing(port: &Port) {
    let rxq0 = port.rx_queue(0).expect("rx queue");
    let txq0 = port.tx_queue(0).expect("tx queue");
    let quit = port.quit_receiver();

    std::thread::spawn(move || {
        let mut pkt = vec![0u8; 2048];
        loop {
            if let Err(crossbeam_channel::TryRecvError::Disconnected) = quit.try_recv() {
                return;
            }
            match rxq0.read_packet(&mut pkt) {
                Ok(0) => std::thread::sleep(Duration::from_micros(50)),
                Ok(n) => {
                    txq0.write_packet(&pkt[..n]);
                }
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
            packet_processing(port);
            Ok(())
        },
        |port: &Port| {
            println!("Disconnected: {}", port.name());
            Ok(())
        },
    ));

    let socket = Socket::new("echo-server", path)?;
    let port = socket.add_port(PortConfig::new(0, "memif0", handler).server(true))?;
    socket.start_polling();

    let errors = socket.errors();
    loop {
        match errors.recv_timeout(Duration::from_secs(20)) {
            Ok(err) => tracing::error!(error = %err, "socket error"),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                println!("{port}");
            }
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        }
    }
    Ok(())
}
