//! Bridges stdin/stdout to multiplexer channels
//!
//! Received data from every established channel is printed tagged with its
//! DLCI. Lines typed on stdin go to the first channel; a refused write waits
//! for that channel's callback before retrying.

use std::io::Write;
use std::sync::Arc;

use anyhow::{bail, Context};
use cmux::{DataChannel, Dlci, EstablishStatus, Mux, MuxEvent, SerialTransport, TokioEventQueue};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, mpsc, Notify};
use tracing::{debug, info, warn};

use crate::settings::Settings;

/// Open the port, start the multiplexer and run until stdin closes or Ctrl-C
pub async fn run(settings: &Settings) -> anyhow::Result<()> {
    let transport = SerialTransport::open(&settings.port, settings.baud_rate)
        .with_context(|| format!("Failed to open {}", settings.port))?;

    let mux = Mux::new(settings.mux.clone())?;
    mux.eventqueue_attach(Arc::new(TokioEventQueue::current()))?;
    mux.serial_attach(transport)?;
    tokio::spawn(log_events(mux.subscribe()));

    let started = mux.request_mux_start()?.resolved().await?;
    if started.status != EstablishStatus::Success {
        bail!("Multiplexer start failed: {:?}", started.status);
    }

    let (data_tx, mut data_rx) = mpsc::unbounded_channel();
    let writable = Arc::new(Notify::new());
    let channels = establish_channels(&mux, &settings.dlcis, &data_tx, &writable).await?;
    let Some(primary) = channels.first().cloned() else {
        bail!("No channel could be established");
    };
    info!("Sending stdin to DLCI {} (mtu {})", primary.dlci(), primary.mtu());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            Some((dlci, data)) = data_rx.recv() => {
                let mut stdout = std::io::stdout().lock();
                writeln!(stdout, "{}", format_chunk(dlci, &data))?;
                stdout.flush()?;
            }
            line = lines.next_line() => match line? {
                Some(line) => {
                    let mut bytes = line.into_bytes();
                    bytes.extend_from_slice(settings.line_ending.as_bytes());
                    send_all(&primary, &bytes, &writable).await;
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    info!("Stopping: {:?}", mux.stats());
    Ok(())
}

async fn establish_channels(
    mux: &Mux,
    ids: &[u8],
    data_tx: &mpsc::UnboundedSender<(Dlci, Vec<u8>)>,
    writable: &Arc<Notify>,
) -> anyhow::Result<Vec<DataChannel>> {
    let mut channels = Vec::with_capacity(ids.len());
    for &id in ids {
        let establishment = mux.request_dlci_establish(id)?.resolved().await?;
        let Some(channel) = establishment.channel else {
            warn!("DLCI {} not established: {:?}", id, establishment.status);
            continue;
        };

        let data_tx = data_tx.clone();
        let writable = writable.clone();
        channel.sigio(move |io| {
            let mut buf = [0u8; 128];
            while let Ok(n) = io.read(&mut buf) {
                if n == 0 {
                    break;
                }
                let _ = data_tx.send((io.dlci(), buf[..n].to_vec()));
            }
            writable.notify_one();
        });
        channels.push(channel);
    }
    Ok(channels)
}

/// Write all of `data`, one MTU at a time
async fn send_all(channel: &DataChannel, mut data: &[u8], writable: &Notify) {
    while !data.is_empty() {
        let written = channel.write(data);
        if written == 0 {
            debug!("DLCI {} busy, waiting", channel.dlci());
            writable.notified().await;
            continue;
        }
        data = &data[written..];
    }
}

async fn log_events(mut events: broadcast::Receiver<MuxEvent>) {
    loop {
        match events.recv().await {
            Ok(MuxEvent::FrameDropped { reason }) => debug!("Frame dropped: {:?}", reason),
            Ok(MuxEvent::Retransmit { dlci, remaining }) => {
                debug!("SABM retry on DLCI {} ({} left)", dlci, remaining)
            }
            Ok(MuxEvent::EstablishFailed { target, status }) => {
                warn!("Establishment of {:?} failed: {:?}", target, status)
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => debug!("Missed {} mux events", n),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Render received bytes for the terminal
fn format_chunk(dlci: Dlci, data: &[u8]) -> String {
    let text = String::from_utf8_lossy(data);
    format!("[{}] {}", dlci, text.trim_end_matches(['\r', '\n']))
}
