// # Bridge Transport
//
// A `Transport` fed by an external radio bridge through a file or FIFO.
//
// ## Wire format
//
// One line per notification, in arrival order:
//
// - a decimal counter value (`0` ..= `4294967295`)
// - `lost` when the bridge lost the peer
//
// End of file also means the link is lost. Opening the path is the
// handshake; the first line is the priming read. Blank lines are ignored,
// anything else is logged and skipped.
//
// ## Availability
//
// The transport is unavailable when the directory that should contain the
// bridge path does not exist, which is how a host without the bridge
// installed looks.

use async_trait::async_trait;
use puffsync_core::traits::{
    CounterChannel, DeviceFilter, DeviceIdentity, Link, LinkEvent, LinkEventStream, Transport,
};
use puffsync_core::Error;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};

/// One parsed bridge line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BridgeLine {
    Counter(u32),
    Lost,
    Blank,
}

fn parse_line(line: &str) -> Result<BridgeLine, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(BridgeLine::Blank);
    }
    if line.eq_ignore_ascii_case("lost") {
        return Ok(BridgeLine::Lost);
    }
    line.parse::<u32>()
        .map(BridgeLine::Counter)
        .map_err(|e| format!("'{}' is not a counter value: {}", line, e))
}

/// Transport over a bridge file or FIFO
pub struct BridgeTransport {
    path: PathBuf,
    device: DeviceIdentity,
}

impl BridgeTransport {
    pub fn new(path: impl Into<PathBuf>, device: DeviceIdentity) -> Self {
        Self {
            path: path.into(),
            device,
        }
    }
}

#[async_trait]
impl Transport for BridgeTransport {
    fn is_available(&self) -> bool {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.is_dir(),
            _ => true,
        }
    }

    async fn select_device(&self, filter: &DeviceFilter) -> Result<DeviceIdentity, Error> {
        // The bridge serves exactly one configured device; the filter can only reject it
        if let (Some(prefix), Some(name)) = (&filter.name_prefix, &self.device.name)
            && !name.starts_with(prefix.as_str())
        {
            warn!(
                device = %self.device,
                prefix = %prefix,
                "Bridge device does not match the name filter"
            );
            return Err(Error::SelectionCancelled);
        }
        Ok(self.device.clone())
    }

    async fn open_link(&self, device: &DeviceIdentity) -> Result<Box<dyn Link>, Error> {
        let file = File::open(&self.path).await.map_err(|e| match e.kind() {
            ErrorKind::PermissionDenied => Error::permission_denied(format!(
                "cannot read bridge {}: {}",
                self.path.display(),
                e
            )),
            _ => Error::handshake(format!(
                "cannot open bridge {}: {}",
                self.path.display(),
                e
            )),
        })?;
        debug!(device = %device, path = %self.path.display(), "Bridge opened");

        Ok(Box::new(BridgeLink {
            lines: tokio::sync::Mutex::new(Some(BufReader::new(file).lines())),
            connected: Arc::new(AtomicBool::new(true)),
            reader: Mutex::new(None),
        }))
    }
}

/// One open bridge stream
struct BridgeLink {
    lines: tokio::sync::Mutex<Option<Lines<BufReader<File>>>>,
    connected: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl BridgeLink {
    fn check_channel(channel: &CounterChannel) -> Result<(), Error> {
        if *channel != CounterChannel::default() {
            return Err(Error::handshake(format!(
                "bridge only forwards the counter characteristic, not {}/{}",
                channel.service, channel.characteristic
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Link for BridgeLink {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn resolve_channel(&self, channel: &CounterChannel) -> Result<(), Error> {
        Self::check_channel(channel)
    }

    async fn read_value(&self, channel: &CounterChannel) -> Result<Vec<u8>, Error> {
        Self::check_channel(channel)?;
        let mut guard = self.lines.lock().await;
        let lines = guard
            .as_mut()
            .ok_or_else(|| Error::handshake("bridge already subscribed"))?;

        loop {
            let line = lines
                .next_line()
                .await
                .map_err(|e| Error::handshake(format!("bridge read failed: {}", e)))?
                .ok_or_else(|| Error::handshake("bridge closed before the first value"))?;

            match parse_line(&line).map_err(Error::handshake)? {
                BridgeLine::Counter(value) => return Ok(value.to_le_bytes().to_vec()),
                BridgeLine::Lost => return Err(Error::handshake("bridge reported the peer lost")),
                BridgeLine::Blank => continue,
            }
        }
    }

    async fn subscribe(&self, channel: &CounterChannel) -> Result<LinkEventStream, Error> {
        Self::check_channel(channel)?;
        let mut lines = self
            .lines
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::handshake("bridge already subscribed"))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let connected = self.connected.clone();
        let reader = tokio::spawn(async move {
            loop {
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        debug!("Bridge reached end of input");
                        break;
                    }
                    Err(e) => {
                        let _ = tx.send(LinkEvent::Lost {
                            reason: format!("bridge read failed: {}", e),
                        });
                        break;
                    }
                };

                let event = match parse_line(&line) {
                    Ok(BridgeLine::Counter(value)) => LinkEvent::Value(value.to_le_bytes().to_vec()),
                    Ok(BridgeLine::Lost) => LinkEvent::Lost {
                        reason: "bridge reported the peer lost".to_string(),
                    },
                    Ok(BridgeLine::Blank) => continue,
                    Err(e) => {
                        warn!("Skipping bridge line: {}", e);
                        continue;
                    }
                };

                let lost = matches!(event, LinkEvent::Lost { .. });
                if tx.send(event).is_err() || lost {
                    break;
                }
            }
            connected.store(false, Ordering::SeqCst);
        });

        *self.reader.lock().unwrap_or_else(PoisonError::into_inner) = Some(reader);
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn disconnect(&self) -> Result<(), Error> {
        self.connected.store(false, Ordering::SeqCst);
        let reader = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(reader) = reader {
            reader.abort();
        }
        self.lines.lock().await.take();
        Ok(())
    }
}
