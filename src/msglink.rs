use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

use anyhow::anyhow;
use tokio::sync::mpsc;

use crate::cobsr::FrameDecoder;
use crate::packets::{MAX_FRAME_LEN, Message};

// Read timeout of the serial port, bounds how long the receive thread takes to notice shutdown
const SERIAL_READ_TIMEOUT: Duration = Duration::from_millis(10);
const RX_CHUNK_SIZE: usize = 64;

/// Duplex message channel to the flight-controller
///
/// Implementations deliver every valid incoming message exactly once, in
/// arrival order. Sending takes `&mut self`, so a transport has a single writer.
#[allow(async_fn_in_trait)]
pub trait Transport {
    /// Send one message, without waiting for any answer
    ///
    /// Writing to the device may block for the whole frame. Implementations
    /// must not stall the async runtime while doing so.
    async fn send(&mut self, message: &Message) -> anyhow::Result<()>;

    /// Wait up to `timeout` for the next incoming message
    ///
    /// Returns `Ok(None)` on timeout. A timeout leaves the transport usable.
    ///
    /// # Errors
    ///
    /// Returns an error if the link is closed and no message is queued.
    async fn recv(&mut self, timeout: Duration) -> anyhow::Result<Option<Message>>;
}

/// # Message link over a byte stream
///
/// Outgoing messages are stuffed into a buffer owned by the link, sized for the
/// largest legal frame, and written in one go on tokio's blocking pool.
///
/// Incoming bytes are read by a background thread which splits them into
/// frames, drops frames that fail to decode or whose checksum does not match,
/// and queues the valid messages. The queue is unbounded so no valid message is
/// ever lost for lack of space.
///
/// The thread stops when the stream ends, when reading fails, or when the link
/// is dropped.
pub struct MsgLink {
    // Lent to the blocking pool during a send, lost if that send panicked
    writer: Option<Box<dyn Write + Send>>,
    tx_buf: Vec<u8>,
    inbox: mpsc::UnboundedReceiver<Message>,
}

impl MsgLink {
    /// Create a link from the two halves of a byte stream
    ///
    /// # Arguments
    /// * `reader` - Read half, moved to the receive thread
    /// * `writer` - Write half
    ///
    /// # Returns
    /// A Result containing the MsgLink or an error if the receive thread could not be started.
    pub fn new<R, W>(reader: R, writer: W) -> anyhow::Result<Self>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let (tx, inbox) = mpsc::unbounded_channel();
        std::thread::Builder::new()
            .name("msglink-rx".into())
            .spawn(move || receive_loop(reader, tx))
            .map_err(|e| anyhow!("Failed to start receive thread: {}", e))?;

        Ok(MsgLink {
            writer: Some(Box::new(writer)),
            tx_buf: Vec::with_capacity(MAX_FRAME_LEN + 2),
            inbox,
        })
    }

    /// Open a serial port and create a link over it
    ///
    /// # Arguments
    /// * `port_name` - Serial port to open, e.g. `/dev/ttyUSB0` or `COM3`
    /// * `baud_rate` - Line speed
    pub fn open_serial(port_name: &str, baud_rate: u32) -> anyhow::Result<Self> {
        let port = serialport::new(port_name, baud_rate)
            .timeout(SERIAL_READ_TIMEOUT)
            .open()
            .map_err(|e| anyhow!("Failed to open serial port {}: {}", port_name, e))?;
        let reader = port
            .try_clone()
            .map_err(|e| anyhow!("Failed to clone serial port {}: {}", port_name, e))?;

        Self::new(reader, port)
    }
}

impl Transport for MsgLink {
    async fn send(&mut self, message: &Message) -> anyhow::Result<()> {
        let mut writer = self.writer.take().ok_or_else(|| anyhow!("Link closed: writer was lost"))?;
        let mut frame = std::mem::take(&mut self.tx_buf);
        message.encode_frame(&mut frame);
        log::trace!("-> {:?} ({} bytes on wire)", message, frame.len());

        let (writer, frame, result) = tokio::task::spawn_blocking(move || {
            let result = writer.write_all(&frame).and_then(|_| writer.flush());
            (writer, frame, result)
        })
        .await
        .map_err(|e| anyhow!("Link error during send: {}", e))?;

        self.writer = Some(writer);
        self.tx_buf = frame;
        result.map_err(|e| anyhow!("Link error during send: {}", e))
    }

    async fn recv(&mut self, timeout: Duration) -> anyhow::Result<Option<Message>> {
        match tokio::time::timeout(timeout, self.inbox.recv()).await {
            Ok(Some(message)) => Ok(Some(message)),
            Ok(None) => Err(anyhow!("Link closed: receive thread has stopped")),
            Err(_) => Ok(None),
        }
    }
}

fn receive_loop<R: Read>(mut reader: R, inbox: mpsc::UnboundedSender<Message>) {
    let mut decoder = FrameDecoder::new(MAX_FRAME_LEN);
    let mut buf = [0u8; RX_CHUNK_SIZE];

    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => {
                log::debug!("Link reached end of stream");
                return;
            }
            Ok(n) => n,
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                if inbox.is_closed() {
                    return;
                }
                continue;
            }
            Err(e) => {
                log::warn!("Link read failed: {}", e);
                return;
            }
        };

        for &byte in &buf[..n] {
            let frame = match decoder.push(byte) {
                None => continue,
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    log::debug!("Dropping frame: {}", e);
                    continue;
                }
            };

            match Message::from_frame(&frame) {
                Ok(message) => {
                    log::trace!("<- {:?}", message);
                    if inbox.send(message).is_err() {
                        return;
                    }
                }
                Err(e) => log::debug!("Dropping message: {}", e),
            }
        }
    }
}
