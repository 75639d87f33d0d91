use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::thread;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::sync::mpsc;
use quadloader::checksum::checksum32;
use quadloader::cobsr::{self, FrameDecoder};
use quadloader::packets::{BootRequest, MAX_FRAME_LEN, Message};
use quadloader::{BootConfig, FirmwareImage, FirmwareUpdater, MsgLink, NoProgress, Transport, UpdateOutcome};

const BASE: u32 = 0x0801_0000;

fn link_pair() -> (MsgLink, UnixStream) {
    let (ours, theirs) = UnixStream::pair().unwrap();
    let link = MsgLink::new(ours.try_clone().unwrap(), ours).unwrap();
    (link, theirs)
}

fn wire(message: &Message) -> Vec<u8> {
    let mut buf = Vec::new();
    message.encode_frame(&mut buf);
    buf
}

// Writer that hands each write, then an empty marker per flush, to a bounded channel
struct ChannelWriter(mpsc::Sender<Vec<u8>>);

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.blocking_send(buf.to_vec()).map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.blocking_send(Vec::new()).map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))
    }
}

// Minimal bootloader speaking the real wire format, returns its flash once it has exited
fn run_device(mut stream: UnixStream) -> BTreeMap<u32, u8> {
    let mut flash = BTreeMap::new();
    let mut decoder = FrameDecoder::new(MAX_FRAME_LEN);
    let mut buf = [0u8; 128];

    loop {
        let n = match stream.read(&mut buf) {
            Ok(0) | Err(_) => return flash,
            Ok(n) => n,
        };
        for &byte in &buf[..n] {
            let Some(Ok(raw)) = decoder.push(byte) else { continue };
            let message = Message::from_frame(&raw).unwrap();
            let reply = match BootRequest::from_message(&message).unwrap() {
                BootRequest::ShellFromPc(_) => None,
                BootRequest::Enter { .. } | BootRequest::Exit => Some(vec![1]),
                BootRequest::EraseSector { .. } => Some(vec![9]),
                BootRequest::WriteData { address, data } => {
                    for (i, b) in data.into_iter().enumerate() {
                        flash.insert(address + i as u32, b);
                    }
                    Some(vec![9])
                }
                BootRequest::Verify { address, length } => {
                    let bytes: Vec<u8> = (address..address + length).map(|a| flash[&a]).collect();
                    Some(checksum32(&bytes).to_le_bytes().to_vec())
                }
            };
            if let Some(payload) = reply {
                stream.write_all(&wire(&Message::boot_response(&payload).unwrap())).unwrap();
            }
            if message == Message::boot_exit() {
                return flash;
            }
        }
    }
}

#[tokio::test]
async fn send_writes_one_delimited_frame() {
    let (mut link, mut peer) = link_pair();
    let message = Message::boot_write_data(BASE, &[0x00, 0x01, 0x00, 0xFF]).unwrap();
    link.send(&message).await.unwrap();

    let expected = wire(&message);
    let mut received = vec![0u8; expected.len()];
    peer.read_exact(&mut received).unwrap();

    assert_eq!(received, expected);
    assert_eq!(received[0], 0x00);
    assert_eq!(received.iter().filter(|&&b| b == 0x00).count(), 2);
    assert_eq!(Message::from_frame(&cobsr::decode(&received[1..]).unwrap()).unwrap(), message);
}

#[tokio::test]
async fn send_does_not_block_the_runtime() {
    // One slot: the flush can only complete once this task has taken the frame
    let (tx, mut rx) = mpsc::channel(1);
    let mut link = MsgLink::new(io::empty(), ChannelWriter(tx)).unwrap();
    let message = Message::boot_erase_sector(4);

    let (sent, (frame, flushed)) = tokio::join!(link.send(&message), async {
        let frame = rx.recv().await;
        let flushed = rx.recv().await;
        (frame, flushed)
    });

    sent.unwrap();
    assert_eq!(frame, Some(wire(&message)));
    assert_eq!(flushed, Some(Vec::new()));

    // The writer is handed back after each send
    let exit = Message::boot_exit();
    let (sent, frame) = tokio::join!(link.send(&exit), async {
        let frame = rx.recv().await;
        rx.recv().await;
        frame
    });
    sent.unwrap();
    assert_eq!(frame, Some(wire(&Message::boot_exit())));
}

#[tokio::test]
async fn receive_drops_bad_frames_and_keeps_order() {
    let (mut link, mut peer) = link_pair();

    let first = Message::boot_response(&[9]).unwrap();
    let second = Message::new(0x0003, b"hello".to_vec()).unwrap();

    let mut corrupt = wire(&Message::boot_response(&[1]).unwrap());
    let last_data = corrupt.len() - 2;
    corrupt[last_data] ^= 0x80;

    let mut stream = vec![0x55; MAX_FRAME_LEN + 10];
    stream.push(0x00);
    stream.extend(corrupt);
    stream.extend(wire(&first));
    stream.extend([0x00, 0x00]);
    stream.extend(wire(&second));
    peer.write_all(&stream).unwrap();

    let timeout = Duration::from_millis(500);
    assert_eq!(link.recv(timeout).await.unwrap(), Some(first));
    assert_eq!(link.recv(timeout).await.unwrap(), Some(second));
    assert_eq!(link.recv(Duration::from_millis(50)).await.unwrap(), None);

    // A timeout does not close the link
    let third = Message::boot_response(&[1]).unwrap();
    peer.write_all(&wire(&third)).unwrap();
    assert_eq!(link.recv(timeout).await.unwrap(), Some(third));

    drop(peer);
    assert!(link.recv(timeout).await.is_err());
}

#[tokio::test]
async fn update_over_stream() {
    let (mut link, peer) = link_pair();
    let device = thread::spawn(move || run_device(peer));

    let data: Vec<u8> = (0..3000u32).map(|i| (i % 253) as u8).collect();
    let image = FirmwareImage::from_binary(BASE, data.clone());

    let outcome = FirmwareUpdater::new(&mut link, BootConfig::default(), NoProgress)
        .update_firmware(&image)
        .await
        .unwrap();
    assert!(matches!(outcome, UpdateOutcome::Completed(_)));

    let flash = device.join().unwrap();
    let written: Vec<u8> = flash.into_values().collect();
    assert_eq!(written, data);
}
