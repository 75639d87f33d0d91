// Scripted bootloader used by the engine tests

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use crate::checksum::checksum32;
use crate::msglink::Transport;
use crate::packets::{BootRequest, FlashStatus, Message};

const STATUS_OK: u8 = 1;
const STATUS_REJECTED: u8 = 0;

pub(crate) struct SimDevice {
    // Queued answers, tagged with whether they acknowledge a write
    pub inbox: VecDeque<(bool, Message)>,
    pub requests: Vec<BootRequest>,
    pub flash: BTreeMap<u32, u8>,
    pub enter_attempts: usize,
    pub enter_failures: usize,
    pub erase_status: u8,
    pub fail_write_at: Option<(u32, u8)>,
    pub crc_override: Option<u32>,
    pub silent_exit: bool,
    // Push an unrelated message ahead of every response
    pub chatter: bool,
    pub writes_received: usize,
    pub writes_acknowledged: usize,
    pub max_outstanding: usize,
}

impl SimDevice {
    pub fn new() -> Self {
        SimDevice {
            inbox: VecDeque::new(),
            requests: Vec::new(),
            flash: BTreeMap::new(),
            enter_attempts: 0,
            enter_failures: 0,
            erase_status: u8::from(FlashStatus::Complete),
            fail_write_at: None,
            crc_override: None,
            silent_exit: false,
            chatter: false,
            writes_received: 0,
            writes_acknowledged: 0,
            max_outstanding: 0,
        }
    }

    pub fn load_flash(&mut self, address: u32, data: &[u8]) {
        for (i, &b) in data.iter().enumerate() {
            self.flash.insert(address + i as u32, b);
        }
    }

    pub fn read_flash(&self, address: u32, len: usize) -> Vec<u8> {
        (0..len as u32)
            .map(|i| self.flash.get(&(address + i)).copied().unwrap_or(0xFF))
            .collect()
    }

    fn outstanding(&self) -> usize {
        self.writes_received - self.writes_acknowledged
    }

    fn respond(&mut self, acknowledges_write: bool, payload: &[u8]) {
        if self.chatter {
            let noise = Message::new(0x0003, b"shell output".to_vec()).unwrap();
            self.inbox.push_back((false, noise));
        }
        self.inbox.push_back((acknowledges_write, Message::boot_response(payload).unwrap()));
    }
}

impl Transport for SimDevice {
    async fn send(&mut self, message: &Message) -> anyhow::Result<()> {
        let request = BootRequest::from_message(message)
            .ok_or_else(|| anyhow::anyhow!("device cannot parse {:?}", message))?;
        self.requests.push(request.clone());

        match request {
            BootRequest::ShellFromPc(_) => {}
            BootRequest::Enter { .. } => {
                self.enter_attempts += 1;
                let status = if self.enter_attempts <= self.enter_failures { STATUS_REJECTED } else { STATUS_OK };
                self.respond(false, &[status]);
            }
            BootRequest::Exit => {
                if !self.silent_exit {
                    self.respond(false, &[STATUS_OK]);
                }
            }
            BootRequest::EraseSector { .. } => {
                let status = self.erase_status;
                self.respond(false, &[status]);
            }
            BootRequest::WriteData { address, data } => {
                self.writes_received += 1;
                self.max_outstanding = self.max_outstanding.max(self.outstanding());
                let status = match self.fail_write_at {
                    Some((at, status)) if at == address => status,
                    _ => {
                        self.load_flash(address, &data);
                        u8::from(FlashStatus::Complete)
                    }
                };
                self.respond(true, &[status]);
            }
            BootRequest::Verify { address, length } => {
                let crc = self
                    .crc_override
                    .unwrap_or_else(|| checksum32(&self.read_flash(address, length as usize)));
                self.respond(false, &crc.to_le_bytes());
            }
        }
        Ok(())
    }

    async fn recv(&mut self, _timeout: Duration) -> anyhow::Result<Option<Message>> {
        Ok(self.inbox.pop_front().map(|(acknowledges_write, message)| {
            if acknowledges_write {
                self.writes_acknowledged += 1;
            }
            message
        }))
    }
}
