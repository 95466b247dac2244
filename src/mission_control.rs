//! A scripted Mission Control used to exercise a module on a virtual bus.
//!
//! The coordinator enrolls the first module that signs in, pings it, reads its
//! name, writes a set of properties and reads the whole config back.

use std::time::Duration;

use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, timeout};

use crate::a3_message;
use crate::analog3::{
    self as a3,
    StreamStatus,
    config::{ChunkParser, Property, PropertyEncoder},
};
use crate::can_controller::{CanMessage, ChannelTransport};
use crate::error::{AppError, ErrorType, Result};
use crate::module::{Module, RxInterrupt};

const BUS_CHANNEL_CAPACITY: usize = 64;

/// What the coordinator learned about the module.
#[derive(Debug, Clone)]
pub struct Report {
    pub uid: u32,
    pub module_id: u8,
    pub name: String,
    pub config: Vec<Property>,
}

pub struct MissionControl {
    can_tx: Sender<CanMessage>,
    can_rx: Receiver<CanMessage>,
    next_module_id: u8,
    next_wire: u8,
    reply_timeout: Duration,
}

impl MissionControl {
    pub fn new(can_tx: Sender<CanMessage>, can_rx: Receiver<CanMessage>) -> Self {
        Self {
            can_tx,
            can_rx,
            next_module_id: 1,
            next_wire: 1,
            reply_timeout: Duration::from_secs(2),
        }
    }

    /// Runs the script against the first module that signs in.
    pub async fn run(mut self, props: Vec<Property>) -> Result<Report> {
        log::info!("Analog3 mission control started");
        self.send(a3_message::mc_sign_in()).await?;

        let sign_in = self
            .receive("sign-in", self.reply_timeout, |message| {
                message.is_extended() && message.get_data(0) == Some(a3::A3_ADMIN_SIGN_IN)
            })
            .await?;
        let uid = sign_in.id();
        let module_id = self.next_module_id;
        self.next_module_id = self.next_module_id.wrapping_add(1);

        self.assign_module_id(uid, module_id).await?;
        self.ping(module_id).await?;

        let name = self
            .read_stream(a3::A3_MC_REQUEST_NAME, module_id, ChunkParser::for_single_field())
            .await?
            .first()
            .map(|property| property.as_text())
            .unwrap_or_default();
        log::info!("Module {:02x} is named {:?}", module_id, name);

        if !props.is_empty() {
            self.set_config(module_id, &props).await?;
        }
        let config = self
            .read_stream(a3::A3_MC_REQUEST_CONFIG, module_id, ChunkParser::new())
            .await?;

        Ok(Report {
            uid,
            module_id,
            name,
            config,
        })
    }

    async fn assign_module_id(&mut self, uid: u32, module_id: u8) -> Result<()> {
        let short_addr = a3::A3_ID_INDIVIDUAL_MODULE_BASE + module_id as u32;
        let mut timeout_interval = Duration::from_millis(50);
        log::info!("Assigning module id {:02x} for uid {:08x}", module_id, uid);
        for _ in 0..10 {
            self.send(a3_message::assign_module_id(uid, module_id)).await?;
            let result = self
                .receive("id-assign", timeout_interval, |message| {
                    message.id() == short_addr
                        && message.get_data(0) == Some(a3::A3_IM_ID_ASSIGN_ACK)
                })
                .await;
            match result {
                Ok(_) => {
                    log::info!("ID confirmed module id {:02x} for uid {:08x}", module_id, uid);
                    return Ok(());
                }
                Err(_) => {
                    log::warn!(
                        "No response from peer for ID assignment, retrying; id={:02x}, uid={:08x}",
                        module_id,
                        uid
                    );
                    timeout_interval *= 2;
                }
            }
        }
        Err(AppError::runtime("ID assignment timed out"))
    }

    async fn ping(&mut self, module_id: u8) -> Result<()> {
        let short_addr = a3::A3_ID_INDIVIDUAL_MODULE_BASE + module_id as u32;
        self.send(a3_message::ping(module_id, true)).await?;
        self.receive("ping", self.reply_timeout, |message| {
            message.id() == short_addr && message.get_data(0) == Some(a3::A3_IM_PING_REPLY)
        })
        .await?;
        log::info!("Module {:02x} answered ping", module_id);
        Ok(())
    }

    /// Reads a name or config stream, polling the wire for every chunk.
    async fn read_stream(
        &mut self,
        opcode: u8,
        module_id: u8,
        mut chunk_parser: ChunkParser,
    ) -> Result<Vec<Property>> {
        let wire_id = self.open_stream(opcode, module_id).await?;
        loop {
            self.send(CanMessage::remote(wire_id)).await?;
            let message = self
                .receive("stream data", self.reply_timeout, |message| {
                    is_on_wire(message, wire_id) && !message.is_remote()
                })
                .await?;
            if message.data_length() == 0 {
                return Err(AppError::runtime("zero-length data received"));
            }
            if chunk_parser.data(message.payload())? {
                return chunk_parser.commit();
            }
        }
    }

    /// Sends properties chunk by chunk, each after the module asked for more.
    async fn set_config(&mut self, module_id: u8, props: &[Property]) -> Result<()> {
        let wire_id = self.open_stream(a3::A3_MC_MODIFY_CONFIG, module_id).await?;
        let mut encoder = PropertyEncoder::new(props);
        loop {
            let mut out_message = CanMessage::new();
            out_message.set_id(wire_id);
            let num_flushed_bytes = encoder.flush(out_message.mut_data());
            out_message.set_data_length(num_flushed_bytes as u8);
            self.send(out_message).await?;
            if encoder.is_done() {
                log::info!("Wrote {} properties to module {:02x}", props.len(), module_id);
                return Ok(());
            }
            self.receive("continuation", self.reply_timeout, |message| {
                is_on_wire(message, wire_id) && message.is_remote()
            })
            .await?;
        }
    }

    async fn open_stream(&mut self, opcode: u8, module_id: u8) -> Result<u32> {
        let wire_index = self.allocate_wire();
        let wire_id = a3::A3_ID_ADMIN_WIRES_BASE + wire_index as u32;
        self.send(a3_message::request_stream(opcode, module_id, wire_index))
            .await?;
        let reply = self
            .receive("stream status", self.reply_timeout, |message| {
                is_on_wire(message, wire_id) && !message.is_remote()
            })
            .await?;
        match reply.get_data(0).map(StreamStatus::try_from) {
            Some(Ok(StreamStatus::Ready)) => Ok(wire_id),
            Some(Ok(StreamStatus::Busy)) => Err(AppError::new(
                ErrorType::A3StreamConflict,
                "busy".to_string(),
            )),
            other => Err(AppError::new(
                ErrorType::RuntimeError,
                format!("Unexpected stream status: {:?}", other),
            )),
        }
    }

    fn allocate_wire(&mut self) -> u8 {
        let wire = self.next_wire;
        self.next_wire = if self.next_wire >= 0x7f { 1 } else { self.next_wire + 1 };
        wire
    }

    async fn send(&self, message: CanMessage) -> Result<()> {
        log::debug!("Sending message {:?}", message);
        self.can_tx
            .send(message)
            .await
            .map_err(|e| AppError::runtime(&format!("bus closed: {}", e)))
    }

    /// Waits for a frame accepted by `predicate`, dropping everything else.
    async fn receive<P>(&mut self, what: &str, wait: Duration, predicate: P) -> Result<CanMessage>
    where
        P: Fn(&CanMessage) -> bool,
    {
        let deadline = Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match timeout(remaining, self.can_rx.recv()).await {
                Err(_) => return Err(AppError::runtime(&format!("{} timed out", what))),
                Ok(None) => return Err(AppError::runtime("bus closed")),
                Ok(Some(message)) => {
                    if predicate(&message) {
                        return Ok(message);
                    }
                    log::debug!("Ignoring {:?} while waiting for {}", message, what);
                }
            }
        }
    }
}

fn is_on_wire(message: &CanMessage, wire_id: u32) -> bool {
    !message.is_extended() && message.id() == wire_id
}

/// Plays the receive interrupt: every frame put on the bus reaches the module.
pub fn start_rx(rx_interrupt: RxInterrupt) -> (Sender<CanMessage>, JoinHandle<()>) {
    let (tx_sender, mut tx_receiver) = mpsc::channel::<CanMessage>(BUS_CHANNEL_CAPACITY);
    let handle = tokio::spawn(async move {
        while let Some(message) = tx_receiver.recv().await {
            rx_interrupt.on_receive(message);
        }
    });
    (tx_sender, handle)
}

/// Connects a module to the scripted coordinator and drives its main loop
/// until the script ends.
pub async fn simulate<F>(build_module: F, props: Vec<Property>) -> Result<Report>
where
    F: FnOnce(ChannelTransport) -> Result<Module>,
{
    let (module_tx, module_rx) = mpsc::channel(BUS_CHANNEL_CAPACITY);
    let mut module = build_module(ChannelTransport::new(module_tx))?;
    module.initialize()?;

    let (mission_control_tx, rx_handle) = start_rx(module.rx_interrupt());
    let mission_control = MissionControl::new(mission_control_tx, module_rx);
    let script = tokio::spawn(mission_control.run(props));

    module.sign_in();
    while !script.is_finished() {
        if !module.run_once() {
            sleep(Duration::from_millis(1)).await;
        }
    }
    rx_handle.abort();
    script
        .await
        .map_err(|e| AppError::runtime(&format!("mission control task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::ModuleConfig;
    use crate::indicator::LogIndicator;
    use crate::scheduler::SystemClock;
    use crate::storage::MemoryStorage;

    fn build(transport: ChannelTransport) -> Result<Module> {
        let mut config = ModuleConfig::default();
        config.seed = Some(0x5eed);
        Module::new(
            config,
            Box::new(transport),
            Box::new(MemoryStorage::new()),
            Box::new(LogIndicator),
            Arc::new(SystemClock::new()),
        )
    }

    #[tokio::test]
    async fn test_full_session() {
        let props = vec![
            Property::text(2, "bass"),
            Property::u8(5, 1),
            Property::vector_u8(6, &[3, 4]),
            // read-only, must not change
            Property::u16(1, 0x0999),
        ];
        let report = simulate(build, props).await.unwrap();
        assert_eq!(report.module_id, 1);
        assert_eq!(report.name, "cv-depot");
        assert_eq!(report.config.len(), 8);

        let find = |id: u8| {
            let Some(property) = report.config.iter().find(|property| property.id == id) else {
                panic!("property {} missing", id);
            };
            property.clone()
        };
        assert_eq!(find(0).as_u32().unwrap(), report.uid);
        assert_eq!(find(1), Property::u16(1, 1));
        assert_eq!(find(2).as_text(), "bass");
        assert_eq!(find(5), Property::u8(5, 1));
        assert_eq!(find(6), Property::vector_u8(6, &[3, 4]));
        assert_eq!(find(3), Property::u8(3, 2));
    }
}
