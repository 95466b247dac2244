//! The module context and protocol dispatcher.
//!
//! [`Module`] owns every piece of protocol state and is the context all
//! scheduled tasks run against. Frames enter through [`RxInterrupt`], which
//! only queues them; the dispatcher runs later as a task on the main loop.

use std::sync::Arc;

use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::analog3::{self as a3, PropertyId};
use crate::can_controller::{CanMessage, Transport};
use crate::config::ModuleConfig;
use crate::error::Result;
use crate::frame_queue::FrameQueue;
use crate::identity::Identity;
use crate::indicator::{Color, Indicator};
use crate::registry::Registry;
use crate::scheduler::{Clock, TaskScheduler, is_due};
use crate::storage::Storage;
use crate::stream::{Direction, StreamSession};

pub struct Module {
    config: ModuleConfig,
    identity: Identity,
    registry: Registry,
    session: StreamSession,
    transport: Box<dyn Transport>,
    storage: Box<dyn Storage>,
    indicator: Box<dyn Indicator>,
    clock: Arc<dyn Clock>,
    scheduler: Arc<TaskScheduler<Module>>,
    frames: Arc<FrameQueue>,
    /// A sign-in retry task sits in the deferred queue.
    retry_pending: bool,
}

impl Module {
    pub fn new(
        config: ModuleConfig,
        transport: Box<dyn Transport>,
        storage: Box<dyn Storage>,
        indicator: Box<dyn Indicator>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let registry = Registry::new(config.property_table())?;
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let scheduler = Arc::new(TaskScheduler::new(
            config.task_queue_capacity,
            config.deferred_capacity,
        ));
        let frames = Arc::new(FrameQueue::new(config.frame_queue_capacity));
        Ok(Self {
            config,
            identity: Identity::new(rng),
            registry,
            session: StreamSession::new(),
            transport,
            storage,
            indicator,
            clock,
            scheduler,
            frames,
            retry_pending: false,
        })
    }

    /// Handle for the receive path.
    pub fn rx_interrupt(&self) -> RxInterrupt {
        RxInterrupt {
            frames: self.frames.clone(),
            scheduler: self.scheduler.clone(),
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn session(&self) -> &StreamSession {
        &self.session
    }

    pub fn storage(&self) -> &dyn Storage {
        self.storage.as_ref()
    }

    /// Loads identity and stored properties. The red LED stays on until an
    /// address is assigned.
    pub fn initialize(&mut self) -> Result<()> {
        self.indicator.set_led(Color::Red, true);
        self.identity.initialize(self.storage.as_mut())?;
        self.registry.load_persisted(self.storage.as_ref());
        self.sync_uid();
        let name_id = u8::from(PropertyId::Name);
        if self.registry.get(name_id)?.1.is_empty() {
            let default_name = self.config.default_name.clone();
            self.registry
                .set(name_id, default_name.as_bytes(), self.storage.as_mut());
        }
        log::info!(
            "Module initialized; type={} ({}), uid={:08x}",
            self.config.module_type,
            self.config.module_type_name,
            self.identity.uid()
        );
        Ok(())
    }

    /// Announces the module and, while unassigned, keeps retrying with backoff.
    pub fn sign_in(&mut self) {
        self.identity.sign_in(self.transport.as_mut());
        if self.identity.is_assigned() {
            return;
        }
        let now = self.clock.now();
        if self
            .identity
            .begin_sign_in_retry(now, &self.config.sign_in)
            .is_none()
        {
            return;
        }
        self.arm_sign_in_retry();
    }

    /// Expires an idle stream session, then runs one scheduled task. Returns
    /// false when nothing was ready.
    pub fn run_once(&mut self) -> bool {
        let now = self.clock.now();
        self.session
            .check_idle(now, self.config.session_idle_timeout_ms);
        let scheduler = self.scheduler.clone();
        scheduler.run_one(self, now)
    }

    /// Runs tasks until none is ready.
    pub fn run_until_idle(&mut self) {
        while self.run_once() {}
    }

    pub fn has_pending_work(&self) -> bool {
        !self.scheduler.is_idle() || self.session.is_active()
    }

    // incoming message handling /////////////////////////////////////////////////

    fn handle_next_frame(&mut self) {
        if let Some(message) = self.frames.dequeue() {
            self.dispatch(message);
        }
    }

    fn dispatch(&mut self, message: CanMessage) {
        log::debug!("Message received: {:?}", message);
        if message.is_extended() {
            self.handle_extended_message(message);
        } else {
            self.handle_standard_message(message);
        }
    }

    fn handle_standard_message(&mut self, message: CanMessage) {
        if message.id() == a3::A3_ID_MISSION_CONTROL {
            self.handle_mission_control_message(message);
        } else if self.session.peer_channel() == Some(message.id()) {
            let now = self.clock.now();
            self.session.on_wire_frame(
                &message,
                &mut self.registry,
                self.storage.as_mut(),
                self.transport.as_mut(),
                now,
            );
        }
        // else not for us
    }

    fn handle_mission_control_message(&mut self, message: CanMessage) {
        let Some(opcode) = message.get_data(0) else {
            log::debug!("no opcode");
            return;
        };
        match opcode {
            a3::A3_MC_SIGN_IN => self.sign_in(),
            a3::A3_MC_ASSIGN_MODULE_ID => {
                self.identity.on_assign(
                    &message,
                    self.transport.as_mut(),
                    self.indicator.as_mut(),
                );
            }
            _ => {
                let Some(offset) = message.get_data(1) else {
                    return;
                };
                let target = a3::A3_ID_INDIVIDUAL_MODULE_BASE + offset as u32;
                if self.identity.short_addr() != Some(target) {
                    return;
                }
                match opcode {
                    a3::A3_MC_PING => self.identity.on_ping(
                        &message,
                        self.transport.as_mut(),
                        self.indicator.as_mut(),
                    ),
                    a3::A3_MC_REQUEST_NAME => self.request_stream(Direction::ReadName, &message),
                    a3::A3_MC_REQUEST_CONFIG => {
                        self.request_stream(Direction::ReadConfig, &message)
                    }
                    a3::A3_MC_MODIFY_CONFIG => {
                        self.request_stream(Direction::WriteConfig, &message)
                    }
                    _ => log::debug!("Unknown opcode ignored; opcode={:02x}", opcode),
                }
            }
        }
    }

    fn handle_extended_message(&mut self, message: CanMessage) {
        if message.id() != self.identity.uid() {
            // it's not about me
            return;
        }
        let Some(opcode) = message.get_data(0) else {
            return;
        };
        let regenerated = match self.identity.on_collision(
            message.id(),
            opcode,
            self.transport.as_mut(),
            self.storage.as_mut(),
        ) {
            Ok(regenerated) => regenerated,
            Err(e) => {
                log::warn!("Failed to store the new uid: {}", e);
                true
            }
        };
        if regenerated {
            self.indicator.set_led(Color::Red, true);
            self.sync_uid();
            self.sign_in();
        }
    }

    fn sync_uid(&mut self) {
        let uid = self.identity.uid().to_be_bytes().to_vec();
        if let Err(e) = self.registry.refresh(PropertyId::ModuleUid.into(), uid) {
            log::warn!("Module uid property unavailable: {}", e);
        }
    }

    // streams ///////////////////////////////////////////////////////////////////

    fn request_stream(&mut self, direction: Direction, message: &CanMessage) {
        let Some(wire_index) = message.get_data(2) else {
            log::debug!("Stream request without a wire ignored: {:?}", message);
            return;
        };
        let now = self.clock.now();
        self.session
            .request(direction, wire_index, &self.registry, self.transport.as_mut(), now);
    }

    // sign-in retry /////////////////////////////////////////////////////////////

    /// Makes sure one task waits for the retry deadline. A new round only moves
    /// the deadline; the pending task picks it up.
    fn arm_sign_in_retry(&mut self) {
        if self.retry_pending {
            return;
        }
        let Some(deadline) = self.identity.sign_in_retry_at() else {
            return;
        };
        let result = self
            .scheduler
            .schedule_at(deadline, |module: &mut Module| module.retry_sign_in());
        match result {
            Ok(()) => self.retry_pending = true,
            Err(e) => log::warn!("Sign-in retry not scheduled: {}", e),
        }
    }

    fn retry_sign_in(&mut self) {
        self.retry_pending = false;
        let Some(deadline) = self.identity.sign_in_retry_at() else {
            return;
        };
        let now = self.clock.now();
        if is_due(deadline, now) {
            log::info!("Retrying sign-in; uid={:08x}", self.identity.uid());
            self.identity.sign_in(self.transport.as_mut());
            if self
                .identity
                .arm_sign_in_retry(now, &self.config.sign_in)
                .is_none()
            {
                log::warn!(
                    "No address assigned after {} sign-in attempts; uid={:08x}",
                    self.config.sign_in.max_attempts,
                    self.identity.uid()
                );
                return;
            }
        }
        self.arm_sign_in_retry();
    }
}

/// The receive interrupt's view of a module: it queues the frame and
/// schedules its handling, nothing else.
#[derive(Clone)]
pub struct RxInterrupt {
    frames: Arc<FrameQueue>,
    scheduler: Arc<TaskScheduler<Module>>,
}

impl RxInterrupt {
    pub fn on_receive(&self, message: CanMessage) {
        if let Err(e) = self.frames.enqueue(message) {
            log::warn!("Frame dropped: {}", e);
            return;
        }
        if let Err(e) = self.scheduler.schedule(Module::handle_next_frame) {
            self.frames.withdraw_newest();
            log::warn!("Frame dropped: {}", e);
        }
    }
}
