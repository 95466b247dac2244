//! Module identity and enrollment.
//!
//! A module starts with a random 29-bit UID, signs in with it, and waits for
//! Mission Control to assign a short address. When another node turns out to
//! use the same UID, both sides drop it and pick a new one.

use rand::rngs::StdRng;
use rand::{Rng, RngCore};

use crate::a3_message;
use crate::analog3::{self as a3, A3_ID_INDIVIDUAL_MODULE_BASE, A3_UID_MASK};
use crate::can_controller::{CanMessage, Transport};
use crate::config::SignInConfig;
use crate::error::Result;
use crate::indicator::{BlinkRequest, Color, Indicator};
use crate::scheduler::Tick;
use crate::storage::{ADDR_MODULE_UID, Storage};

pub struct Identity {
    uid: u32,
    short_addr: Option<u32>,
    rng: StdRng,
    sign_in_attempts: u32,
    /// When the next sign-in retry is due, while unassigned.
    retry_at: Option<Tick>,
}

impl Identity {
    pub fn new(rng: StdRng) -> Self {
        Self {
            uid: 0,
            short_addr: None,
            rng,
            sign_in_attempts: 0,
            retry_at: None,
        }
    }

    /// Loads the stored UID, generating and storing a fresh one when it is
    /// missing or zero.
    pub fn initialize(&mut self, storage: &mut dyn Storage) -> Result<()> {
        let stored = storage
            .load(ADDR_MODULE_UID)
            .and_then(|data| <[u8; 4]>::try_from(data.as_slice()).ok())
            .map(|bytes| u32::from_be_bytes(bytes) & A3_UID_MASK)
            .unwrap_or(0);
        self.short_addr = None;
        if stored != 0 {
            self.uid = stored;
            log::info!("Module uid {:08x} loaded", self.uid);
            return Ok(());
        }
        self.uid = self.generate_uid();
        log::info!("Module uid {:08x} generated", self.uid);
        storage.save(ADDR_MODULE_UID, &self.uid.to_be_bytes())
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    /// Assigned CAN id, base plus offset.
    pub fn short_addr(&self) -> Option<u32> {
        self.short_addr
    }

    pub fn is_assigned(&self) -> bool {
        self.short_addr.is_some()
    }

    /// Requests an address, or announces the current one when assigned.
    pub fn sign_in(&self, transport: &mut dyn Transport) {
        match self.short_addr {
            None => {
                log::debug!("Signing in; uid={:08x}", self.uid);
                transport.send(a3_message::sign_in(self.uid));
            }
            Some(short_addr) => {
                let offset = (short_addr - A3_ID_INDIVIDUAL_MODULE_BASE) as u8;
                log::debug!("Notifying id {:02x}; uid={:08x}", offset, self.uid);
                transport.send(a3_message::notify_id(self.uid, offset));
            }
        }
    }

    /// Handles ASSIGN_MODULE_ID. Returns whether the assignment was for us.
    pub fn on_assign(
        &mut self,
        message: &CanMessage,
        transport: &mut dyn Transport,
        indicator: &mut dyn Indicator,
    ) -> bool {
        let payload = message.payload();
        if payload.len() < 6 {
            log::debug!("Short assignment ignored: {:?}", message);
            return false;
        }
        let target_uid = u32::from_be_bytes([payload[1], payload[2], payload[3], payload[4]]);
        if target_uid != self.uid {
            return false;
        }
        let short_addr = A3_ID_INDIVIDUAL_MODULE_BASE + payload[5] as u32;
        self.short_addr = Some(short_addr);
        self.retry_at = None;
        log::info!(
            "Module id {:02x} assigned; uid={:08x}",
            payload[5],
            self.uid
        );
        transport.send(a3_message::id_assign_ack(short_addr));
        indicator.set_led(Color::Red, false);
        indicator.blink(BlinkRequest::green(70, 7));
        true
    }

    /// Handles PING addressed to this module.
    pub fn on_ping(
        &self,
        message: &CanMessage,
        transport: &mut dyn Transport,
        indicator: &mut dyn Indicator,
    ) {
        let Some(short_addr) = self.short_addr else {
            return;
        };
        transport.send(a3_message::ping_reply(short_addr));
        if message.get_data(2).is_some_and(|visual| visual != 0) {
            indicator.blink(BlinkRequest::green(70, 5));
        }
    }

    /// Handles an extended frame carrying our own UID.
    ///
    /// SIGN_IN and NOTIFY_ID mean another node holds the same UID: ask it to
    /// cancel, then drop ours too. REQ_UID_CANCEL drops ours. Returns whether
    /// the UID was regenerated; the caller signs in again.
    pub fn on_collision(
        &mut self,
        observed_uid: u32,
        opcode: u8,
        transport: &mut dyn Transport,
        storage: &mut dyn Storage,
    ) -> Result<bool> {
        match opcode {
            a3::A3_ADMIN_SIGN_IN | a3::A3_ADMIN_NOTIFY_ID => {
                log::warn!("UID collision detected; uid={:08x}", observed_uid);
                transport.send(a3_message::request_uid_cancel(observed_uid));
                self.cancel_uid(storage)?;
                Ok(true)
            }
            a3::A3_ADMIN_REQ_UID_CANCEL => {
                log::warn!("UID cancel requested; uid={:08x}", observed_uid);
                self.cancel_uid(storage)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Replaces the UID with a new random one and forgets the assignment.
    pub fn cancel_uid(&mut self, storage: &mut dyn Storage) -> Result<()> {
        let old_uid = self.uid;
        self.uid = self.generate_uid();
        self.short_addr = None;
        log::info!("Module uid changed {:08x} -> {:08x}", old_uid, self.uid);
        storage.save(ADDR_MODULE_UID, &self.uid.to_be_bytes())
    }

    /// Nonzero, masked, and different from the current UID.
    fn generate_uid(&mut self) -> u32 {
        loop {
            let uid = self.rng.next_u32() & A3_UID_MASK;
            if uid != 0 && uid != self.uid {
                return uid;
            }
        }
    }

    // Sign-in retry ///////////////////////////////////////////////////////////

    /// Restarts the backoff from the first interval. Returns the tick of the
    /// first retry, or None when retries are disabled.
    pub fn begin_sign_in_retry(&mut self, now: Tick, policy: &SignInConfig) -> Option<Tick> {
        self.sign_in_attempts = 0;
        self.arm_sign_in_retry(now, policy)
    }

    /// Moves the retry deadline to the next backoff step. Returns None once
    /// the attempts are used up.
    pub fn arm_sign_in_retry(&mut self, now: Tick, policy: &SignInConfig) -> Option<Tick> {
        self.retry_at = self
            .next_retry_delay(policy)
            .map(|delay| now.wrapping_add(delay));
        self.retry_at
    }

    /// Tick of the pending retry. None once assigned or out of attempts.
    pub fn sign_in_retry_at(&self) -> Option<Tick> {
        match self.short_addr {
            Some(_) => None,
            None => self.retry_at,
        }
    }

    /// Delay until the next retry, or None once the attempts are used up.
    fn next_retry_delay(&mut self, policy: &SignInConfig) -> Option<Tick> {
        if self.sign_in_attempts >= policy.max_attempts {
            return None;
        }
        let jitter = if policy.jitter_ms > 0 {
            self.rng.gen_range(0..=policy.jitter_ms)
        } else {
            0
        };
        let delay = policy.backoff(self.sign_in_attempts).saturating_add(jitter);
        self.sign_in_attempts += 1;
        Some(delay)
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;

    use super::*;
    use crate::can_controller::RecordingTransport;
    use crate::indicator::{LedEvent, RecordingIndicator};
    use crate::storage::MemoryStorage;

    fn make_identity(seed: u64) -> Identity {
        Identity::new(StdRng::seed_from_u64(seed))
    }

    #[test]
    fn test_initialize_generates_and_persists() {
        let mut storage = MemoryStorage::new();
        storage.save(ADDR_MODULE_UID, &[0, 0, 0, 0]).unwrap();
        let mut identity = make_identity(1);
        identity.initialize(&mut storage).unwrap();
        assert_ne!(identity.uid(), 0);
        assert_eq!(identity.uid() & !A3_UID_MASK, 0);
        assert!(!identity.is_assigned());
        assert_eq!(storage.load(ADDR_MODULE_UID).unwrap(), identity.uid().to_be_bytes().to_vec());
    }

    #[test]
    fn test_initialize_keeps_stored_uid() {
        let mut storage = MemoryStorage::new();
        storage.save(ADDR_MODULE_UID, &[0x1a, 0xce, 0xbe, 0xef]).unwrap();
        let mut identity = make_identity(1);
        identity.initialize(&mut storage).unwrap();
        assert_eq!(identity.uid(), 0x1acebeef);
    }

    #[test]
    fn test_sign_in_and_assignment() {
        let mut storage = MemoryStorage::new();
        let mut transport = RecordingTransport::new();
        let mut indicator = RecordingIndicator::new();
        let mut identity = make_identity(7);
        identity.initialize(&mut storage).unwrap();

        identity.sign_in(&mut transport);
        let sent = transport.take();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].is_extended());
        assert_eq!(sent[0].id(), identity.uid());
        assert_eq!(sent[0].payload(), &[a3::A3_ADMIN_SIGN_IN]);

        // someone else's assignment
        let other = a3_message::assign_module_id(identity.uid() ^ 1, 4);
        assert!(!identity.on_assign(&other, &mut transport, &mut indicator));
        assert!(transport.take().is_empty());

        let assign = a3_message::assign_module_id(identity.uid(), 5);
        assert!(identity.on_assign(&assign, &mut transport, &mut indicator));
        assert_eq!(identity.short_addr(), Some(0x705));
        let sent = transport.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].id(), 0x705);
        assert_eq!(sent[0].payload(), &[a3::A3_IM_ID_ASSIGN_ACK]);
        assert_eq!(
            indicator.take(),
            vec![
                LedEvent::Led(Color::Red, false),
                LedEvent::Blink(BlinkRequest::green(70, 7))
            ]
        );

        identity.sign_in(&mut transport);
        let sent = transport.take();
        assert_eq!(sent[0].payload(), &[a3::A3_ADMIN_NOTIFY_ID, 0x05]);
    }

    #[test]
    fn test_ping() {
        let mut storage = MemoryStorage::new();
        let mut transport = RecordingTransport::new();
        let mut indicator = RecordingIndicator::new();
        let mut identity = make_identity(3);
        identity.initialize(&mut storage).unwrap();
        identity.on_assign(&a3_message::assign_module_id(identity.uid(), 2), &mut transport, &mut indicator);
        transport.take();
        indicator.take();

        identity.on_ping(&a3_message::ping(2, false), &mut transport, &mut indicator);
        let sent = transport.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].id(), 0x702);
        assert_eq!(sent[0].payload(), &[a3::A3_IM_PING_REPLY]);
        assert!(indicator.take().is_empty());

        identity.on_ping(&a3_message::ping(2, true), &mut transport, &mut indicator);
        assert_eq!(indicator.take(), vec![LedEvent::Blink(BlinkRequest::green(70, 5))]);
    }

    #[test]
    fn test_collision_regenerates() {
        let mut storage = MemoryStorage::new();
        let mut transport = RecordingTransport::new();
        let mut indicator = RecordingIndicator::new();
        let mut identity = make_identity(11);
        identity.initialize(&mut storage).unwrap();
        let old_uid = identity.uid();
        identity.on_assign(&a3_message::assign_module_id(old_uid, 1), &mut transport, &mut indicator);
        transport.take();

        assert!(identity
            .on_collision(old_uid, a3::A3_ADMIN_SIGN_IN, &mut transport, &mut storage)
            .unwrap());
        assert_ne!(identity.uid(), old_uid);
        assert!(!identity.is_assigned());
        assert_eq!(storage.load(ADDR_MODULE_UID).unwrap(), identity.uid().to_be_bytes().to_vec());
        let sent = transport.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].id(), old_uid);
        assert_eq!(sent[0].payload(), &[a3::A3_ADMIN_REQ_UID_CANCEL]);

        let uid = identity.uid();
        assert!(identity
            .on_collision(uid, a3::A3_ADMIN_REQ_UID_CANCEL, &mut transport, &mut storage)
            .unwrap());
        assert_ne!(identity.uid(), uid);
        assert!(transport.take().is_empty());

        assert!(!identity
            .on_collision(identity.uid(), 0x7f, &mut transport, &mut storage)
            .unwrap());
    }

    #[test]
    fn test_retry_rounds() {
        let policy = SignInConfig {
            initial_interval_ms: 100,
            max_interval_ms: 400,
            max_attempts: 4,
            jitter_ms: 0,
        };
        let mut identity = make_identity(5);
        assert_eq!(identity.begin_sign_in_retry(1000, &policy), Some(1100));
        assert_eq!(identity.sign_in_retry_at(), Some(1100));
        let deadlines: Vec<Option<Tick>> = (0..4)
            .map(|_| identity.arm_sign_in_retry(2000, &policy))
            .collect();
        assert_eq!(deadlines, vec![Some(2200), Some(2400), Some(2400), None]);
        assert_eq!(identity.sign_in_retry_at(), None);

        // a new round starts over
        assert_eq!(identity.begin_sign_in_retry(3000, &policy), Some(3100));

        // an assignment ends the retries
        let mut transport = RecordingTransport::new();
        let mut indicator = RecordingIndicator::new();
        let assign = a3_message::assign_module_id(identity.uid(), 1);
        assert!(identity.on_assign(&assign, &mut transport, &mut indicator));
        assert_eq!(identity.sign_in_retry_at(), None);
    }

    #[test]
    fn test_retry_jitter_is_bounded() {
        let policy = SignInConfig {
            initial_interval_ms: 100,
            max_interval_ms: 100,
            max_attempts: 50,
            jitter_ms: 20,
        };
        let mut identity = make_identity(9);
        identity.begin_sign_in_retry(0, &policy);
        for _ in 0..49 {
            let Some(deadline) = identity.arm_sign_in_retry(1000, &policy) else {
                panic!("attempts must not run out");
            };
            assert!((1100..=1120).contains(&deadline));
        }
    }
}
