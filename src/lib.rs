pub mod a3_message;
pub mod analog3;
pub mod can_controller;
pub mod config;
pub mod error;
pub mod frame_queue;
pub mod identity;
pub mod indicator;
pub mod mission_control;
pub mod module;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod storage;
pub mod stream;
