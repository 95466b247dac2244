use std::sync::Arc;

use env_logger::Env;

use a3_module::analog3::config::Property;
use a3_module::can_controller::ChannelTransport;
use a3_module::config::ModuleConfig;
use a3_module::error::Result;
use a3_module::indicator::LogIndicator;
use a3_module::mission_control;
use a3_module::module::Module;
use a3_module::scheduler::SystemClock;
use a3_module::storage::{FileStorage, MemoryStorage, Storage};

fn load_config() -> Result<ModuleConfig> {
    match std::env::args().nth(1) {
        Some(path) => {
            log::info!("Loading module config from {}", path);
            ModuleConfig::load(path)
        }
        None => Ok(ModuleConfig::default()),
    }
}

fn open_storage(config: &ModuleConfig) -> Result<Box<dyn Storage>> {
    Ok(match &config.storage_path {
        Some(path) => Box::new(FileStorage::open(path)?),
        None => Box::new(MemoryStorage::new()),
    })
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            log::error!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    let build_module = |transport: ChannelTransport| -> Result<Module> {
        let storage = open_storage(&config)?;
        Module::new(
            config.clone(),
            Box::new(transport),
            storage,
            Box::new(LogIndicator),
            Arc::new(SystemClock::new()),
        )
    };

    let props = vec![
        Property::text(2, "cv-depot #1"),
        Property::u8(4, 1),
        Property::vector_u8(6, &[0, 0]),
    ];
    match mission_control::simulate(build_module, props).await {
        Ok(report) => {
            log::info!(
                "Session complete; uid={:08x}, id={:02x}, name={:?}",
                report.uid,
                report.module_id,
                report.name
            );
            let table = config.property_table();
            for property in &report.config {
                match table.iter().find(|def| def.id == property.id) {
                    Some(def) => log::info!("  ({}) {}: {}", def.id, def.name, def.describe(&property.data)),
                    None => log::info!("  ({}) unknown: {}", property.id, hex::encode(&property.data)),
                }
            }
        }
        Err(e) => {
            log::error!("Session failed: {}", e);
            std::process::exit(1);
        }
    }
}
