//! Shared Context
//!
//! Explicitly constructed bundle of the state every component needs. The
//! owner builds one and hands `Arc<SyncContext>` to the listener, the
//! dispatcher, the tick scheduler and the client agent.

use std::sync::Arc;

use crate::config::{ConfigError, SyncConfig};
use crate::network::codec::MessageCodec;
use crate::network::session::SessionRegistry;
use crate::network::validation::MovementRules;

/// Configuration, codec and session registry shared by the sync core.
pub struct SyncContext {
    /// Validated configuration.
    pub config: SyncConfig,
    /// Frame codec built from `config`.
    pub codec: MessageCodec,
    /// Authoritative session map.
    pub registry: SessionRegistry,
}

impl SyncContext {
    /// Validate `config` and build the shared context.
    pub fn new(config: SyncConfig) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        let codec = MessageCodec::from_config(&config)?;
        Ok(Arc::new(Self {
            config,
            codec,
            registry: SessionRegistry::new(),
        }))
    }

    /// Movement limits from the configuration.
    pub fn movement_rules(&self) -> MovementRules {
        MovementRules::from_config(&self.config)
    }
}
