//! Media capability negotiation

use crate::engine::{MediaEngine, RouterCapabilities, RtpCapabilities};
use crate::error::{Result, SfuError};
use crate::types::ProducerId;
use std::sync::Arc;
use tracing::debug;

pub struct CapabilityNegotiator {
    engine: Arc<dyn MediaEngine>,
    /// Captured once; the codec set does not change at runtime
    capabilities: RouterCapabilities,
}

impl CapabilityNegotiator {
    #[must_use]
    pub fn new(engine: Arc<dyn MediaEngine>) -> Self {
        let capabilities = engine.capabilities();
        Self {
            engine,
            capabilities,
        }
    }

    #[must_use]
    pub const fn server_capabilities(&self) -> &RouterCapabilities {
        &self.capabilities
    }

    #[must_use]
    pub fn can_consume(&self, producer_id: &ProducerId, capabilities: &RtpCapabilities) -> bool {
        self.engine.can_consume(producer_id, capabilities)
    }

    /// Gate for consumer creation
    pub fn ensure_can_consume(
        &self,
        producer_id: &ProducerId,
        capabilities: &RtpCapabilities,
    ) -> Result<()> {
        if self.can_consume(producer_id, capabilities) {
            Ok(())
        } else {
            debug!(producer_id = %producer_id, "Consumer capabilities rejected");
            Err(SfuError::CapabilityMismatch(format!(
                "cannot consume producer {producer_id} with the declared capabilities"
            )))
        }
    }
}
