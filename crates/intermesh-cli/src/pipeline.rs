//! [`Pipeline`] – the three routing stages wired over one bus.
//!
//! Start order matters: the gateway and the semantic stage listen first so
//! the platform stage's recovery traffic has somewhere to go; the platform
//! stage then restores before it accepts client requests; the gateway
//! re-issues its stored subscriptions last.

use std::sync::Arc;

use intermesh_bridge::BridgeManager;
use intermesh_gateway::ClientGateway;
use intermesh_platform::PlatformRoutingStage;
use intermesh_semantic::SemanticRoutingStage;
use intermesh_types::RouteError;
use tracing::info;

use crate::context::MiddlewareContext;

pub struct Pipeline {
    gateway: Arc<ClientGateway>,
    semantic: Arc<SemanticRoutingStage>,
    platform: Arc<PlatformRoutingStage>,
    bridges: Arc<BridgeManager>,
}

impl Pipeline {
    /// Build, recover and start every stage.
    ///
    /// # Errors
    ///
    /// Registry failures during recovery. Stages already started are
    /// stopped again.
    pub async fn start(ctx: &MiddlewareContext) -> Result<Self, RouteError> {
        let gateway = Arc::new(ClientGateway::new(
            Arc::clone(&ctx.bus),
            Arc::clone(&ctx.registry),
            ctx.gateway.clone(),
        ));
        let semantic = Arc::new(SemanticRoutingStage::new(
            Arc::clone(&ctx.bus),
            Arc::clone(&ctx.translation),
        ));
        let platform = Arc::new(PlatformRoutingStage::new(
            Arc::clone(&ctx.bus),
            Arc::clone(&ctx.registry),
            Arc::clone(&ctx.bridges),
        ));
        let pipeline = Self {
            gateway,
            semantic,
            platform,
            bridges: Arc::clone(&ctx.bridges),
        };

        pipeline.gateway.start();
        pipeline.semantic.start();
        let recovered = match pipeline.platform.start().await {
            Ok(()) => pipeline.gateway.restore_state().await,
            Err(e) => Err(e),
        };
        if let Err(e) = recovered {
            pipeline.shutdown().await;
            return Err(e);
        }
        info!("routing pipeline started");
        Ok(pipeline)
    }

    /// Stop listeners, push workers and bridges.
    pub async fn shutdown(&self) {
        self.gateway.stop();
        self.platform.stop();
        self.semantic.stop();
        self.bridges.stop_all().await;
        info!("routing pipeline stopped");
    }
}
