//! External collaborator seam for exchange/market-data connectivity. Full
//! exchange adapters are out of scope; this trait is the boundary the
//! Session Manager calls through, plus a paper implementation that always
//! succeeds, used in tests and dry-run wiring.

use async_trait::async_trait;

use crate::error::EngineResult;

#[async_trait]
pub trait MarketAdapter: Send + Sync {
    async fn subscribe_symbol(&self, symbol: &str) -> EngineResult<()>;
    async fn unsubscribe_symbol(&self, symbol: &str) -> EngineResult<()>;
}

/// Always-succeeds adapter. Stands in for a real exchange connection in
/// tests and when the engine runs without a live market-data feed.
#[derive(Debug, Default)]
pub struct PaperMarketAdapter;

#[async_trait]
impl MarketAdapter for PaperMarketAdapter {
    async fn subscribe_symbol(&self, _symbol: &str) -> EngineResult<()> {
        Ok(())
    }

    async fn unsubscribe_symbol(&self, _symbol: &str) -> EngineResult<()> {
        Ok(())
    }
}
