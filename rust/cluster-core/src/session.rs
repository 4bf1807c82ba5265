// rust/cluster-core/src/session.rs

//! Session start-up: connect the roster and bring the cluster into
//! parallel mode.

use tracing::{info, warn};

use crate::config::ClusterConfig;
use crate::connection::Connector;
use crate::engine::Coordinator;
use crate::error::{ClusterError, Result};
use crate::registry::{WorkerId, WorkerInfo};

impl Coordinator {
    /// Connect every roster entry of `config` through `connector` and
    /// activate all reachable workers.
    ///
    /// Unreachable entries are kept in the table as bad workers.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or no worker could
    /// be reached.
    pub async fn start(config: ClusterConfig, connector: &dyn Connector) -> Result<Self> {
        config.validate()?;
        let roster = config.workers.clone();
        let mut coord = Coordinator::new(config);

        for (ordinal, entry) in roster.iter().enumerate() {
            let info = WorkerInfo::new(ordinal as WorkerId, entry);
            match connector.connect(entry).await {
                Ok(conn) => {
                    info!("Connected to worker {} on {}:{}", ordinal, entry.host, entry.port);
                    coord.add_worker(info, conn);
                }
                Err(e) => {
                    warn!("Worker {} on {} unreachable: {}", ordinal, entry.host, e);
                    coord.registry.add_bad(info, e.to_string());
                }
            }
        }

        if coord.registry.valid_count() == 0 {
            return Err(ClusterError::NoWorkers);
        }

        let (level, mask) = (coord.config.session.log_level, coord.config.session.log_mask);
        coord.set_log_level(level, mask).await;
        let all = coord.registry.valid_count();
        coord.go_parallel(all).await;

        info!(
            "Session started: {} of {} workers active",
            coord.active_count(),
            coord.registry.total()
        );
        Ok(coord)
    }
}
