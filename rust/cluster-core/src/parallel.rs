// rust/cluster-core/src/parallel.rs

//! Choosing how many workers take part in the next round.

use tracing::info;

use crate::config::Role;
use crate::engine::Coordinator;
use crate::protocol::Message;
use crate::registry::Scope;

impl Coordinator {
    /// Activate the `nodes` highest-ranked valid workers (at least one) and
    /// deactivate the rest. Returns the number of active workers once their
    /// status has been refreshed.
    pub async fn go_parallel(&mut self, nodes: usize) -> usize {
        let nodes = nodes.max(1);
        let valid = self.registry.ids(Scope::All);
        for (rank, &id) in valid.iter().enumerate() {
            self.registry.set_active(id, rank < nodes);
        }
        self.registry.owe_group_view();

        // Refreshes each worker's working directory
        self.ask_status().await;
        self.registry.recompute_unique();
        self.send_group_view().await;

        let active = self.active_count();
        if active > 1 {
            info!("Parallel mode with {} workers", active);
        } else {
            info!("Sequential mode");
        }
        active
    }

    /// Change the degree of parallelism and return the new one.
    ///
    /// A master selects its own workers and resets them into the session's
    /// working directory. A client forwards the request to its remote master
    /// and reports the parallelism that master settled on.
    pub async fn set_parallel(&mut self, nodes: usize) -> usize {
        match self.config.session.role {
            Role::Delegating => {
                let active = self.go_parallel(nodes).await;
                self.send_current_state(Scope::Active).await;
                active
            }
            Role::Direct => {
                let setup = Message::ParallelSetup {
                    count: u32::try_from(nodes).unwrap_or(u32::MAX),
                    port: self.config.session.bulk_port,
                };
                let ids = self.registry.ids(Scope::Active);
                self.broadcast(&setup, &ids).await;
                self.collect_workers(&ids).await;
                self.parallel() as usize
            }
        }
    }
}
