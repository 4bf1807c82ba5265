// rust/cluster-core/src/interrupt.rs

//! Urgent signals on the out-of-band channel.
//!
//! A hard interrupt must get through to a worker whose in-band stream is
//! stuck behind a long computation, so the byte goes out-of-band. Once the
//! worker acknowledges, everything it wrote before the acknowledgement is
//! discarded up to the mark and the stream is back in sync.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use crate::connection::{recv_raw_exact, Connection, RawFlag, RawRead};
use crate::engine::Coordinator;
use crate::error::{ClusterError, Result};
use crate::protocol::InterruptKind;
use crate::registry::{Scope, WorkerId};

const DRAIN_BUF_SIZE: usize = 1024;

/// Result of one [`Coordinator::interrupt`] call.
#[derive(Debug, Default)]
pub struct InterruptReport {
    /// Workers the signal was delivered to.
    pub delivered: Vec<WorkerId>,
    /// Hard interrupts only: workers back in sync, with the number of
    /// in-band bytes discarded.
    pub synchronized: Vec<(WorkerId, usize)>,
    pub failures: Vec<(WorkerId, ClusterError)>,
}

impl InterruptReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Poll budget shared by both phases of one hard-interrupt drain.
struct DrainBudget {
    id: WorkerId,
    iterations: u32,
    max_iterations: u32,
    deadline: Instant,
}

impl DrainBudget {
    /// Sleep for `pause`, failing once the budget is spent.
    async fn wait(&mut self, pause: Duration, what: &str) -> Result<()> {
        self.iterations += 1;
        let now = Instant::now();
        if self.iterations > self.max_iterations || now >= self.deadline {
            return Err(ClusterError::timeout(self.id, what.to_string()));
        }
        tokio::time::sleep(pause.min(self.deadline - now)).await;
        Ok(())
    }
}

impl Coordinator {
    /// Send `kind` out-of-band to every valid worker of `scope`.
    ///
    /// Failures are recorded per worker; the rest of the list is still
    /// interrupted. A worker whose connection fails is marked bad.
    pub async fn interrupt(&mut self, kind: InterruptKind, scope: Scope) -> InterruptReport {
        let mut report = InterruptReport::default();
        let byte = [kind.as_byte()];

        for id in self.registry.ids(scope) {
            let sent = match self.connection(id) {
                Ok(conn) => conn.send_raw(&byte, RawFlag::OutOfBand).await,
                Err(e) => Err(e),
            };
            match sent {
                Ok(n) if n > 0 => report.delivered.push(id),
                Ok(_) => {
                    report
                        .failures
                        .push((id, ClusterError::connection("out-of-band byte not sent")));
                    continue;
                }
                Err(e) => {
                    warn!("Cannot interrupt worker {}: {}", id, e);
                    if e.is_connection_failure() {
                        self.mark_bad(id, &e);
                    }
                    report.failures.push((id, e));
                    continue;
                }
            }

            match kind {
                InterruptKind::Hard => match self.synchronize(id).await {
                    Ok(discarded) => {
                        if discarded > 0 {
                            info!("Worker {} synchronized: {} bytes discarded", id, discarded);
                        }
                        report.synchronized.push((id, discarded));
                        // Absorb the log output that follows the interrupt
                        self.collect_worker(id).await;
                    }
                    Err(e) => {
                        warn!("Worker {} did not synchronize: {}", id, e);
                        if e.is_connection_failure() {
                            self.mark_bad(id, &e);
                        }
                        report.failures.push((id, e));
                    }
                },
                InterruptKind::Soft => {
                    self.collect_worker(id).await;
                }
                InterruptKind::Shutdown => {}
            }
        }
        report
    }

    /// Wait for the worker's acknowledgement byte, then flush the in-band
    /// stream up to the mark. Returns the number of bytes discarded.
    async fn synchronize(&mut self, id: WorkerId) -> Result<usize> {
        let settings = self.config.interrupt.clone();
        let mut budget = DrainBudget {
            id,
            iterations: 0,
            max_iterations: settings.max_wait_iterations,
            deadline: Instant::now() + settings.drain_timeout(),
        };
        let conn = self.connection(id)?;
        let mut waste = [0u8; DRAIN_BUF_SIZE];
        let mut discarded = 0;

        let mut ack = [0u8; 1];
        loop {
            match conn.recv_raw(&mut ack, RawFlag::OutOfBand).await? {
                RawRead::Bytes(n) if n > 0 => break,
                // In-band data queued in front of the urgent byte
                RawRead::WouldBlock => match discard_pending(conn, &mut waste).await? {
                    0 => budget.wait(settings.idle_wait(), "in-band stream stalled").await?,
                    n => discarded += n,
                },
                RawRead::Bytes(_) | RawRead::NotArrived => {
                    budget
                        .wait(settings.poll_interval(), "no out-of-band acknowledgement")
                        .await?
                }
            }
        }

        while !conn.at_mark().await? {
            match discard_pending(conn, &mut waste).await? {
                0 => budget.wait(settings.idle_wait(), "out-of-band mark not reached").await?,
                n => discarded += n,
            }
        }
        Ok(discarded)
    }
}

/// Read and drop the in-band bytes that are available before the mark.
async fn discard_pending(conn: &mut dyn Connection, waste: &mut [u8]) -> Result<usize> {
    let available = match conn.recv_raw(waste, RawFlag::Peek).await? {
        RawRead::Bytes(n) => n,
        RawRead::WouldBlock | RawRead::NotArrived => 0,
    };
    if available > 0 {
        recv_raw_exact(conn, &mut waste[..available]).await?;
    }
    Ok(available)
}
