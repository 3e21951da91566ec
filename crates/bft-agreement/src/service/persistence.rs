//! Shutdown and restart.
//!
//! A replica stopped with [`Replica::shutdown`] can be rebuilt from the
//! returned bytes with [`Replica::restart`]. Application state is not part
//! of the snapshot; the state adapter keeps its own checkpoints.

use super::{Replica, ReplicaDependencies};
use crate::domain::{Checkpoint, Commit, PersistedOldRequest, PrePrepare, Prepare, ReplyCache};
use crate::error::{AgreementError, AgreementResult};
use crate::ports::{Application, CryptoService, StateSync, Transport};
use bft_telemetry::log_replica_event;
use serde::{Deserialize, Serialize};
use shared_types::{ReplicaId, Seqno, View};
use std::sync::Arc;

/// Pre-prepare and prepares logged for one sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedPrepared {
    pub seqno: Seqno,
    pub pre_prepare: Option<PrePrepare>,
    /// The local replica proposed the pre-prepare.
    pub proposed: bool,
    pub prepares: Vec<Prepare>,
}

/// Protocol state written at shutdown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedReplica {
    pub max_out: u64,
    pub view: View,
    pub limbo: bool,
    pub has_nv_state: bool,
    pub seqno: Seqno,
    pub last_stable: Seqno,
    pub low_bound: Seqno,
    pub last_prepared: Seqno,
    pub last_executed: Seqno,
    pub last_tentative_execute: Seqno,
    pub prepared: Vec<PersistedPrepared>,
    pub commits: Vec<(Seqno, Vec<Commit>)>,
    /// Checkpoint votes, including those at `last_stable`.
    pub checkpoints: Vec<(Seqno, Vec<Checkpoint>)>,
    pub replies: Vec<u8>,
    pub old_requests: Vec<PersistedOldRequest>,
}

impl PersistedReplica {
    pub fn encode(&self) -> AgreementResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| AgreementError::PersistenceDecode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> AgreementResult<Self> {
        bincode::deserialize(bytes).map_err(|e| AgreementError::PersistenceDecode(e.to_string()))
    }

    /// Check the marker ordering a correct replica maintains.
    fn validate(&self, id: ReplicaId, replica_count: usize, max_out: u64) -> AgreementResult<()> {
        if self.max_out != max_out {
            return Err(AgreementError::WindowMismatch {
                last_stable: self.last_stable,
                max_out,
            });
        }
        let invalid = |reason: &str| AgreementError::PersistenceInvalid {
            view: self.view,
            reason: reason.to_string(),
        };
        if self.view as usize % replica_count == id {
            return Err(invalid("replica was primary of the persisted view"));
        }
        if self.low_bound < self.last_stable {
            return Err(invalid("low bound below last stable checkpoint"));
        }
        if self.last_tentative_execute < self.last_executed {
            return Err(invalid("tentative execution behind last executed"));
        }
        if self.last_prepared < self.last_tentative_execute {
            return Err(invalid("last prepared behind tentative execution"));
        }
        let Some(high) = self.last_stable.checked_add(max_out) else {
            return Err(invalid("last stable checkpoint at the end of the seqno range"));
        };
        let window = self.last_stable..=high;
        let outside = self
            .prepared
            .iter()
            .map(|p| p.seqno)
            .chain(self.commits.iter().map(|(n, _)| *n))
            .chain(self.checkpoints.iter().map(|(n, _)| *n))
            .any(|n| !window.contains(&n));
        if outside {
            return Err(invalid("log entry outside the window"));
        }
        Ok(())
    }
}

impl<T, C, S, A> Replica<T, C, S, A>
where
    T: Transport,
    C: CryptoService,
    S: StateSync,
    A: Application,
{
    /// Stop the replica and return its protocol state.
    ///
    /// Tentative execution is rolled back first. A primary sends a
    /// view-change before stopping so the others need not wait for their
    /// timers.
    pub fn shutdown(&mut self) -> AgreementResult<Vec<u8>> {
        self.ensure_running()?;
        self.vtimer.stop();
        if !self.state.in_fetch() && self.last_tentative_execute > self.last_executed {
            self.rollback();
        }
        if self.is_primary() {
            self.send_view_change();
        }

        let persisted = self.export_state()?;
        let bytes = persisted.encode()?;
        self.stopped = true;
        log_replica_event!(
            info,
            self.id,
            self.view,
            "[bft] replica stopped",
            last_stable = self.last_stable,
            last_executed = self.last_executed,
            bytes = bytes.len()
        );
        Ok(bytes)
    }

    fn export_state(&self) -> AgreementResult<PersistedReplica> {
        let prepared = self
            .plog
            .iter()
            .map(|(seqno, pc)| PersistedPrepared {
                seqno,
                pre_prepare: pc.pre_prepare().map(|pp| (**pp).clone()),
                proposed: pc.is_primary(),
                prepares: pc.prepares().votes().cloned().collect(),
            })
            .filter(|p| p.pre_prepare.is_some() || !p.prepares.is_empty())
            .collect();
        let commits = self
            .clog
            .iter()
            .filter(|(_, cc)| !cc.is_empty())
            .map(|(seqno, cc)| (seqno, cc.votes().cloned().collect()))
            .collect();
        let mut checkpoints = vec![(
            self.last_stable,
            self.stable_cert.votes().cloned().collect::<Vec<_>>(),
        )];
        checkpoints.extend(
            self.elog
                .iter()
                .filter(|(_, cert)| !cert.is_empty())
                .map(|(seqno, cert)| (seqno, cert.votes().cloned().collect())),
        );

        Ok(PersistedReplica {
            max_out: self.config.max_out,
            view: self.view,
            limbo: self.limbo,
            has_nv_state: self.has_nv_state,
            seqno: self.seqno,
            last_stable: self.last_stable,
            low_bound: self.low_bound,
            last_prepared: self.last_prepared,
            last_executed: self.last_executed,
            last_tentative_execute: self.last_tentative_execute,
            prepared,
            commits,
            checkpoints,
            replies: self.replies.encode()?,
            old_requests: self.vi.export(),
        })
    }

    /// Rebuild replica `id` from bytes produced by [`shutdown`](Self::shutdown).
    pub fn restart(
        id: ReplicaId,
        deps: ReplicaDependencies<T, C, S, A>,
        bytes: &[u8],
    ) -> AgreementResult<Self> {
        let persisted = PersistedReplica::decode(bytes)?;
        persisted.validate(id, deps.config.replica_count, deps.config.max_out)?;

        let mut replica = Self::new(id, deps)?;
        replica.import_state(persisted)?;
        log_replica_event!(
            info,
            replica.id,
            replica.view,
            "[bft] replica restarted",
            last_stable = replica.last_stable,
            last_executed = replica.last_executed
        );
        Ok(replica)
    }

    fn import_state(&mut self, persisted: PersistedReplica) -> AgreementResult<()> {
        let now = self.now();
        let ls = persisted.last_stable;

        self.view = persisted.view;
        self.limbo = persisted.limbo;
        self.has_nv_state = persisted.has_nv_state;
        self.seqno = persisted.seqno;
        self.last_stable = ls;
        self.low_bound = persisted.low_bound;
        self.last_prepared = persisted.last_prepared;
        self.last_executed = persisted.last_executed;
        self.last_tentative_execute = persisted.last_tentative_execute;
        self.replies = ReplyCache::decode(&persisted.replies)?;

        self.plog.reset(ls);
        self.clog.reset(ls);
        self.elog.reset(ls);
        self.stable_cert.clear();

        for entry in persisted.prepared {
            if entry.seqno == ls {
                continue;
            }
            let pc = self.plog.fetch(entry.seqno);
            if let Some(pp) = entry.pre_prepare {
                let pp = Arc::new(pp);
                if entry.proposed {
                    pc.add_my_pre_prepare(pp, now);
                } else {
                    pc.add_old(pp, &mut self.brt);
                }
            }
            for prepare in entry.prepares {
                if prepare.sender == self.id {
                    pc.add_my_prepare(prepare, now);
                } else {
                    pc.add_prepare(prepare);
                }
            }
        }

        for (seqno, commits) in persisted.commits {
            if seqno == ls {
                continue;
            }
            let cc = self.clog.fetch(seqno);
            for commit in commits {
                if commit.sender == self.id {
                    cc.add_mine(commit, now);
                } else {
                    cc.add(commit);
                }
            }
        }

        for (seqno, checkpoints) in persisted.checkpoints {
            let cert = if seqno == ls {
                &mut self.stable_cert
            } else {
                self.elog.fetch(seqno)
            };
            for checkpoint in checkpoints {
                if checkpoint.sender == self.id {
                    cert.add_mine(checkpoint, now);
                } else {
                    cert.add(checkpoint);
                }
            }
        }
        self.stable_cert.make_complete();

        if !self.vi.restore(self.view, ls, persisted.old_requests) {
            return Err(AgreementError::PersistenceInvalid {
                view: self.view,
                reason: "inconsistent view-change log".to_string(),
            });
        }
        if !self.limbo {
            self.vi.make_complete(self.view);
        }
        if self.limbo || !self.has_new_view() {
            self.vtimer.start(now);
        }
        Ok(())
    }
}
