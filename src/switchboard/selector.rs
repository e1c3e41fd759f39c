//! Least-loaded connection selection

use super::Switchboard;
use crate::enclave::EnclaveId;

/// Pick the candidate with the smallest backlog
///
/// The incumbent, if any, is considered first. A later candidate only wins with a strictly
/// smaller backlog, so ties go to whichever was seen first. Backlogs are read once per
/// candidate and may already be stale when the result is used.
pub fn least_loaded<T, I, F>(incumbent: Option<T>, candidates: I, backlog: F) -> Option<T>
where
    I: IntoIterator<Item = T>,
    F: Fn(&T) -> u64,
{
    let mut best_load = incumbent.as_ref().map(&backlog);
    let mut best = incumbent;

    for candidate in candidates {
        let load = backlog(&candidate);
        if best_load.is_none_or(|current| load < current) {
            best_load = Some(load);
            best = Some(candidate);
        }
    }

    best
}

impl Switchboard {
    /// Re-run the selection and publish the result
    ///
    /// The published choice is always drawn from the set as it was during the scan; an
    /// incumbent that has since been removed is not kept.
    pub fn reevaluate(&self) -> Option<EnclaveId> {
        let enclaves = self.inner.enclaves.read();
        let incumbent = self
            .current_best()
            .filter(|best| enclaves.iter().any(|e| e.id() == best.id()));

        let choice = least_loaded(incumbent, enclaves.iter().cloned(), |e| e.pending_bytes());
        let id = choice.as_ref().map(|e| e.id());
        *self.inner.optimum.write() = choice;
        id
    }

    /// Re-evaluate on a background task
    pub(crate) fn schedule_reevaluation(&self) {
        let switchboard = self.clone();
        tokio::spawn(async move {
            switchboard.reevaluate();
        });
    }
}
