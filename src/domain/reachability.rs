use crate::domain::time::{Clock, TimestampMs};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReachabilityTransition {
    WentOffline { at: TimestampMs },
    CameOnline { at: TimestampMs },
}

impl ReachabilityTransition {
    pub fn reachable(&self) -> bool {
        matches!(self, Self::CameOnline { .. })
    }

    pub fn at(&self) -> TimestampMs {
        match self {
            Self::WentOffline { at } | Self::CameOnline { at } => *at,
        }
    }
}

/// Debounced online/offline state of one station as seen by the router.
#[derive(Debug, Clone)]
pub struct ReachabilityTracker {
    debounce_samples: usize,
    stable_reachable: Option<bool>,
    candidate: Option<Candidate>,
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    reachable: bool,
    count: usize,
    first_seen_at: TimestampMs,
}

impl ReachabilityTracker {
    pub fn new(debounce_samples: usize) -> Self {
        Self {
            debounce_samples: debounce_samples.max(1),
            stable_reachable: None,
            candidate: None,
        }
    }

    /// The transition is stamped with the first observation of the new state,
    /// so debouncing does not bill the offline samples.
    pub fn observe<C: Clock + ?Sized>(
        &mut self,
        reachable: bool,
        clock: &C,
    ) -> Option<ReachabilityTransition> {
        let now = clock.now();

        match self.stable_reachable {
            None => {
                if self.accept_candidate(reachable, now).is_some() {
                    self.stable_reachable = Some(reachable);
                    self.candidate = None;
                }
                None
            }
            Some(stable) if stable == reachable => {
                self.candidate = None;
                None
            }
            Some(_) => {
                let first_seen_at = self.accept_candidate(reachable, now)?;

                self.stable_reachable = Some(reachable);
                self.candidate = None;

                if reachable {
                    Some(ReachabilityTransition::CameOnline { at: first_seen_at })
                } else {
                    Some(ReachabilityTransition::WentOffline { at: first_seen_at })
                }
            }
        }
    }

    pub fn stable_reachable(&self) -> Option<bool> {
        self.stable_reachable
    }

    fn accept_candidate(&mut self, reachable: bool, now: TimestampMs) -> Option<TimestampMs> {
        match self.candidate {
            Some(mut candidate) if candidate.reachable == reachable => {
                candidate.count += 1;
                self.candidate = Some(candidate);
                (candidate.count >= self.debounce_samples).then_some(candidate.first_seen_at)
            }
            _ => {
                self.candidate = Some(Candidate {
                    reachable,
                    count: 1,
                    first_seen_at: now,
                });
                (self.debounce_samples == 1).then_some(now)
            }
        }
    }
}
