use crate::circuit::BusMode;
use serde::{Deserialize, Serialize};

/// Control state of a bus during a power flow.
///
/// A PV bus that runs into one of its reactive limits becomes a PQ bus that
/// remembers which limit it is held at, so that it can be released again
/// when its voltage moves back past the set point.
#[derive(Debug, Default, PartialEq, Eq, Copy, Clone, Serialize, Deserialize)]
pub enum BusState {
    Slack,
    Pv,
    #[default]
    Pq,
    /// Former PV bus holding Q at its upper limit.
    PqAtQmax,
    /// Former PV bus holding Q at its lower limit.
    PqAtQmin,
}

/// Outcome of checking a bus against its reactive power limits.
#[derive(Debug, PartialEq, Copy, Clone)]
pub enum Switch {
    /// Bus becomes (or stays) PQ with Q fixed at the given limit.
    ToPq(BusState, f64),
    /// Bus returns to voltage control.
    ToPv,
}

impl BusState {
    pub fn from_mode(mode: BusMode) -> Self {
        match mode {
            BusMode::Slack => BusState::Slack,
            BusMode::PV => BusState::Pv,
            BusMode::PQ => BusState::Pq,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            BusState::Slack => "Vd",
            BusState::Pv => "PV",
            BusState::Pq => "PQ",
            BusState::PqAtQmax => "PQ+",
            BusState::PqAtQmin => "PQ-",
        }
    }

    pub fn is_pq(&self) -> bool {
        matches!(self, BusState::Pq | BusState::PqAtQmax | BusState::PqAtQmin)
    }

    /// PV/PQ switching logic (J. Zhao).
    ///
    /// A PV bus whose reactive power `q` reaches `qmax` (`qmin`) is switched
    /// to PQ with Q fixed at that limit. A bus held at `qmax` is released to
    /// PV once its voltage rises above the set point, and one held at `qmin`
    /// once its voltage falls below it. `deadband` is the voltage margin the
    /// crossing must exceed. Returns `None` when the state is unchanged.
    pub fn switch(
        self,
        vm: f64,
        vset: f64,
        q: f64,
        qmin: f64,
        qmax: f64,
        deadband: f64,
    ) -> Option<Switch> {
        match self {
            BusState::Pv => {
                if q >= qmax {
                    Some(Switch::ToPq(BusState::PqAtQmax, qmax))
                } else if q <= qmin {
                    Some(Switch::ToPq(BusState::PqAtQmin, qmin))
                } else {
                    None
                }
            }
            BusState::PqAtQmax => {
                if vm > vset + deadband {
                    Some(Switch::ToPv)
                } else {
                    None
                }
            }
            BusState::PqAtQmin => {
                if vm < vset - deadband {
                    Some(Switch::ToPv)
                } else {
                    None
                }
            }
            BusState::Slack | BusState::Pq => None,
        }
    }
}

/// Per-bus control states of an island.
#[derive(Debug, Clone, PartialEq)]
pub struct BusClassification {
    pub states: Vec<BusState>,
}

impl BusClassification {
    pub fn from_modes(modes: &[BusMode]) -> Self {
        BusClassification {
            states: modes.iter().map(|&m| BusState::from_mode(m)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    fn find(&self, f: impl Fn(&BusState) -> bool) -> Vec<usize> {
        self.states
            .iter()
            .enumerate()
            .filter(|(_, s)| f(s))
            .map(|(i, _)| i)
            .collect()
    }

    /// Reference (slack) bus indices.
    pub fn slack(&self) -> Vec<usize> {
        self.find(|s| *s == BusState::Slack)
    }

    pub fn pv(&self) -> Vec<usize> {
        self.find(|s| *s == BusState::Pv)
    }

    /// PQ bus indices, including PV buses held at a reactive limit.
    pub fn pq(&self) -> Vec<usize> {
        self.find(BusState::is_pq)
    }

    /// PV indices followed by PQ indices.
    pub fn pvpq(&self) -> Vec<usize> {
        [self.pv(), self.pq()].concat()
    }

    pub fn has_slack(&self) -> bool {
        self.states.contains(&BusState::Slack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_sets_partition_buses() {
        let bc = BusClassification {
            states: vec![
                BusState::Pq,
                BusState::Slack,
                BusState::PqAtQmin,
                BusState::Pv,
                BusState::PqAtQmax,
            ],
        };
        assert_eq!(bc.slack(), vec![1]);
        assert_eq!(bc.pv(), vec![3]);
        assert_eq!(bc.pq(), vec![0, 2, 4]);
        assert_eq!(bc.pvpq(), vec![3, 0, 2, 4]);

        let mut all = [bc.slack(), bc.pvpq()].concat();
        all.sort();
        assert_eq!(all, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn pv_hits_limits() {
        let s = BusState::Pv;
        assert_eq!(
            s.switch(1.0, 1.0, 0.6, -0.5, 0.5, 0.0),
            Some(Switch::ToPq(BusState::PqAtQmax, 0.5))
        );
        assert_eq!(
            s.switch(1.0, 1.0, -0.7, -0.5, 0.5, 0.0),
            Some(Switch::ToPq(BusState::PqAtQmin, -0.5))
        );
        assert_eq!(s.switch(1.0, 1.0, 0.1, -0.5, 0.5, 0.0), None);
    }

    #[test]
    fn limited_bus_released_when_voltage_crosses_set_point() {
        // held at Qmax: still under-voltage, so keep holding
        assert_eq!(BusState::PqAtQmax.switch(0.98, 1.0, 0.5, -0.5, 0.5, 1e-6), None);
        assert_eq!(
            BusState::PqAtQmax.switch(1.01, 1.0, 0.5, -0.5, 0.5, 1e-6),
            Some(Switch::ToPv)
        );

        // held at Qmin: over-voltage keeps it there
        assert_eq!(BusState::PqAtQmin.switch(1.02, 1.0, -0.5, -0.5, 0.5, 1e-6), None);
        assert_eq!(
            BusState::PqAtQmin.switch(0.99, 1.0, -0.5, -0.5, 0.5, 1e-6),
            Some(Switch::ToPv)
        );
    }

    #[test]
    fn deadband_suppresses_noise() {
        assert_eq!(BusState::PqAtQmax.switch(1.0 + 1e-9, 1.0, 0.5, -0.5, 0.5, 1e-6), None);
    }

    #[test]
    fn fixed_types_never_switch() {
        assert_eq!(BusState::Slack.switch(1.0, 1.0, 9.0, -0.5, 0.5, 0.0), None);
        assert_eq!(BusState::Pq.switch(1.0, 1.0, 9.0, -0.5, 0.5, 0.0), None);
    }
}
