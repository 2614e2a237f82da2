//! Transfer controllers: where each produced buffer goes.
//!
//! One controller serves one input port set of a circuit. It tracks which
//! input buffer is next for every port and answers two questions: may
//! output `rank` produce now, and into which (port, tid) pairs.
//!
//! | Variant | Pairing | Targets |
//! |---|---|---|
//! | 1 `Whole` | one output, whole input set | every port, lockstep tid |
//! | 2 `Scatter` | one output, round-robin set | next port in rank order |
//! | 3 `Gated` | many outputs, round-robin set | like 2, one output at a time by token |
//! | 4 `Partitioned` | one output, partitioned set | every port gets one part, lockstep tid |
//!
//! Buffer availability is read from the producing output's shadow words.
//! Every output of the circuit keeps an identical copy of them, so any rank
//! can be asked.

use super::Distribution;
use crate::error::{Error, Result};
use crate::port::{MAX_PORT_COUNT, Port};

/// One delivery of a produced buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    /// Input port index across all sets of the circuit (its shadow row).
    pub port: usize,
    /// Input buffer.
    pub tid: u32,
    /// Byte offset into the source buffer.
    pub offset: u32,
    /// Bytes to deliver.
    pub len: u32,
    /// Part index for partitioned sets.
    pub part: Option<u16>,
}

/// Target state of variants 1 and 4: one tid shared by every port.
#[derive(Debug, Clone)]
pub struct Lockstep {
    first: usize,
    ports: usize,
    buffer_count: u32,
    next_tid: u32,
}

impl Lockstep {
    fn step(&mut self) {
        self.next_tid = (self.next_tid + 1) % self.buffer_count;
    }

    fn positions(&self) -> impl Iterator<Item = (usize, u32)> + '_ {
        (self.first..self.first + self.ports).map(|p| (p, self.next_tid))
    }
}

/// Target state of variants 2 and 3: next port plus a tid per port.
#[derive(Debug, Clone)]
pub struct RoundRobin {
    first: usize,
    buffer_count: u32,
    next_port: usize,
    next_tid: Vec<u32>,
}

impl RoundRobin {
    fn current(&self) -> (usize, u32) {
        (self.first + self.next_port, self.next_tid[self.next_port])
    }

    fn step(&mut self) {
        let port = self.next_port;
        self.next_tid[port] = (self.next_tid[port] + 1) % self.buffer_count;
        self.next_port = (port + 1) % self.next_tid.len();
    }

    fn step_all(&mut self) {
        for tid in &mut self.next_tid {
            *tid = (*tid + 1) % self.buffer_count;
        }
    }

    fn positions(&self) -> impl Iterator<Item = (usize, u32)> + '_ {
        self.next_tid.iter().enumerate().map(|(p, &tid)| (self.first + p, tid))
    }
}

/// Produce/consume policy for one input port set.
#[derive(Debug, Clone)]
pub enum TransferController {
    /// Variant 1.
    Whole(Lockstep),
    /// Variant 2.
    Scatter(RoundRobin),
    /// Variant 3.
    Gated {
        /// Shared target selection.
        targets: RoundRobin,
        /// Rank of the output holding the barrier token.
        token: usize,
        /// Number of outputs passing the token.
        outputs: usize,
    },
    /// Variant 4.
    Partitioned(Lockstep),
}

impl TransferController {
    /// Pick the controller for `outputs` output ports feeding an input set.
    ///
    /// `first` is the index of the set's first port across the circuit.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedTopology`] for pairings no variant covers.
    pub fn select(
        outputs: usize,
        distribution: Distribution,
        first: usize,
        ports: usize,
        buffer_count: u32,
    ) -> Result<Self> {
        if outputs == 0 || ports == 0 || outputs > MAX_PORT_COUNT || first + ports > MAX_PORT_COUNT {
            return Err(Error::UnsupportedTopology(format!(
                "{outputs} outputs to ports {first}..{} (limit {MAX_PORT_COUNT})",
                first + ports
            )));
        }
        let lockstep = || Lockstep {
            first,
            ports,
            buffer_count,
            next_tid: 0,
        };
        let round_robin = || RoundRobin {
            first,
            buffer_count,
            next_port: 0,
            next_tid: vec![0; ports],
        };
        match (outputs, distribution) {
            (1, Distribution::Whole) => Ok(Self::Whole(lockstep())),
            (1, Distribution::RoundRobin) => Ok(Self::Scatter(round_robin())),
            (1, Distribution::Partitioned) => Ok(Self::Partitioned(lockstep())),
            (n, Distribution::RoundRobin) => Ok(Self::Gated {
                targets: round_robin(),
                token: 0,
                outputs: n,
            }),
            (n, Distribution::Whole) if ports == 1 => Ok(Self::Gated {
                targets: round_robin(),
                token: 0,
                outputs: n,
            }),
            (n, d) => Err(Error::UnsupportedTopology(format!(
                "{n} outputs cannot feed a {d:?} set of {ports} ports"
            ))),
        }
    }

    /// Variant number, 1 to 4.
    pub fn variant(&self) -> u8 {
        match self {
            Self::Whole(_) => 1,
            Self::Scatter(_) => 2,
            Self::Gated { .. } => 3,
            Self::Partitioned(_) => 4,
        }
    }

    /// True if output `rank` may send now. Always true except for variant 3,
    /// where only the token holder may.
    pub fn have_source_barrier_token(&self, rank: usize) -> bool {
        match self {
            Self::Gated { token, .. } => *token == rank,
            _ => true,
        }
    }

    /// Deliveries of a `len`-byte buffer.
    pub fn targets(&self, len: u32) -> Vec<Target> {
        let whole = |(port, tid): (usize, u32)| Target {
            port,
            tid,
            offset: 0,
            len,
            part: None,
        };
        match self {
            Self::Whole(l) => l.positions().map(whole).collect(),
            Self::Scatter(r) | Self::Gated { targets: r, .. } => vec![whole(r.current())],
            Self::Partitioned(l) => {
                let part_len = len.div_ceil(l.ports as u32);
                l.positions()
                    .enumerate()
                    .map(|(i, (port, tid))| {
                        let offset = (i as u32 * part_len).min(len);
                        Target {
                            port,
                            tid,
                            offset,
                            len: part_len.min(len - offset),
                            part: Some(i as u16),
                        }
                    })
                    .collect()
            }
        }
    }

    /// Deliveries of a broadcast: every port at its next buffer, no payload.
    pub fn broadcast_targets(&self) -> Vec<Target> {
        let empty = |(port, tid): (usize, u32)| Target {
            port,
            tid,
            offset: 0,
            len: 0,
            part: None,
        };
        match self {
            Self::Whole(l) | Self::Partitioned(l) => l.positions().map(empty).collect(),
            Self::Scatter(r) | Self::Gated { targets: r, .. } => r.positions().map(empty).collect(),
        }
    }

    fn all_free(outputs: &[Port], rank: usize, targets: &[Target]) -> bool {
        let port = &outputs[rank];
        targets.iter().all(|t| port.shadow_state(t.port, t.tid).is_empty())
    }

    /// True if output `rank` can produce into every target now.
    pub fn can_produce(&self, outputs: &[Port], rank: usize) -> bool {
        self.have_source_barrier_token(rank) && Self::all_free(outputs, rank, &self.targets(0))
    }

    /// True if output `rank` can broadcast now.
    pub fn can_broadcast(&self, outputs: &[Port], rank: usize) -> bool {
        self.have_source_barrier_token(rank) && Self::all_free(outputs, rank, &self.broadcast_targets())
    }

    fn pass_token(&mut self, rank: usize) {
        if let Self::Gated { token, outputs, .. } = self {
            debug_assert_eq!(*token, rank);
            *token = (rank + 1) % *outputs;
        }
    }

    /// Account for a produce by output `rank`.
    pub fn produced(&mut self, rank: usize) {
        match self {
            Self::Whole(l) | Self::Partitioned(l) => l.step(),
            Self::Scatter(r) | Self::Gated { targets: r, .. } => r.step(),
        }
        self.pass_token(rank);
    }

    /// Account for a broadcast by output `rank`.
    pub fn broadcasted(&mut self, rank: usize) {
        match self {
            Self::Whole(l) | Self::Partitioned(l) => l.step(),
            Self::Scatter(r) | Self::Gated { targets: r, .. } => r.step_all(),
        }
        self.pass_token(rank);
    }
}
