//! Payload combinatorics: turning named payload lists into a sequence of
//! concrete parameter tuples.

use indexmap::IndexMap;
use serde::Deserialize;

/// The mode used to enumerate payload tuples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttackKind {
    /// Each value of each payload in turn, other payload names absent.
    #[default]
    Sniper,
    /// Zip the lists index-wise, stopping at the shortest.
    Pitchfork,
    /// Cartesian product in declaration order, last list cycling fastest.
    #[serde(alias = "cluster-bomb")]
    ClusterBomb,
}

/// One concrete assignment of values to payload names.
pub type PayloadTuple = IndexMap<String, String>;

/// Compiled payload lists for one request.
#[derive(Debug, Clone)]
pub struct PayloadGenerator {
    payloads: IndexMap<String, Vec<String>>,
    attack: AttackKind,
}

impl PayloadGenerator {
    pub fn new(payloads: IndexMap<String, Vec<String>>, attack: AttackKind) -> Self {
        Self { payloads, attack }
    }

    pub fn attack(&self) -> AttackKind {
        self.attack
    }

    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty() || self.payloads.values().all(Vec::is_empty)
    }

    pub fn iterator(&self) -> PayloadIterator {
        PayloadIterator {
            payloads: self.payloads.clone(),
            attack: self.attack,
            cursor: Cursor::start(),
            emitted: 0,
        }
    }

    /// Number of tuples one full iteration emits.
    pub fn total(&self) -> usize {
        total_for(&self.payloads, self.attack)
    }
}

fn total_for(payloads: &IndexMap<String, Vec<String>>, attack: AttackKind) -> usize {
    if payloads.is_empty() {
        return 0;
    }
    match attack {
        AttackKind::Sniper => payloads.values().map(Vec::len).sum(),
        AttackKind::Pitchfork => payloads.values().map(Vec::len).min().unwrap_or(0),
        AttackKind::ClusterBomb => payloads.values().map(Vec::len).product(),
    }
}

#[derive(Debug, Clone)]
enum Cursor {
    /// (payload index, value index) for sniper; a single index for
    /// pitchfork; an odometer for cluster-bomb.
    Sniper(usize, usize),
    Pitchfork(usize),
    Odometer(Option<Vec<usize>>),
}

impl Cursor {
    fn start() -> Self {
        Self::Sniper(0, 0)
    }
}

/// Stateful walk over the payload tuple space.
///
/// `value()` hands out the next tuple until the space is exhausted;
/// `reset()` restarts from the beginning.
#[derive(Debug, Clone)]
pub struct PayloadIterator {
    payloads: IndexMap<String, Vec<String>>,
    attack: AttackKind,
    cursor: Cursor,
    emitted: usize,
}

impl PayloadIterator {
    pub fn total(&self) -> usize {
        total_for(&self.payloads, self.attack)
    }

    pub fn remaining(&self) -> usize {
        self.total().saturating_sub(self.emitted)
    }

    pub fn reset(&mut self) {
        self.cursor = match self.attack {
            AttackKind::Sniper => Cursor::Sniper(0, 0),
            AttackKind::Pitchfork => Cursor::Pitchfork(0),
            AttackKind::ClusterBomb => Cursor::Odometer(None),
        };
        self.emitted = 0;
    }

    /// Next tuple, or `None` once the space is exhausted.
    pub fn value(&mut self) -> Option<PayloadTuple> {
        if self.emitted == 0 && matches!(self.cursor, Cursor::Sniper(0, 0)) {
            // Align the cursor with the attack kind on first use.
            self.reset();
        }
        let tuple = match self.attack {
            AttackKind::Sniper => self.next_sniper(),
            AttackKind::Pitchfork => self.next_pitchfork(),
            AttackKind::ClusterBomb => self.next_cluster_bomb(),
        }?;
        self.emitted += 1;
        Some(tuple)
    }

    fn next_sniper(&mut self) -> Option<PayloadTuple> {
        let Cursor::Sniper(mut key_idx, mut val_idx) = self.cursor else {
            return None;
        };
        loop {
            let (name, values) = self.payloads.get_index(key_idx)?;
            match values.get(val_idx) {
                Some(value) => {
                    let mut tuple = PayloadTuple::new();
                    tuple.insert(name.clone(), value.clone());
                    self.cursor = Cursor::Sniper(key_idx, val_idx + 1);
                    return Some(tuple);
                }
                None => {
                    key_idx += 1;
                    val_idx = 0;
                }
            }
        }
    }

    fn next_pitchfork(&mut self) -> Option<PayloadTuple> {
        let Cursor::Pitchfork(index) = self.cursor else {
            return None;
        };
        let mut tuple = PayloadTuple::new();
        for (name, values) in &self.payloads {
            tuple.insert(name.clone(), values.get(index)?.clone());
        }
        if tuple.is_empty() {
            return None;
        }
        self.cursor = Cursor::Pitchfork(index + 1);
        Some(tuple)
    }

    fn next_cluster_bomb(&mut self) -> Option<PayloadTuple> {
        if self.payloads.is_empty() || self.payloads.values().any(Vec::is_empty) {
            return None;
        }
        let Cursor::Odometer(state) = &mut self.cursor else {
            return None;
        };
        let indices = match state {
            None => {
                *state = Some(vec![0; self.payloads.len()]);
                state.as_ref()?
            }
            Some(indices) => {
                // Advance from the last axis so the final payload list
                // cycles fastest.
                let mut axis = indices.len();
                loop {
                    if axis == 0 {
                        return None;
                    }
                    axis -= 1;
                    let len = self.payloads.get_index(axis).map_or(0, |(_, v)| v.len());
                    indices[axis] += 1;
                    if indices[axis] < len {
                        break;
                    }
                    indices[axis] = 0;
                }
                &*indices
            }
        };
        let mut tuple = PayloadTuple::new();
        for (axis, (name, values)) in self.payloads.iter().enumerate() {
            tuple.insert(name.clone(), values.get(indices[axis])?.clone());
        }
        Some(tuple)
    }
}
