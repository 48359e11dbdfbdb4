// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The pool of assignable endpoint IDs.

use crate::Error;
use mctpd_wire::Eid;
use std::collections::BTreeSet;
use std::ops::RangeInclusive;

/// The set of EIDs available for assignment to discovered endpoints.
///
/// Seeded once from the configured range at startup; reserved values are
/// filtered out. Allocation always hands out the lowest free value, so EIDs
/// stay small and allocation order is deterministic.
#[derive(Debug)]
pub(crate) struct EidPool {
    free: BTreeSet<u8>,
}

impl EidPool {
    pub fn new(range: RangeInclusive<u8>) -> Self {
        Self {
            free: range.filter(|value| Eid(*value).is_assignable()).collect(),
        }
    }

    /// Withdraw a specific EID from the pool, e.g. the daemon's own.
    pub fn remove(&mut self, eid: Eid) -> bool {
        self.free.remove(&eid.0)
    }

    /// Assign the lowest free EID.
    pub fn allocate(&mut self) -> Result<Eid, Error> {
        let Some(value) = self.free.iter().next().copied() else {
            return Err(Error::PoolExhausted);
        };
        self.free.remove(&value);
        Ok(Eid(value))
    }

    /// Return an EID to the pool. Idempotent; reserved values are ignored.
    pub fn release(&mut self, eid: Eid) {
        if eid.is_assignable() {
            self.free.insert(eid.0);
        }
    }
}
