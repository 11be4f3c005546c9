//! Per-run coordinator state
//!
//! A [`RunContext`] is created for every coordinator call and threaded through
//! the reply loop by value. Updates consume the context and return the next
//! one, so nothing about a run lives on the coordinator itself.

use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use crate::broker::Correlation;
use crate::error::{ErrorCode, MapReduceError, MapReduceResult};
use crate::protocol::decode_reply;

/// What happened to one reply
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyOutcome {
    /// The reply filled an empty slot
    Accepted { index: u32 },
    /// The reply belongs to another run
    Foreign { run_id: Uuid },
    /// The slot already holds a value; the first reply wins
    Duplicate { index: u32 },
    /// The index does not name a slot of this run
    OutOfRange { index: u32 },
    /// The reply carries no correlation
    Uncorrelated,
    /// The payload could not be decoded
    Corrupt { index: u32, reason: String },
}

impl ReplyOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }
}

/// State of one coordinator run
#[derive(Debug, Clone)]
pub struct RunContext {
    run_id: Uuid,
    reply_queue: String,
    slots: Vec<Option<Value>>,
    outstanding: usize,
    attempts: Vec<u32>,
    deadlines: Vec<Option<Instant>>,
}

impl RunContext {
    pub fn new(run_id: Uuid, reply_queue: impl Into<String>, partitions: usize) -> Self {
        Self {
            run_id,
            reply_queue: reply_queue.into(),
            slots: vec![None; partitions],
            outstanding: partitions,
            attempts: vec![0; partitions],
            deadlines: vec![None; partitions],
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn reply_queue(&self) -> &str {
        &self.reply_queue
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    pub fn is_complete(&self) -> bool {
        self.outstanding == 0
    }

    pub fn slot(&self, index: usize) -> Option<&Value> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    /// Dispatches recorded for a slot
    pub fn attempts(&self, index: usize) -> u32 {
        self.attempts.get(index).copied().unwrap_or(0)
    }

    /// Record a publish of slot `index` at `at`; with a timeout the slot gets
    /// a deadline `timeout` later
    pub fn record_dispatch(mut self, index: usize, at: Instant, timeout: Option<Duration>) -> Self {
        if let Some(attempts) = self.attempts.get_mut(index) {
            *attempts += 1;
            self.deadlines[index] = timeout.map(|t| at + t);
        }
        self
    }

    /// Earliest deadline among unfilled slots
    pub fn next_deadline(&self) -> Option<Instant> {
        self.slots
            .iter()
            .zip(&self.deadlines)
            .filter(|(slot, _)| slot.is_none())
            .filter_map(|(_, deadline)| *deadline)
            .min()
    }

    /// Unfilled slots whose deadline is at or before `now`
    pub fn expired(&self, now: Instant) -> Vec<usize> {
        self.slots
            .iter()
            .zip(&self.deadlines)
            .enumerate()
            .filter(|(_, (slot, deadline))| {
                slot.is_none() && deadline.map(|d| d <= now).unwrap_or(false)
            })
            .map(|(index, _)| index)
            .collect()
    }

    /// Apply one reply delivered on the run's reply queue
    pub fn apply_reply(
        mut self,
        correlation: Option<Correlation>,
        payload: &[u8],
    ) -> (Self, ReplyOutcome) {
        let Some(correlation) = correlation else {
            return (self, ReplyOutcome::Uncorrelated);
        };
        if correlation.run_id != self.run_id {
            return (
                self,
                ReplyOutcome::Foreign {
                    run_id: correlation.run_id,
                },
            );
        }

        let index = correlation.sequence_index;
        let outcome = match self.slots.get(index as usize) {
            None => ReplyOutcome::OutOfRange { index },
            Some(Some(_)) => ReplyOutcome::Duplicate { index },
            Some(None) => match decode_reply(payload) {
                Ok(reply) => {
                    self.slots[index as usize] = Some(reply.partial);
                    self.outstanding -= 1;
                    ReplyOutcome::Accepted { index }
                }
                Err(e) => ReplyOutcome::Corrupt {
                    index,
                    reason: e.to_string(),
                },
            },
        };
        (self, outcome)
    }

    /// Partial results in emission order
    pub fn into_partials(self) -> MapReduceResult<Vec<Value>> {
        let run_id = self.run_id;
        let missing = self.slots.iter().filter(|s| s.is_none()).count();
        if missing > 0 {
            return Err(MapReduceError::coordination_with_code(
                ErrorCode::COORD_INCOMPLETE_RUN,
                format!("{} result slots are still empty", missing),
                Some(run_id.to_string()),
            ));
        }
        Ok(self.slots.into_iter().flatten().collect())
    }
}
