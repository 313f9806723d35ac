//! Server/channel ranking for a single job.
//!
//! Candidates are every configured server crossed with every channel of
//! the job. Channels matching the job's preference tokens form the
//! preferred group, the rest follow; inside each group pairs are ordered
//! by historical throughput. The sequence is walked once on failures and
//! then pinned to the best pair seen.

use crate::history::{smooth, HistoryStore};
use crate::jobs::{ChannelCandidate, PreferenceTokens, RecordingJob};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RankerError {
    #[error("Job has no channels to record from")]
    NoChannels,

    #[error("No servers configured")]
    NoServers,
}

/// One (server, channel) pair in the ranked sequence.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RankedCandidate {
    pub server: String,
    pub channel: String,
    pub description: String,
    pub preferred: bool,
    pub score: i32,
    /// Throughput estimate, starts from history and follows this job's observations
    pub kbps: u64,
}

/// Weight of a preference token and its core text.
///
/// Each `+` adds one, each `-` subtracts one, from a base weight of 1.
pub fn token_weight(token: &str) -> (String, i32) {
    let plus = token.chars().filter(|c| *c == '+').count() as i32;
    let minus = token.chars().filter(|c| *c == '-').count() as i32;
    let core: String = token.chars().filter(|c| *c != '+' && *c != '-').collect();
    (core.trim().to_lowercase(), 1 + plus - minus)
}

/// Sum of the weights of every token whose core appears in `value`.
pub fn preference_score(tokens: &[String], value: &str) -> i32 {
    let value = value.to_lowercase();
    tokens
        .iter()
        .map(|t| token_weight(t))
        .filter(|(core, _)| !core.is_empty() && value.contains(core.as_str()))
        .map(|(_, weight)| weight)
        .sum()
}

/// Score of a channel for a job.
pub fn score_channel(prefs: &PreferenceTokens, channel: &ChannelCandidate, category: &str) -> i32 {
    preference_score(&prefs.quality, &channel.quality)
        + preference_score(&prefs.language, &channel.language)
        + preference_score(&prefs.channel, &channel.number)
        + preference_score(&prefs.category, category)
}

/// Ranked candidate sequence of one job.
#[derive(Debug, Clone)]
pub struct ServerChannelRanker {
    sequence: Vec<RankedCandidate>,
    position: usize,
    pinned: bool,
}

impl ServerChannelRanker {
    /// Build the sequence for `job`. Never re-scored afterwards.
    pub fn new(
        history: &HistoryStore,
        servers: &[String],
        job: &RecordingJob,
    ) -> Result<Self, RankerError> {
        if job.channels.is_empty() {
            return Err(RankerError::NoChannels);
        }
        if servers.is_empty() {
            return Err(RankerError::NoServers);
        }

        let mut preferred = Vec::new();
        let mut other = Vec::new();
        for channel in &job.channels {
            let score = score_channel(&job.preferences, channel, &job.category);
            for server in servers {
                let candidate = RankedCandidate {
                    server: server.clone(),
                    channel: channel.number.clone(),
                    description: channel.description.clone(),
                    preferred: score > 0,
                    score,
                    kbps: history.avg_kbps(&channel.number, server),
                };
                if candidate.preferred {
                    preferred.push(candidate);
                } else {
                    other.push(candidate);
                }
            }
        }
        // stable: equal rates keep channel-then-server order
        preferred.sort_by(|a, b| b.kbps.cmp(&a.kbps));
        other.sort_by(|a, b| b.kbps.cmp(&a.kbps));
        preferred.extend(other);

        Ok(Self {
            sequence: preferred,
            position: 0,
            pinned: false,
        })
    }

    pub fn current(&self) -> &RankedCandidate {
        &self.sequence[self.position]
    }

    /// Fold an observation into the current pair's in-memory estimate.
    pub fn observe_rate(&mut self, kbps: u64) {
        let current = &mut self.sequence[self.position];
        current.kbps = smooth(current.kbps, kbps);
    }

    /// Fail over to the next pair, or pin to the best pair once the
    /// sequence is exhausted. No-op once pinned.
    pub fn advance(&mut self) -> &RankedCandidate {
        if self.pinned {
            return self.current();
        }
        if self.position + 1 < self.sequence.len() {
            self.position += 1;
        } else {
            self.position = self.best_index();
            self.pinned = true;
        }
        self.current()
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    pub fn candidates(&self) -> &[RankedCandidate] {
        &self.sequence
    }

    /// First pair with the highest estimate.
    fn best_index(&self) -> usize {
        let mut best = 0;
        for (i, candidate) in self.sequence.iter().enumerate() {
            if candidate.kbps > self.sequence[best].kbps {
                best = i;
            }
        }
        best
    }
}
