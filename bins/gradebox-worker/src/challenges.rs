// Challenge lookup. The worker only reads challenges; the CLI writes them.

use anyhow::{Context, Result};
use async_trait::async_trait;
use gradebox_common::redis as store;
use gradebox_common::types::Challenge;
use redis::aio::ConnectionManager;
use std::collections::HashMap;

#[async_trait]
pub trait ChallengeSource: Send + Sync {
    /// `Ok(None)` when no challenge has that id
    async fn challenge(&self, id: &str) -> Result<Option<Challenge>>;
}

/// Challenges stored in Redis under `gradebox:challenge:{id}`
#[derive(Clone)]
pub struct RedisChallengeStore {
    conn: ConnectionManager,
}

impl RedisChallengeStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl ChallengeSource for RedisChallengeStore {
    async fn challenge(&self, id: &str) -> Result<Option<Challenge>> {
        // ConnectionManager is a cheap handle; cloning gives this call its own
        let mut conn = self.conn.clone();
        let challenge = store::get_challenge(&mut conn, id)
            .await
            .with_context(|| format!("Failed to read challenge '{}'", id))?;

        match challenge {
            Some(challenge) => {
                challenge
                    .validate()
                    .with_context(|| format!("Stored challenge '{}' is invalid", id))?;
                Ok(Some(challenge))
            }
            None => Ok(None),
        }
    }
}

/// Fixed in-memory set of challenges
#[derive(Debug, Clone, Default)]
pub struct StaticChallenges {
    challenges: HashMap<String, Challenge>,
}

impl StaticChallenges {
    pub fn new(challenges: impl IntoIterator<Item = Challenge>) -> Result<Self> {
        let mut map = HashMap::new();
        for challenge in challenges {
            challenge
                .validate()
                .with_context(|| format!("Challenge '{}' is invalid", challenge.id))?;
            map.insert(challenge.id.clone(), challenge);
        }
        Ok(Self { challenges: map })
    }
}

#[async_trait]
impl ChallengeSource for StaticChallenges {
    async fn challenge(&self, id: &str) -> Result<Option<Challenge>> {
        Ok(self.challenges.get(id).cloned())
    }
}
