use crate::types::{Challenge, ExecutionResult, QueuedExecution};
use redis::{AsyncCommands, RedisResult};
use uuid::Uuid;

/// Redis key semantics shared by the worker and the CLI.
/// Keys are deterministic so both sides never drift.

pub const QUEUE_KEY: &str = "gradebox:queue";
pub const RESULT_PREFIX: &str = "gradebox:result";
pub const CHALLENGE_PREFIX: &str = "gradebox:challenge";

/// Result key for a queued execution
pub fn result_key(execution_id: &Uuid) -> String {
    format!("{}:{}", RESULT_PREFIX, execution_id)
}

/// Storage key for a challenge document
pub fn challenge_key(challenge_id: &str) -> String {
    format!("{}:{}", CHALLENGE_PREFIX, challenge_id)
}

fn encode_error(e: serde_json::Error) -> redis::RedisError {
    redis::RedisError::from((redis::ErrorKind::TypeError, "serialization error", e.to_string()))
}

fn decode_error(e: serde_json::Error) -> redis::RedisError {
    redis::RedisError::from((redis::ErrorKind::TypeError, "deserialization error", e.to_string()))
}

/// Push an execution onto the queue.
/// RPUSH + BLPOP gives FIFO semantics.
pub async fn push_execution(
    conn: &mut redis::aio::ConnectionManager,
    queue: &str,
    execution: &QueuedExecution,
) -> RedisResult<()> {
    let payload = serde_json::to_string(execution).map_err(encode_error)?;
    conn.rpush(queue, payload).await
}

/// Pop the next execution, waiting at most `timeout_seconds`
pub async fn pop_execution(
    conn: &mut redis::aio::ConnectionManager,
    queue: &str,
    timeout_seconds: f64,
) -> RedisResult<Option<QueuedExecution>> {
    let popped: Option<(String, String)> = conn.blpop(queue, timeout_seconds).await?;

    match popped {
        Some((_key, payload)) => {
            let execution = serde_json::from_str(&payload).map_err(decode_error)?;
            Ok(Some(execution))
        }
        None => Ok(None),
    }
}

/// Store a result with a TTL
pub async fn store_result(
    conn: &mut redis::aio::ConnectionManager,
    execution_id: &Uuid,
    result: &ExecutionResult,
    ttl_seconds: u64,
) -> RedisResult<()> {
    let payload = serde_json::to_string(result).map_err(encode_error)?;
    let _: () = conn.set_ex(result_key(execution_id), payload, ttl_seconds).await?;
    Ok(())
}

pub async fn get_result(
    conn: &mut redis::aio::ConnectionManager,
    execution_id: &Uuid,
) -> RedisResult<Option<ExecutionResult>> {
    let payload: Option<String> = conn.get(result_key(execution_id)).await?;

    match payload {
        Some(data) => Ok(Some(serde_json::from_str(&data).map_err(decode_error)?)),
        None => Ok(None),
    }
}

/// Write a challenge document. Only the CLI writes challenges.
pub async fn put_challenge(
    conn: &mut redis::aio::ConnectionManager,
    challenge: &Challenge,
) -> RedisResult<()> {
    let payload = serde_json::to_string(challenge).map_err(encode_error)?;
    let _: () = conn.set(challenge_key(&challenge.id), payload).await?;
    Ok(())
}

pub async fn get_challenge(
    conn: &mut redis::aio::ConnectionManager,
    challenge_id: &str,
) -> RedisResult<Option<Challenge>> {
    let payload: Option<String> = conn.get(challenge_key(challenge_id)).await?;

    match payload {
        Some(data) => Ok(Some(serde_json::from_str(&data).map_err(decode_error)?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_key_deterministic() {
        let id = Uuid::new_v4();
        assert_eq!(result_key(&id), result_key(&id));
        assert!(result_key(&id).starts_with("gradebox:result:"));
        assert!(result_key(&id).ends_with(&id.to_string()));
    }

    #[test]
    fn test_challenge_key_format() {
        assert_eq!(challenge_key("pandas-101"), "gradebox:challenge:pandas-101");
    }
}
