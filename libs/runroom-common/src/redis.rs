use crate::types::{Envelope, Job};
use chrono::{DateTime, Utc};
use redis::{AsyncCommands, RedisResult};
use uuid::Uuid;

// Redis layout shared by every instance - API nodes, embedded workers and
// standalone workers must agree on these keys byte for byte.
//
// - `runroom:queue:pending`   list of job ids waiting for a worker (FIFO)
// - `runroom:queue:active`    list of job ids claimed by some worker
// - `runroom:job:{id}`        job record as JSON
// - `runroom:session:{sid}`   id of the session's in-flight job (dedup guard)
// - `runroom:room:{room}`     pub/sub channel for one room

pub const PENDING_QUEUE: &str = "runroom:queue:pending";
pub const ACTIVE_QUEUE: &str = "runroom:queue:active";
pub const JOB_PREFIX: &str = "runroom:job";
pub const SESSION_PREFIX: &str = "runroom:session";
pub const ROOM_CHANNEL_PREFIX: &str = "runroom:room";
pub const ROOM_CHANNEL_PATTERN: &str = "runroom:room:*";

/// Generate the record key for a job
pub fn job_key(job_id: &Uuid) -> String {
    format!("{}:{}", JOB_PREFIX, job_id)
}

/// Generate the in-flight guard key for a session
pub fn session_key(session_id: &str) -> String {
    format!("{}:{}", SESSION_PREFIX, session_id)
}

/// Generate the pub/sub channel for a room
pub fn room_channel(room: &str) -> String {
    format!("{}:{}", ROOM_CHANNEL_PREFIX, room)
}

/// Recover the room name from a channel produced by [`room_channel`]
pub fn room_from_channel(channel: &str) -> Option<&str> {
    channel
        .strip_prefix(ROOM_CHANNEL_PREFIX)
        .and_then(|rest| rest.strip_prefix(':'))
}

fn serialization_error(e: serde_json::Error) -> redis::RedisError {
    redis::RedisError::from((redis::ErrorKind::TypeError, "serialization error", e.to_string()))
}

fn deserialization_error(e: serde_json::Error) -> redis::RedisError {
    redis::RedisError::from((redis::ErrorKind::TypeError, "deserialization error", e.to_string()))
}

// KEYS: session guard, job record, pending list. ARGV: job id, job json.
const ENQUEUE_SCRIPT: &str = r#"
if redis.call('SET', KEYS[1], ARGV[1], 'NX') then
  redis.call('SET', KEYS[2], ARGV[2])
  redis.call('RPUSH', KEYS[3], ARGV[1])
  return 1
end
return 0
"#;

// KEYS: pending list, active list, job record, session guard. ARGV: job id.
const REMOVE_SCRIPT: &str = r#"
redis.call('LREM', KEYS[1], 0, ARGV[1])
redis.call('LREM', KEYS[2], 0, ARGV[1])
redis.call('DEL', KEYS[3])
if redis.call('GET', KEYS[4]) == ARGV[1] then
  redis.call('DEL', KEYS[4])
end
return 1
"#;

// Activation and requeue are both compare-and-set on the job record, so for
// any one delivery at most one of them wins.
// KEYS: job record. ARGV: expected json, new json.
const ACTIVATE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) ~= ARGV[1] then
  return 0
end
redis.call('SET', KEYS[1], ARGV[2])
return 1
"#;

// KEYS: active list, pending list, job record. ARGV: job id, expected json, requeued json.
const REQUEUE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[3]) ~= ARGV[2] then
  return 0
end
if redis.call('LREM', KEYS[1], 1, ARGV[1]) == 0 then
  return 0
end
redis.call('SET', KEYS[3], ARGV[3])
redis.call('LPUSH', KEYS[2], ARGV[1])
return 1
"#;

/// Enqueue a job unless its session already has one in flight.
///
/// The guard key, the record and the pending entry are written in one
/// script so no other instance can observe a half-enqueued job.
/// Returns `false` when the session is already busy.
pub async fn try_enqueue(
    conn: &mut redis::aio::ConnectionManager,
    job: &Job,
) -> RedisResult<bool> {
    let payload = serde_json::to_string(job).map_err(serialization_error)?;
    let id = job.id.to_string();

    let inserted: i64 = redis::Script::new(ENQUEUE_SCRIPT)
        .key(session_key(job.session_id()))
        .key(job_key(&job.id))
        .key(PENDING_QUEUE)
        .arg(&id)
        .arg(payload)
        .invoke_async(conn)
        .await?;

    Ok(inserted == 1)
}

/// Id of the job currently holding the session's in-flight guard, if any
pub async fn in_flight(
    conn: &mut redis::aio::ConnectionManager,
    session_id: &str,
) -> RedisResult<Option<Uuid>> {
    let id: Option<String> = conn.get(session_key(session_id)).await?;
    Ok(id.and_then(|raw| Uuid::parse_str(&raw).ok()))
}

/// Claim the next pending job.
///
/// Uses BLMOVE so the id lands in the active list atomically with leaving
/// the pending one; a worker that dies mid-job leaves its id behind for
/// [`requeue_stale`]. Activation only succeeds if the record is unchanged
/// since it was read, so a claim that recovery took back in the meantime is
/// given up. Returns `None` on timeout or a lost claim.
pub async fn claim_job(
    conn: &mut redis::aio::ConnectionManager,
    timeout_seconds: f64,
) -> RedisResult<Option<Job>> {
    let id: Option<String> = redis::cmd("BLMOVE")
        .arg(PENDING_QUEUE)
        .arg(ACTIVE_QUEUE)
        .arg("LEFT")
        .arg("RIGHT")
        .arg(timeout_seconds)
        .query_async(conn)
        .await?;

    let Some(id) = id else {
        return Ok(None);
    };
    let Ok(job_id) = Uuid::parse_str(&id) else {
        let _: i64 = conn.lrem(ACTIVE_QUEUE, 0, &id).await?;
        return Ok(None);
    };

    let payload: Option<String> = conn.get(job_key(&job_id)).await?;
    let Some(payload) = payload else {
        // Record already removed by a previous delivery
        let _: i64 = conn.lrem(ACTIVE_QUEUE, 0, &id).await?;
        return Ok(None);
    };

    activate_claimed(conn, &payload).await
}

/// Mark a claimed job Active, provided its record still reads `payload`.
/// `None` means another delivery owns the job now.
pub async fn activate_claimed(
    conn: &mut redis::aio::ConnectionManager,
    payload: &str,
) -> RedisResult<Option<Job>> {
    let mut job: Job = serde_json::from_str(payload).map_err(deserialization_error)?;
    job.activate();
    let activated = serde_json::to_string(&job).map_err(serialization_error)?;

    let won: i64 = redis::Script::new(ACTIVATE_SCRIPT)
        .key(job_key(&job.id))
        .arg(payload)
        .arg(activated)
        .invoke_async(conn)
        .await?;

    Ok((won == 1).then_some(job))
}

/// Overwrite a job record, only if it still exists
pub async fn update_job(conn: &mut redis::aio::ConnectionManager, job: &Job) -> RedisResult<()> {
    let payload = serde_json::to_string(job).map_err(serialization_error)?;
    let _: Option<String> = redis::cmd("SET")
        .arg(job_key(&job.id))
        .arg(payload)
        .arg("XX")
        .query_async(conn)
        .await?;
    Ok(())
}

/// Fetch a job record
pub async fn get_job(
    conn: &mut redis::aio::ConnectionManager,
    job_id: &Uuid,
) -> RedisResult<Option<Job>> {
    let payload: Option<String> = conn.get(job_key(job_id)).await?;
    match payload {
        Some(data) => {
            let job: Job = serde_json::from_str(&data).map_err(deserialization_error)?;
            Ok(Some(job))
        }
        None => Ok(None),
    }
}

/// Remove every trace of a job. Safe to call any number of times.
pub async fn remove_job(
    conn: &mut redis::aio::ConnectionManager,
    job_id: &Uuid,
    session_id: &str,
) -> RedisResult<()> {
    let _: i64 = redis::Script::new(REMOVE_SCRIPT)
        .key(PENDING_QUEUE)
        .key(ACTIVE_QUEUE)
        .key(job_key(job_id))
        .key(session_key(session_id))
        .arg(job_id.to_string())
        .invoke_async(conn)
        .await?;
    Ok(())
}

/// Move active jobs that started before `cutoff` back to the head of the
/// pending queue, and clear out finished jobs whose removal never happened.
///
/// A job claimed but not yet activated is judged by its enqueue time. The
/// requeue is a compare-and-set against the record as read here, so it loses
/// to a concurrent activation and concurrent recoveries never duplicate a job.
pub async fn requeue_stale(
    conn: &mut redis::aio::ConnectionManager,
    cutoff: DateTime<Utc>,
) -> RedisResult<usize> {
    let ids: Vec<String> = conn.lrange(ACTIVE_QUEUE, 0, -1).await?;
    let mut requeued = 0;

    for id in ids {
        let payload: Option<String> = match Uuid::parse_str(&id) {
            Ok(job_id) => conn.get(job_key(&job_id)).await?,
            Err(_) => None,
        };

        let Some(payload) = payload else {
            let _: i64 = conn.lrem(ACTIVE_QUEUE, 0, &id).await?;
            continue;
        };
        let mut job: Job = serde_json::from_str(&payload).map_err(deserialization_error)?;

        if job.state.is_terminal() {
            // Finished but never removed; release the session
            remove_job(conn, &job.id, job.session_id()).await?;
            continue;
        }

        if job.started_at.unwrap_or(job.enqueued_at) >= cutoff {
            continue;
        }

        job.requeue();
        let requeued_payload = serde_json::to_string(&job).map_err(serialization_error)?;
        let won: i64 = redis::Script::new(REQUEUE_SCRIPT)
            .key(ACTIVE_QUEUE)
            .key(PENDING_QUEUE)
            .key(job_key(&job.id))
            .arg(&id)
            .arg(payload)
            .arg(requeued_payload)
            .invoke_async(conn)
            .await?;
        if won == 1 {
            requeued += 1;
        }
    }

    Ok(requeued)
}

/// Publish an envelope on its room's channel
pub async fn publish_envelope(
    conn: &mut redis::aio::ConnectionManager,
    envelope: &Envelope,
) -> RedisResult<()> {
    let payload = serde_json::to_string(envelope).map_err(serialization_error)?;
    let _: i64 = conn.publish(room_channel(&envelope.room), payload).await?;
    Ok(())
}

/// Decode an envelope received from a room channel
pub fn decode_envelope(payload: &str) -> RedisResult<Envelope> {
    serde_json::from_str(payload).map_err(deserialization_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_job_key_deterministic() {
        let id = Uuid::new_v4();
        let key1 = job_key(&id);
        let key2 = job_key(&id);
        assert_eq!(key1, key2);
        assert!(key1.starts_with("runroom:job:"));
        assert!(key1.contains(&id.to_string()));
    }

    #[test]
    fn test_session_key_format() {
        assert_eq!(session_key("abc"), "runroom:session:abc");
    }

    #[test]
    fn test_room_channel_round_trip() {
        let channel = room_channel("s1");
        assert_eq!(channel, "runroom:room:s1");
        assert_eq!(room_from_channel(&channel), Some("s1"));
        assert_eq!(room_from_channel("runroom:roomx"), None);
        assert_eq!(room_from_channel("other:room:s1"), None);
    }

    #[test]
    fn test_room_with_colons_survives_channel_mapping() {
        let channel = room_channel("team:42");
        assert_eq!(room_from_channel(&channel), Some("team:42"));
    }
}
