use async_trait::async_trait;
use chrono::Utc;
use redis::{AsyncCommands, Script};
use uuid::Uuid;

use crate::error::BackendError;
use crate::task::{StatusFilter, Task, TaskStatus, TaskUpdate};

use super::Storage;

/// Atomically pops the highest-scored member of the pending sorted set,
/// moves it into the processing sorted set under the same score, flips its
/// stored JSON body's `status`/`updated_at`, and returns the updated body.
/// Returns `false` when the pending set is empty.
///
/// Single server-side script invocation is the atomicity primitive across
/// processes — the canonical implementation spec.md §4.3 calls for.
const DEQUEUE_SCRIPT: &str = r#"
local pending_key = KEYS[1]
local processing_key = KEYS[2]
local prefix = ARGV[1]
local now_iso = ARGV[2]

local popped = redis.call('ZREVRANGE', pending_key, 0, 0, 'WITHSCORES')
if #popped == 0 then
  return false
end

local id = popped[1]
local score = popped[2]
redis.call('ZREM', pending_key, id)
redis.call('ZADD', processing_key, score, id)

local task_key = prefix .. ':task:' .. id
local task_json = redis.call('GET', task_key)
if not task_json then
  return false
end

local task = cjson.decode(task_json)
task['status'] = 'processing'
task['updated_at'] = now_iso

local encoded = cjson.encode(task)
redis.call('SET', task_key, encoded)

return encoded
"#;

/// One key per task (`{prefix}:task:{id}`, JSON body) plus one sorted set
/// per status (`{prefix}:queue:{status}`, scored by
/// `priority * 10^6 - created_at_millis` so descending score yields
/// `(priority desc, created_at asc)`), plus a plain set `{prefix}:tasks`
/// tracking every id ever enqueued so `load_tasks(None)` doesn't need to
/// union every status set.
pub struct RedisStorage {
    client: redis::Client,
    prefix: String,
    dequeue_script: Script,
}

impl RedisStorage {
    pub fn new(url: &str, prefix: impl Into<String>) -> Result<Self, BackendError> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            client,
            prefix: prefix.into(),
            dequeue_script: Script::new(DEQUEUE_SCRIPT),
        })
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection, BackendError> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    fn task_key(&self, id: Uuid) -> String {
        format!("{}:task:{}", self.prefix, id)
    }

    fn queue_key(&self, status: TaskStatus) -> String {
        format!("{}:queue:{}", self.prefix, status)
    }

    fn all_tasks_key(&self) -> String {
        format!("{}:tasks", self.prefix)
    }

    fn score(task: &Task) -> i64 {
        task.priority as i64 * 1_000_000 - task.created_at.timestamp_millis()
    }

    fn serialize(task: &Task) -> Result<String, BackendError> {
        serde_json::to_string(task).map_err(|e| BackendError::Serialization(e.to_string()))
    }

    fn deserialize(json: &str) -> Result<Task, BackendError> {
        serde_json::from_str(json).map_err(|e| BackendError::Serialization(e.to_string()))
    }
}

#[async_trait]
impl Storage for RedisStorage {
    async fn enqueue(&self, task: Task) -> Result<(), BackendError> {
        let mut conn = self.conn().await?;
        let json = Self::serialize(&task)?;
        let score = Self::score(&task);

        redis::pipe()
            .atomic()
            .set(self.task_key(task.id), json)
            .sadd(self.all_tasks_key(), task.id.to_string())
            .zadd(self.queue_key(TaskStatus::Pending), task.id.to_string(), score)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<Task>, BackendError> {
        let mut conn = self.conn().await?;
        let now_iso = Utc::now().to_rfc3339();

        let result: redis::Value = self
            .dequeue_script
            .key(self.queue_key(TaskStatus::Pending))
            .key(self.queue_key(TaskStatus::Processing))
            .arg(&self.prefix)
            .arg(now_iso)
            .invoke_async(&mut conn)
            .await?;

        match result {
            redis::Value::Data(bytes) => {
                let json = String::from_utf8_lossy(&bytes);
                Ok(Some(Self::deserialize(&json)?))
            }
            _ => Ok(None),
        }
    }

    async fn load_tasks(&self, status: StatusFilter) -> Result<Vec<Task>, BackendError> {
        let mut conn = self.conn().await?;

        let ids: Vec<String> = match status {
            Some(status) => conn.zrange(self.queue_key(status), 0, -1).await?,
            None => conn.smembers(self.all_tasks_key()).await?,
        };

        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = ids.iter().map(|id| format!("{}:task:{}", self.prefix, id)).collect();
        let bodies: Vec<Option<String>> = conn.mget(keys).await?;
        bodies
            .into_iter()
            .flatten()
            .map(|json| Self::deserialize(&json))
            .collect()
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, BackendError> {
        let mut conn = self.conn().await?;
        let json: Option<String> = conn.get(self.task_key(id)).await?;
        json.map(|j| Self::deserialize(&j)).transpose()
    }

    async fn update_task(
        &self,
        id: Uuid,
        update: TaskUpdate,
    ) -> Result<Option<Task>, BackendError> {
        let mut conn = self.conn().await?;
        let Some(mut task) = self.get_task(id).await? else {
            return Ok(None);
        };

        let previous_status = task.status;
        if let Some(status) = update.status {
            task.status = status;
        }
        if let Some(log) = update.log {
            task.log = Some(log);
        }
        if let Some(retry_count) = update.retry_count {
            task.retry_count = retry_count;
        }
        if let Some(reclaim_count) = update.reclaim_count {
            task.reclaim_count = reclaim_count;
        }
        task.updated_at = Utc::now();

        let json = Self::serialize(&task)?;
        let score = Self::score(&task);

        let mut pipe = redis::pipe();
        pipe.atomic().set(self.task_key(id), json);
        if previous_status != task.status {
            pipe.zrem(self.queue_key(previous_status), id.to_string());
            pipe.zadd(self.queue_key(task.status), id.to_string(), score);
        }
        pipe.query_async(&mut conn).await?;

        Ok(Some(task))
    }

    async fn delete_task(&self, id: Uuid, hard: bool) -> Result<Option<Task>, BackendError> {
        let mut conn = self.conn().await?;
        let Some(task) = self.get_task(id).await? else {
            return Ok(None);
        };

        if hard {
            redis::pipe()
                .atomic()
                .del(self.task_key(id))
                .srem(self.all_tasks_key(), id.to_string())
                .zrem(self.queue_key(task.status), id.to_string())
                .query_async(&mut conn)
                .await?;
            return Ok(Some(task));
        }

        self.update_task(id, TaskUpdate::status(TaskStatus::Deleted)).await
    }
}
