//! Redis discovery backend
//!
//! Layout under the configured prefix:
//! - `{prefix}record:{id}`: hash with `serviceName`, `endpoint`, `endpointHash`,
//!   `balancer`, `timestamp` (epoch ms) and `pingInterval`
//! - `{prefix}ids`: hash mapping `serviceName\nendpoint` to the record id
//! - `{prefix}timeline`: sorted set of every id, scored by timestamp
//! - `{prefix}balancers`: sorted set of ids whose record carries a balancer
//!
//! Records are never deleted here; staleness is judged by the reader.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::future::Future;
use tokio::time::timeout;

use super::{BackendOptions, DiscoveryBackend, QueryOptions, RecordFilter};
use crate::discovery::hasher::hash_endpoint;
use crate::discovery::record::{HeartbeatPayload, RecordKey, ServiceRecord};
use crate::error::{Error, Result};

/// Atomic upsert: resolve or assign the id, write fields, refresh both indices.
/// Returns the record id.
const UPSERT_SCRIPT: &str = r"
local id = redis.call('HGET', KEYS[1], ARGV[1])
if not id then
    id = ARGV[2]
    redis.call('HSET', KEYS[1], ARGV[1], id)
end

local key = ARGV[3] .. id
redis.call('HSET', key,
    'serviceName', ARGV[4],
    'endpoint', ARGV[5],
    'timestamp', ARGV[6],
    'pingInterval', ARGV[7])

if ARGV[8] == '1' then
    redis.call('HSET', key, 'endpointHash', ARGV[9])
    if ARGV[10] == '' then
        redis.call('HDEL', key, 'balancer')
    else
        redis.call('HSET', key, 'balancer', ARGV[10])
    end
end

local score = tonumber(ARGV[6])
redis.call('ZADD', KEYS[2], score, id)
if redis.call('HEXISTS', key, 'balancer') == 1 then
    redis.call('ZADD', KEYS[3], score, id)
else
    redis.call('ZREM', KEYS[3], id)
end

return id
";

pub struct RedisBackend {
    conn: RwLock<Option<ConnectionManager>>,
    options: BackendOptions,
    upsert_script: redis::Script,
}

impl RedisBackend {
    /// Open a managed connection to `url`
    ///
    /// A URL the client rejects is a configuration error; a server that cannot
    /// be reached within the operation timeout is `BackendUnavailable`.
    pub async fn connect(url: &str, options: BackendOptions) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| Error::Configuration(format!("Invalid Redis URL: {e}")))?;

        let conn = timeout(options.operation_timeout, client.get_connection_manager())
            .await
            .map_err(|_| Error::BackendUnavailable("Redis connection timed out".to_string()))?
            .map_err(|e| Error::BackendUnavailable(format!("Redis connection failed: {e}")))?;

        tracing::info!(prefix = %options.key_prefix, "Connected to Redis discovery backend");

        Ok(Self {
            conn: RwLock::new(Some(conn)),
            options,
            upsert_script: redis::Script::new(UPSERT_SCRIPT),
        })
    }

    fn connection(&self) -> Result<ConnectionManager> {
        self.conn
            .read()
            .clone()
            .ok_or_else(|| Error::BackendUnavailable("Redis backend is disconnected".to_string()))
    }

    async fn bounded<T, F>(&self, op: &str, fut: F) -> Result<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        timeout(self.options.operation_timeout, fut)
            .await
            .map_err(|_| Error::BackendUnavailable(format!("Redis {op} timed out")))?
            .map_err(|e| Error::BackendUnavailable(format!("Redis {op} failed: {e}")))
    }

    fn ids_key(&self) -> String {
        format!("{}ids", self.options.key_prefix)
    }

    fn timeline_key(&self) -> String {
        format!("{}timeline", self.options.key_prefix)
    }

    fn balancers_key(&self) -> String {
        format!("{}balancers", self.options.key_prefix)
    }

    fn record_key_prefix(&self) -> String {
        format!("{}record:", self.options.key_prefix)
    }

    fn id_field(key: &RecordKey) -> String {
        format!("{}\n{}", key.service_name, key.endpoint)
    }
}

#[async_trait]
impl DiscoveryBackend for RedisBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn upsert(&self, key: &RecordKey, payload: &HeartbeatPayload) -> Result<()> {
        let mut conn = self.connection()?;

        let (full, endpoint_hash, balancer) = match &payload.identity {
            Some(identity) => (
                "1",
                identity.endpoint_hash.as_str(),
                identity.balancer.as_deref().unwrap_or_default(),
            ),
            None => ("0", "", ""),
        };

        let mut invocation = self.upsert_script.prepare_invoke();
        invocation
            .key(self.ids_key())
            .key(self.timeline_key())
            .key(self.balancers_key())
            .arg(Self::id_field(key))
            .arg(nanoid::nanoid!())
            .arg(self.record_key_prefix())
            .arg(&key.service_name)
            .arg(&key.endpoint)
            .arg(payload.timestamp.timestamp_millis())
            .arg(payload.ping_interval_ms)
            .arg(full)
            .arg(endpoint_hash)
            .arg(balancer);

        let id: String = self
            .bounded("upsert", invocation.invoke_async(&mut conn))
            .await?;

        tracing::trace!(id = %id, record = %key, full = payload.identity.is_some(), "Heartbeat written");
        Ok(())
    }

    async fn query(
        &self,
        filter: RecordFilter,
        options: QueryOptions,
    ) -> Result<Vec<ServiceRecord>> {
        if options.limit == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.connection()?;
        let index = match filter {
            RecordFilter::All => self.timeline_key(),
            RecordFilter::WithBalancer => self.balancers_key(),
        };
        let range = if options.newest_first { "ZREVRANGE" } else { "ZRANGE" };
        let stop = isize::try_from(options.limit).unwrap_or(isize::MAX) - 1;

        let ids: Vec<String> = self
            .bounded(
                range,
                redis::cmd(range)
                    .arg(&index)
                    .arg(0)
                    .arg(stop)
                    .query_async(&mut conn),
            )
            .await?;

        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let prefix = self.record_key_prefix();
        let mut pipe = redis::pipe();
        for id in &ids {
            pipe.cmd("HGETALL").arg(format!("{prefix}{id}"));
        }

        let rows: Vec<HashMap<String, String>> =
            self.bounded("HGETALL", pipe.query_async(&mut conn)).await?;

        let records = ids
            .into_iter()
            .zip(rows)
            .filter_map(|(id, fields)| {
                let record = parse_record(&id, &fields);
                if record.is_none() {
                    tracing::warn!(id = %id, "Skipping malformed discovery record");
                }
                record
            })
            .collect();

        Ok(records)
    }

    async fn disconnect(&self) -> Result<()> {
        if self.conn.write().take().is_some() {
            tracing::info!("Disconnected from Redis discovery backend");
        }
        Ok(())
    }
}

/// Build a record from a stored hash. Unknown fields are ignored.
fn parse_record(id: &str, fields: &HashMap<String, String>) -> Option<ServiceRecord> {
    let service_name = fields.get("serviceName")?.clone();
    let endpoint = fields.get("endpoint")?.clone();
    let timestamp = fields
        .get("timestamp")
        .and_then(|v| v.parse::<i64>().ok())
        .and_then(DateTime::<Utc>::from_timestamp_millis)?;
    let ping_interval_ms = fields.get("pingInterval")?.parse::<u64>().ok()?;

    let endpoint_hash = fields
        .get("endpointHash")
        .filter(|h| !h.is_empty())
        .cloned()
        .unwrap_or_else(|| hash_endpoint(&endpoint));
    let balancer = fields.get("balancer").filter(|b| !b.is_empty()).cloned();

    Some(ServiceRecord {
        id: id.to_string(),
        service_name,
        endpoint,
        endpoint_hash,
        balancer,
        timestamp,
        ping_interval_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::record::RecordIdentity;

    fn fields(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_parse_full_record() {
        let row = fields(&[
            ("serviceName", "api"),
            ("endpoint", "http://h1:3000"),
            ("endpointHash", "abc123"),
            ("balancer", "http://lb:80"),
            ("timestamp", "1700000000000"),
            ("pingInterval", "5000"),
            ("somethingElse", "ignored"),
        ]);

        let record = parse_record("id1", &row).unwrap();
        assert_eq!(record.id, "id1");
        assert_eq!(record.service_name, "api");
        assert_eq!(record.endpoint_hash, "abc123");
        assert_eq!(record.balancer.as_deref(), Some("http://lb:80"));
        assert_eq!(record.timestamp.timestamp_millis(), 1_700_000_000_000);
        assert_eq!(record.ping_interval_ms, 5000);
    }

    #[test]
    fn test_parse_recomputes_missing_hash() {
        let row = fields(&[
            ("serviceName", "api"),
            ("endpoint", "http://h1:3000"),
            ("timestamp", "1700000000000"),
            ("pingInterval", "5000"),
        ]);

        let record = parse_record("id1", &row).unwrap();
        assert_eq!(record.endpoint_hash, hash_endpoint("http://h1:3000"));
        assert!(record.balancer.is_none());
    }

    #[test]
    fn test_parse_rejects_incomplete_rows() {
        assert!(parse_record("gone", &HashMap::new()).is_none());

        let bad_timestamp = fields(&[
            ("serviceName", "api"),
            ("endpoint", "http://h1:3000"),
            ("timestamp", "yesterday"),
            ("pingInterval", "5000"),
        ]);
        assert!(parse_record("id1", &bad_timestamp).is_none());
    }

    #[test]
    fn test_id_field_separates_name_and_endpoint() {
        let key = RecordKey::new("api", "http://h1:3000");
        assert_eq!(RedisBackend::id_field(&key), "api\nhttp://h1:3000");
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_url() {
        let result = RedisBackend::connect("http://localhost:6379", BackendOptions::default()).await;
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[tokio::test]
    #[ignore = "Requires Redis"]
    async fn test_redis_upsert_and_query() {
        let options = BackendOptions {
            key_prefix: format!("rendezvous-test-{}:", nanoid::nanoid!(6)),
            ..BackendOptions::default()
        };
        let backend = RedisBackend::connect("redis://127.0.0.1:6379", options)
            .await
            .unwrap();

        let key = RecordKey::new("api", "http://h1:3000");
        let identity = RecordIdentity {
            endpoint_hash: hash_endpoint("http://h1:3000"),
            balancer: Some("http://lb:80".to_string()),
        };
        backend
            .upsert(&key, &HeartbeatPayload::full(Utc::now(), 5000, identity))
            .await
            .unwrap();
        backend
            .upsert(&key, &HeartbeatPayload::partial(Utc::now(), 5000))
            .await
            .unwrap();

        let all = backend.query(RecordFilter::All, QueryOptions::default()).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].balancer.as_deref(), Some("http://lb:80"));

        let balancers = backend
            .query(RecordFilter::WithBalancer, QueryOptions::default())
            .await
            .unwrap();
        assert_eq!(balancers.len(), 1);

        backend.disconnect().await.unwrap();
        backend.disconnect().await.unwrap();
        assert!(backend.query(RecordFilter::All, QueryOptions::default()).await.is_err());
    }
}
