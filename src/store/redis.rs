//! Redis-backed coordination store for multi-instance deployments.

use super::{CoordinationStore, StoreResult};

use ::redis::AsyncCommands as _;
use ::redis::aio::ConnectionManager;
use std::time::Duration;

const COMPARE_AND_DELETE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

const COMPARE_AND_EXPIRE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

/// Shared store on a Redis server. Cloning reuses the managed connection.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = ::redis::Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        Ok(Self { connection })
    }
}

fn millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// Escape glob metacharacters so a literal prefix can be used with `SCAN MATCH`.
fn glob_escape(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for character in prefix.chars() {
        if matches!(character, '*' | '?' | '[' | ']' | '\\') {
            pattern.push('\\');
        }
        pattern.push(character);
    }
    pattern.push('*');
    pattern
}

impl CoordinationStore for RedisStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let mut connection = self.connection.clone();
        let written: Option<String> = ::redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut connection)
            .await?;
        Ok(written.is_some())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut connection = self.connection.clone();
        Ok(connection.get(key).await?)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let mut connection = self.connection.clone();
        match ttl {
            Some(ttl) => {
                let () = connection.pset_ex(key, value, millis(ttl)).await?;
            }
            None => {
                let () = connection.set(key, value).await?;
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut connection = self.connection.clone();
        let removed: usize = connection.del(key).await?;
        Ok(removed > 0)
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> StoreResult<bool> {
        let mut connection = self.connection.clone();
        let removed: i64 = ::redis::Script::new(COMPARE_AND_DELETE)
            .key(key)
            .arg(value)
            .invoke_async(&mut connection)
            .await?;
        Ok(removed > 0)
    }

    async fn expire_if_equals(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let mut connection = self.connection.clone();
        let updated: i64 = ::redis::Script::new(COMPARE_AND_EXPIRE)
            .key(key)
            .arg(value)
            .arg(millis(ttl))
            .invoke_async(&mut connection)
            .await?;
        Ok(updated > 0)
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let mut connection = self.connection.clone();
        Ok(connection.exists(key).await?)
    }

    async fn increment(&self, key: &str) -> StoreResult<i64> {
        let mut connection = self.connection.clone();
        Ok(connection.incr(key, 1_i64).await?)
    }

    async fn push(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<usize> {
        let mut connection = self.connection.clone();
        let (len,): (usize,) = ::redis::pipe()
            .atomic()
            .rpush(key, value)
            .cmd("PEXPIRE")
            .arg(key)
            .arg(millis(ttl))
            .ignore()
            .query_async(&mut connection)
            .await?;
        Ok(len)
    }

    async fn drain(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut connection = self.connection.clone();
        let (items,): (Vec<String>,) = ::redis::pipe()
            .atomic()
            .lrange(key, 0, -1)
            .del(key)
            .ignore()
            .query_async(&mut connection)
            .await?;
        Ok(items)
    }

    async fn len(&self, key: &str) -> StoreResult<usize> {
        let mut connection = self.connection.clone();
        Ok(connection.llen(key).await?)
    }

    async fn keys(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let mut connection = self.connection.clone();
        let mut keys = Vec::new();
        {
            let mut iter = connection
                .scan_match::<_, String>(glob_escape(prefix))
                .await?;
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_escape_quotes_metacharacters() {
        assert_eq!(glob_escape("relaybot:batch:"), "relaybot:batch:*");
        assert_eq!(glob_escape("a*b?[c]"), r"a\*b\?\[c\]*");
    }

    #[test]
    fn ttl_rounds_up_to_one_millisecond() {
        assert_eq!(millis(Duration::ZERO), 1);
        assert_eq!(millis(Duration::from_secs(2)), 2000);
    }
}
